//! External data collaborators.
//!
//! [`StatisticsSource`] serves the indicator catalog and tract-level rows
//! (ACS 5-year API); [`GeometrySource`] serves tract land areas (Census
//! Gazetteer files). Both are traits so the pipeline can run against fakes.

mod client;
mod gazetteer;

pub use client::{CensusClient, MAX_VARIABLES_PER_REQUEST};
pub use gazetteer::{parse_gazetteer, GazetteerClient};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DataSourceResult;
use crate::indicators::IndicatorCatalog;

/// Census "not available" sentinels are large negative numbers
/// (-666666666, -999999999, ...).
pub const MISSING_VALUE_SENTINEL: f64 = -100_000_000.0;

/// One tract with the requested indicator values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    /// State + county + tract code, e.g. `22071001700`.
    pub geoid: String,
    /// Full display name as returned by the data source.
    pub name: String,
    /// `None` for sentinel or unparsable cells.
    pub values: BTreeMap<String, Option<f64>>,
}

impl DataRow {
    pub fn value(&self, indicator_id: &str) -> Option<f64> {
        self.values.get(indicator_id).copied().flatten()
    }

    /// County part of the GEOID.
    pub fn region_code(&self) -> Option<&str> {
        self.geoid.get(2..5)
    }

    /// Tract and region parts of the display name.
    pub fn name_parts(&self) -> (String, Option<String>) {
        split_tract_name(&self.name)
    }
}

/// Tract land areas in km², keyed by GEOID.
pub type RegionAreas = BTreeMap<String, f64>;

/// Parse one data cell. Sentinels and non-numeric text are missing values.
pub fn parse_cell(cell: &serde_json::Value) -> Option<f64> {
    let value = match cell {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if value <= MISSING_VALUE_SENTINEL || !value.is_finite() {
        None
    } else {
        Some(value)
    }
}

/// Split `"Census Tract 12; Orleans Parish; Louisiana"` (or the comma form)
/// into `("Census Tract 12", Some("Orleans Parish"))`.
pub fn split_tract_name(name: &str) -> (String, Option<String>) {
    let separator = if name.contains(';') { ';' } else { ',' };
    let mut parts = name.split(separator).map(str::trim).filter(|p| !p.is_empty());
    let tract = parts.next().unwrap_or(name).to_string();
    let region = parts.next().map(str::to_string);
    (tract, region)
}

/// Statistical-data retrieval collaborator.
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    /// Full indicator catalog of a release year.
    async fn fetch_catalog(&self, year: u16) -> DataSourceResult<IndicatorCatalog>;

    /// Tract rows for `indicators` within `regions` (empty means the whole state).
    async fn fetch_rows(
        &self,
        year: u16,
        state: &str,
        regions: &[String],
        indicators: &[String],
    ) -> DataSourceResult<Vec<DataRow>>;
}

/// Geometry/area collaborator.
#[async_trait]
pub trait GeometrySource: Send + Sync {
    async fn fetch_region_areas(&self, vintage: u16, state: &str) -> DataSourceResult<RegionAreas>;
}
