use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::{GeometrySource, RegionAreas};
use crate::config::{CensusConfig, RequestConfig};
use crate::error::{DataSourceError, DataSourceResult};
use crate::retry::{RetryError, RetryPolicy};

const SQUARE_METERS_PER_KM2: f64 = 1_000_000.0;

/// Client for the Census Gazetteer tract files (land area per tract)
#[derive(Clone)]
pub struct GazetteerClient {
    client: Client,
    base_url: String,
    request_config: RequestConfig,
    retry: RetryPolicy,
}

impl GazetteerClient {
    pub fn new(config: &CensusConfig, request_config: RequestConfig) -> DataSourceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(DataSourceError::Http)?;

        Ok(Self {
            client,
            base_url: config.gazetteer_base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(&request_config),
            request_config,
        })
    }

    /// URL of the tract file for one state and vintage.
    pub fn tract_file_url(&self, vintage: u16, state: &str) -> String {
        format!(
            "{base}/geo/docs/maps-data/data/gazetteer/{v}_Gazetteer/{v}_gaz_tracts_{s}.txt",
            base = self.base_url,
            v = vintage,
            s = state
        )
    }

    async fn download(&self, url: &str) -> DataSourceResult<String> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DataSourceError::Timeout {
                    timeout_ms: self.request_config.timeout_ms,
                }
            } else {
                DataSourceError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(DataSourceError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response.text().await.map_err(|e| DataSourceError::InvalidResponse {
            message: format!("Failed to read gazetteer file: {}", e),
        })
    }
}

/// Parse a tab-separated gazetteer tract file into km² per GEOID.
///
/// Rows with an unparsable land area are skipped.
pub fn parse_gazetteer(body: &str) -> DataSourceResult<RegionAreas> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| DataSourceError::InvalidResponse {
        message: "Gazetteer file is empty".to_string(),
    })?;
    // Gazetteer headers carry trailing padding on the last column.
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let position = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| DataSourceError::InvalidResponse {
                message: format!("Gazetteer file has no '{}' column", name),
            })
    };
    let geoid_col = position("GEOID")?;
    let aland_col = position("ALAND")?;

    let mut areas = RegionAreas::new();
    let mut skipped = 0usize;
    for line in lines {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let geoid = fields.get(geoid_col).copied().unwrap_or_default();
        let aland = fields.get(aland_col).and_then(|v| v.parse::<f64>().ok());
        match aland {
            Some(m2) if !geoid.is_empty() => {
                areas.insert(geoid.to_string(), m2 / SQUARE_METERS_PER_KM2);
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "Skipped unreadable gazetteer rows");
    }
    Ok(areas)
}

#[async_trait]
impl GeometrySource for GazetteerClient {
    async fn fetch_region_areas(&self, vintage: u16, state: &str) -> DataSourceResult<RegionAreas> {
        let url = self.tract_file_url(vintage, state);
        debug!(url = %url, "Downloading gazetteer tract file");

        let body = self
            .retry
            .run(&format!("gazetteer:{}:{}", vintage, state), || self.download(&url))
            .await
            .map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::Exhausted { last, retries } => DataSourceError::Unavailable {
                    message: last.to_string(),
                    retries,
                },
            })?;

        let areas = parse_gazetteer(&body)?;
        info!(vintage, state, tracts = areas.len(), "Loaded tract land areas");
        Ok(areas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "USPS\tGEOID\tALAND\tAWATER\tALAND_SQMI\tAWATER_SQMI\tINTPTLAT\tINTPTLONG               \n\
LA\t22071001700\t2500000\t0\t0.965\t0\t29.96\t-90.07\n\
LA\t22071001800\tn/a\t0\t0\t0\t29.97\t-90.08\n\
LA\t22017000100\t12000000\t5000\t4.633\t0.002\t32.5\t-93.75\n";

    #[test]
    fn test_parse_gazetteer_converts_to_km2() {
        let areas = parse_gazetteer(SAMPLE).unwrap();
        assert_eq!(areas.len(), 2);
        assert_eq!(areas.get("22071001700"), Some(&2.5));
        assert_eq!(areas.get("22017000100"), Some(&12.0));
        assert!(areas.get("22071001800").is_none());
    }

    #[test]
    fn test_parse_gazetteer_requires_columns() {
        let err = parse_gazetteer("USPS\tNAME\nLA\tx\n").unwrap_err();
        assert!(matches!(err, DataSourceError::InvalidResponse { .. }));
        assert!(parse_gazetteer("").is_err());
    }

    #[test]
    fn test_tract_file_url() {
        let client = GazetteerClient::new(&CensusConfig::default(), RequestConfig::default()).unwrap();
        assert_eq!(
            client.tract_file_url(2024, "22"),
            "https://www2.census.gov/geo/docs/maps-data/data/gazetteer/2024_Gazetteer/2024_gaz_tracts_22.txt"
        );
    }
}
