use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{parse_cell, DataRow, StatisticsSource};
use crate::config::{CensusConfig, RequestConfig};
use crate::error::{DataSourceError, DataSourceResult};
use crate::indicators::IndicatorCatalog;
use crate::retry::{RetryError, RetryPolicy};

/// The ACS API accepts 50 `get` variables; NAME takes one slot and one is
/// kept spare.
pub const MAX_VARIABLES_PER_REQUEST: usize = 48;

/// Client for the Census ACS 5-year API
#[derive(Clone)]
pub struct CensusClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    request_config: RequestConfig,
    retry: RetryPolicy,
    /// Held for the duration of each HTTP request so calls never overlap.
    gate: Arc<Mutex<()>>,
}

impl CensusClient {
    /// Create a new Census API client
    pub fn new(config: &CensusConfig, request_config: RequestConfig) -> DataSourceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(DataSourceError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            retry: RetryPolicy::from_config(&request_config),
            request_config,
            gate: Arc::new(Mutex::new(())),
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn dataset_url(&self, year: u16) -> String {
        format!("{}/data/{}/acs/acs5", self.base_url, year)
    }

    /// GET with retry, returning the response body.
    async fn get_text(&self, operation: &str, url: &str, query: &[(&str, String)]) -> DataSourceResult<String> {
        self.retry
            .run(operation, || self.execute_request(url, query))
            .await
            .map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::Exhausted { last, retries } => DataSourceError::Unavailable {
                    message: last.to_string(),
                    retries,
                },
            })
    }

    /// Execute a single request (internal)
    async fn execute_request(&self, url: &str, query: &[(&str, String)]) -> DataSourceResult<String> {
        let _turn = self.gate.lock().await;

        let mut request = self.client.get(url).query(query);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DataSourceError::Timeout {
                    timeout_ms: self.request_config.timeout_ms,
                }
            } else {
                DataSourceError::Http(e)
            }
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let header = response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok());
            return Err(DataSourceError::Throttled {
                retry_after_ms: retry_after_ms(header, self.request_config.retry_delay_ms),
            });
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(DataSourceError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response.text().await.map_err(|e| DataSourceError::InvalidResponse {
            message: format!("Failed to read response body: {}", e),
        })
    }
}

/// Wait requested by a `Retry-After` header given in seconds.
fn retry_after_ms(header: Option<&str>, fallback_ms: u64) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(fallback_ms)
}

/// Convert the API's array-of-arrays table into rows.
fn parse_table(body: &str, indicators: &[String]) -> DataSourceResult<Vec<DataRow>> {
    // No matching tracts comes back as an empty body.
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let table: Vec<Vec<serde_json::Value>> =
        serde_json::from_str(body).map_err(|e| DataSourceError::InvalidResponse {
            message: format!("Failed to parse data table: {}", e),
        })?;

    let mut table = table.into_iter();
    let Some(header) = table.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header
        .iter()
        .map(|h| h.as_str().unwrap_or_default().to_string())
        .collect();

    let column = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| DataSourceError::InvalidResponse {
                message: format!("Data table has no '{}' column", name),
            })
    };
    let name_col = column("NAME")?;
    let state_col = column("state")?;
    let county_col = column("county")?;
    let tract_col = column("tract")?;
    let value_cols: Vec<(String, Option<usize>)> = indicators
        .iter()
        .map(|id| (id.clone(), header.iter().position(|h| h == id)))
        .collect();

    let text = |row: &[serde_json::Value], col: usize| {
        row.get(col)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let rows = table
        .map(|row| {
            let geoid = format!(
                "{}{}{}",
                text(&row, state_col),
                text(&row, county_col),
                text(&row, tract_col)
            );
            let values = value_cols
                .iter()
                .map(|(id, col)| {
                    let value = col.and_then(|c| row.get(c)).and_then(parse_cell);
                    (id.clone(), value)
                })
                .collect();
            DataRow {
                geoid,
                name: text(&row, name_col),
                values,
            }
        })
        .collect();

    Ok(rows)
}

#[async_trait]
impl StatisticsSource for CensusClient {
    async fn fetch_catalog(&self, year: u16) -> DataSourceResult<IndicatorCatalog> {
        let url = format!("{}/variables.json", self.dataset_url(year));
        let body = self
            .get_text(&format!("census:catalog:{}", year), &url, &[])
            .await?;
        let catalog = IndicatorCatalog::from_variables_json(&body)?;
        info!(year, indicators = catalog.len(), "Fetched indicator catalog");
        Ok(catalog)
    }

    async fn fetch_rows(
        &self,
        year: u16,
        state: &str,
        regions: &[String],
        indicators: &[String],
    ) -> DataSourceResult<Vec<DataRow>> {
        let mut ids: Vec<String> = indicators.to_vec();
        ids.sort();
        ids.dedup();

        let scope = if regions.is_empty() {
            format!("state:{}", state)
        } else {
            format!("state:{} county:{}", state, regions.join(","))
        };
        let url = self.dataset_url(year);

        let mut merged: BTreeMap<String, DataRow> = BTreeMap::new();
        for (batch_index, batch) in ids.chunks(MAX_VARIABLES_PER_REQUEST).enumerate() {
            let get = std::iter::once("NAME".to_string())
                .chain(batch.iter().cloned())
                .collect::<Vec<_>>()
                .join(",");
            let query = [
                ("get", get),
                ("for", "tract:*".to_string()),
                ("in", scope.clone()),
            ];
            debug!(year, scope = %scope, batch = batch_index, variables = batch.len(), "Fetching data rows");

            let body = self
                .get_text(&format!("census:rows:{}", year), &url, &query)
                .await?;
            for row in parse_table(&body, batch)? {
                match merged.get_mut(&row.geoid) {
                    Some(existing) => existing.values.extend(row.values),
                    None => {
                        merged.insert(row.geoid.clone(), row);
                    }
                }
            }
        }

        info!(year, scope = %scope, rows = merged.len(), variables = ids.len(), "Fetched data rows");
        Ok(merged.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = CensusConfig {
            base_url: "https://api.census.gov/".to_string(),
            ..CensusConfig::default()
        };
        let client = CensusClient::new(&config, RequestConfig::default()).unwrap();
        assert_eq!(client.base_url(), "https://api.census.gov");
        assert_eq!(client.dataset_url(2023), "https://api.census.gov/data/2023/acs/acs5");
    }

    #[test]
    fn test_parse_table() {
        let body = r#"[
            ["NAME","B01003_001E","state","county","tract"],
            ["Census Tract 17; Orleans Parish; Louisiana","2500","22","071","001700"],
            ["Census Tract 18; Orleans Parish; Louisiana","-666666666","22","071","001800"]
        ]"#;
        let rows = parse_table(body, &["B01003_001E".to_string()]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].geoid, "22071001700");
        assert_eq!(rows[0].value("B01003_001E"), Some(2500.0));
        assert_eq!(rows[1].value("B01003_001E"), None);
    }

    #[test]
    fn test_parse_table_requires_geography_columns() {
        let body = r#"[["NAME","B01003_001E"],["x","1"]]"#;
        let err = parse_table(body, &["B01003_001E".to_string()]).unwrap_err();
        assert!(matches!(err, DataSourceError::InvalidResponse { .. }));
    }

    #[test]
    fn test_retry_after_header() {
        assert_eq!(retry_after_ms(Some(" 2 "), 500), 2000);
        assert_eq!(retry_after_ms(Some("Wed, 21 Oct 2015 07:28:00 GMT"), 500), 500);
        assert_eq!(retry_after_ms(None, 500), 500);
        assert_eq!(retry_after_ms(Some(u64::MAX.to_string().as_str()), 500), u64::MAX);
    }

    #[test]
    fn test_empty_body_means_no_rows() {
        assert!(parse_table("", &[]).unwrap().is_empty());
    }
}
