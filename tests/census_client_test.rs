//! Integration tests for the Census ACS and Gazetteer clients
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use serde_json::{json, Value};
use wiremock::{
    matchers::{method, path, query_param},
    Match, Mock, MockServer, Request, ResponseTemplate,
};

use census_query_resolver::census::{
    CensusClient, GazetteerClient, GeometrySource, StatisticsSource, MAX_VARIABLES_PER_REQUEST,
};
use census_query_resolver::config::{CensusConfig, RequestConfig};
use census_query_resolver::error::DataSourceError;

const DATASET_PATH: &str = "/data/2023/acs/acs5";

fn census_config(base_url: &str) -> CensusConfig {
    CensusConfig {
        base_url: base_url.to_string(),
        gazetteer_base_url: base_url.to_string(),
        ..CensusConfig::default()
    }
}

fn request_config(max_retries: u32) -> RequestConfig {
    RequestConfig {
        timeout_ms: 5000,
        max_retries,
        retry_delay_ms: 10,
    }
}

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str) -> CensusClient {
    CensusClient::new(&census_config(base_url), request_config(0)).expect("Failed to create client")
}

/// Matches requests whose `get` list includes a variable.
struct GetIncludes(&'static str);

impl Match for GetIncludes {
    fn matches(&self, request: &Request) -> bool {
        request
            .url
            .query_pairs()
            .any(|(k, v)| k == "get" && v.split(',').any(|id| id == self.0))
    }
}

/// ACS-style table: header row then one row per tract.
fn table(ids: &[String], tracts: &[(&str, &str)], value: impl Fn(&str, &str) -> Value) -> Value {
    let mut header = vec![json!("NAME")];
    header.extend(ids.iter().map(|id| json!(id)));
    header.extend([json!("state"), json!("county"), json!("tract")]);

    let mut rows = vec![Value::Array(header)];
    for (county, tract) in tracts {
        let mut row = vec![json!(format!(
            "Census Tract {}; {} Parish; Louisiana",
            tract.trim_start_matches('0'),
            if *county == "071" { "Orleans" } else { "Caddo" }
        ))];
        row.extend(ids.iter().map(|id| value(id, tract)));
        row.extend([json!("22"), json!(county), json!(tract)]);
        rows.push(Value::Array(row));
    }
    Value::Array(rows)
}

#[cfg(test)]
mod data_row_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_fetch_rows_for_region() {
        let mock_server = MockServer::start().await;
        let ids = vec!["B19013_001E".to_string()];

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .and(query_param("get", "NAME,B19013_001E"))
            .and(query_param("for", "tract:*"))
            .and(query_param("in", "state:22 county:071"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(
                &ids,
                &[("071", "000100"), ("071", "000200")],
                |_, tract| match tract {
                    "000100" => json!("41250"),
                    _ => json!("-666666666"),
                },
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let rows = client
            .fetch_rows(2023, "22", &["071".to_string()], &ids)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].geoid, "22071000100");
        assert_eq!(rows[0].value("B19013_001E"), Some(41250.0));
        assert_eq!(rows[0].region_code(), Some("071"));
        assert_eq!(
            rows[0].name_parts(),
            ("Census Tract 100".to_string(), Some("Orleans Parish".to_string()))
        );
        // Sentinel cells are missing values
        assert_eq!(rows[1].value("B19013_001E"), None);
    }

    #[tokio::test]
    async fn test_statewide_scope_and_multiple_regions() {
        let mock_server = MockServer::start().await;
        let ids = vec!["B01003_001E".to_string()];

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .and(query_param("in", "state:22"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(
                &ids,
                &[("017", "000100"), ("071", "000100")],
                |_, _| json!(3000),
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .and(query_param("in", "state:22 county:017,071"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(
                &ids,
                &[("017", "000100"), ("071", "000100")],
                |_, _| json!("3000"),
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let statewide = client.fetch_rows(2023, "22", &[], &ids).await.unwrap();
        let both = client
            .fetch_rows(2023, "22", &["017".to_string(), "071".to_string()], &ids)
            .await
            .unwrap();

        assert_eq!(statewide, both);
        assert_eq!(statewide.len(), 2);
    }

    #[tokio::test]
    async fn test_wide_requests_are_batched_and_merged() {
        let mock_server = MockServer::start().await;
        let ids: Vec<String> = (1..=50).map(|i| format!("B01001_{:03}E", i)).collect();
        let (first, second) = ids.split_at(MAX_VARIABLES_PER_REQUEST);
        let tracts = [("071", "000100"), ("071", "000200")];

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .and(GetIncludes("B01001_001E"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(table(first, &tracts, |_, _| json!("1"))),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .and(GetIncludes("B01001_049E"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(table(second, &tracts, |_, _| json!("2"))),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        // Duplicates and order do not change the batches
        let mut requested = ids.clone();
        requested.reverse();
        requested.push("B01001_007E".to_string());
        let rows = client
            .fetch_rows(2023, "22", &["071".to_string()], &requested)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.values.len(), 50);
            assert_eq!(row.value("B01001_048E"), Some(1.0));
            assert_eq!(row.value("B01001_049E"), Some(2.0));
        }
    }

    #[tokio::test]
    async fn test_empty_body_means_no_tracts() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let rows = client
            .fetch_rows(2023, "22", &["999".to_string()], &["B19013_001E".to_string()])
            .await
            .unwrap();

        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_api_key_is_sent() {
        let mock_server = MockServer::start().await;
        let ids = vec!["B19013_001E".to_string()];

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .and(query_param("key", "secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(
                &ids,
                &[("071", "000100")],
                |_, _| json!("50000"),
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = CensusConfig {
            api_key: Some("secret-key".to_string()),
            ..census_config(&mock_server.uri())
        };
        let client = CensusClient::new(&config, request_config(0)).unwrap();
        let rows = client.fetch_rows(2023, "22", &[], &ids).await.unwrap();

        assert_eq!(rows.len(), 1);
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("error: unknown variable 'B99999_001E'"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = CensusClient::new(&census_config(&mock_server.uri()), request_config(3)).unwrap();
        let result = client
            .fetch_rows(2023, "22", &[], &["B99999_001E".to_string()])
            .await;

        match result {
            Err(DataSourceError::Api { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("unknown variable"));
            }
            other => panic!("Expected Api error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test]
    async fn test_throttled_request_is_retried() {
        let mock_server = MockServer::start().await;
        let ids = vec!["B19013_001E".to_string()];

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(
                &ids,
                &[("071", "000100")],
                |_, _| json!("1"),
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = CensusClient::new(&census_config(&mock_server.uri()), request_config(2)).unwrap();
        let rows = client.fetch_rows(2023, "22", &[], &ids).await.unwrap();

        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_server_error_exhausts_retries() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&mock_server)
            .await;

        let client = CensusClient::new(&census_config(&mock_server.uri()), request_config(2)).unwrap();
        let result = client
            .fetch_rows(2023, "22", &[], &["B19013_001E".to_string()])
            .await;

        assert!(matches!(
            result,
            Err(DataSourceError::Unavailable { retries: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_geography_columns_is_invalid() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(DATASET_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([["NAME", "B19013_001E"], ["Louisiana", "57852"]])),
            )
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client
            .fetch_rows(2023, "22", &[], &["B19013_001E".to_string()])
            .await;

        assert!(matches!(result, Err(DataSourceError::InvalidResponse { .. })));
    }
}

#[cfg(test)]
mod catalog_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_fetch_catalog() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(format!("{}/variables.json", DATASET_PATH)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "variables": {
                    "B19013_001E": {
                        "label": "Estimate!!Median household income in the past 12 months (in 2023 inflation-adjusted dollars)",
                        "concept": "Median Household Income in the Past 12 Months (in 2023 Inflation-Adjusted Dollars)",
                        "predicateType": "int"
                    },
                    "B19013_001M": {
                        "label": "Margin of Error!!Median household income",
                        "concept": "Median Household Income",
                        "predicateType": "int"
                    },
                    "NAME": {
                        "label": "Geographic Area Name",
                        "predicateType": "string"
                    },
                    "for": {
                        "label": "Census API FIPS 'for' clause",
                        "predicateType": "fips-for"
                    }
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let catalog = client.fetch_catalog(2023).await.unwrap();

        assert_eq!(catalog.len(), 1);
        let income = catalog.get("B19013_001E").unwrap();
        assert_eq!(income.table, "B19013");
        assert!(income.label.starts_with("Median household income"));
    }

    #[tokio::test]
    async fn test_malformed_catalog_is_invalid() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(format!("{}/variables.json", DATASET_PATH)))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client.fetch_catalog(2023).await;

        assert!(matches!(result, Err(DataSourceError::InvalidResponse { .. })));
    }
}

#[cfg(test)]
mod gazetteer_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GAZETTEER_PATH: &str =
        "/geo/docs/maps-data/data/gazetteer/2024_Gazetteer/2024_gaz_tracts_22.txt";

    #[tokio::test]
    async fn test_fetch_region_areas() {
        let mock_server = MockServer::start().await;
        let body = "USPS\tGEOID\tALAND\tAWATER\tALAND_SQMI\tAWATER_SQMI\tINTPTLAT\tINTPTLONG    \n\
LA\t22071000100\t1500000\t20000\t0.579\t0.008\t29.96\t-90.07\n\
LA\t22017000100\t8000000\t0\t3.089\t0\t32.51\t-93.74\n";

        Mock::given(method("GET"))
            .and(path(GAZETTEER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client =
            GazetteerClient::new(&census_config(&mock_server.uri()), request_config(0)).unwrap();
        let areas = client.fetch_region_areas(2024, "22").await.unwrap();

        assert_eq!(areas.len(), 2);
        assert_eq!(areas.get("22071000100"), Some(&1.5));
        assert_eq!(areas.get("22017000100"), Some(&8.0));
    }

    #[tokio::test]
    async fn test_missing_file_is_api_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(GAZETTEER_PATH))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client =
            GazetteerClient::new(&census_config(&mock_server.uri()), request_config(2)).unwrap();
        let result = client.fetch_region_areas(2024, "22").await;

        assert!(matches!(
            result,
            Err(DataSourceError::Api { status: 404, .. })
        ));
    }
}
