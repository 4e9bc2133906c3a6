use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DataSourceError, DataSourceResult};

/// Value scale of an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// Counts, dollars, areas: compared as-is.
    Raw,
    /// Percentage points in [0, 100].
    Percentage,
}

/// One base indicator from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    /// Variable id, e.g. `B19013_001E`.
    pub id: String,
    /// Cleaned label.
    pub label: String,
    pub concept: String,
    /// Table prefix, e.g. `B19013`.
    pub table: String,
    pub description: String,
    pub scale: Scale,
}

impl Indicator {
    /// Build an indicator from raw catalog metadata.
    pub fn from_metadata(id: &str, label: &str, concept: &str) -> Self {
        let clean = clean_label(label);
        let percent = has_percent_marker(label) || has_percent_marker(concept);
        Self {
            id: id.to_string(),
            description: describe(id, &clean, concept),
            label: clean,
            concept: concept.to_string(),
            table: table_prefix(id).to_string(),
            scale: if percent { Scale::Percentage } else { Scale::Raw },
        }
    }

    /// Whether this is the main or total estimate of its table.
    pub fn is_main_estimate(&self) -> bool {
        self.id.ends_with("_001E")
    }
}

/// Snapshot of the indicator catalog.
///
/// Serializes as the plain indicator list; the id index is rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Indicator>", into = "Vec<Indicator>")]
pub struct IndicatorCatalog {
    indicators: Vec<Indicator>,
    index: HashMap<String, usize>,
}

impl From<Vec<Indicator>> for IndicatorCatalog {
    fn from(indicators: Vec<Indicator>) -> Self {
        Self::new(indicators)
    }
}

impl From<IndicatorCatalog> for Vec<Indicator> {
    fn from(catalog: IndicatorCatalog) -> Self {
        catalog.indicators
    }
}

#[derive(Deserialize)]
struct VariablesDocument {
    variables: HashMap<String, VariableMeta>,
}

#[derive(Deserialize)]
struct VariableMeta {
    #[serde(default)]
    label: String,
    #[serde(default)]
    concept: String,
    #[serde(rename = "predicateType")]
    predicate_type: Option<String>,
}

impl IndicatorCatalog {
    /// Build a catalog; indicators are kept in id order.
    pub fn new(mut indicators: Vec<Indicator>) -> Self {
        indicators.sort_by(|a, b| a.id.cmp(&b.id));
        indicators.dedup_by(|a, b| a.id == b.id);
        let index = indicators
            .iter()
            .enumerate()
            .map(|(i, ind)| (ind.id.clone(), i))
            .collect();
        Self { indicators, index }
    }

    /// Parse an ACS `variables.json` document, keeping numeric estimates only.
    pub fn from_variables_json(body: &str) -> DataSourceResult<Self> {
        let document: VariablesDocument =
            serde_json::from_str(body).map_err(|e| DataSourceError::InvalidResponse {
                message: format!("variables document: {}", e),
            })?;

        let indicators = document
            .variables
            .into_iter()
            .filter(|(id, meta)| {
                is_estimate_variable(id)
                    && matches!(meta.predicate_type.as_deref(), Some("int") | Some("float"))
            })
            .map(|(id, meta)| Indicator::from_metadata(&id, &meta.label, &meta.concept))
            .collect();

        Ok(Self::new(indicators))
    }

    pub fn get(&self, id: &str) -> Option<&Indicator> {
        self.index.get(id).and_then(|&i| self.indicators.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter()
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }
}

/// Strip `Estimate!!`/`Annotation!!` prefixes and `!!` separators.
pub fn clean_label(label: &str) -> String {
    label
        .replace("Estimate!!", "")
        .replace("Annotation!!", "")
        .replace("!!", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<TABLE>_<digits>E`, e.g. `B19013_001E` or `DP03_0062E`.
fn is_estimate_variable(id: &str) -> bool {
    let Some((table, suffix)) = id.split_once('_') else {
        return false;
    };
    let Some(digits) = suffix.strip_suffix('E') else {
        return false;
    };
    table.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && table.chars().all(|c| c.is_ascii_alphanumeric())
        && !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
}

/// Leading letters then digits: `B01001A_001E` gives `B01001`.
fn table_prefix(id: &str) -> &str {
    let letters = id.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    let digits = id[letters..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .count();
    &id[..letters + digits]
}

fn has_percent_marker(text: &str) -> bool {
    text.contains('%') || text.to_lowercase().contains("percent")
}

fn category(table: &str) -> Option<&'static str> {
    const CATEGORIES: &[(&str, &str)] = &[
        ("B01", "Population and Age"),
        ("B02", "Race"),
        ("B03", "Hispanic/Latino Origin"),
        ("B17", "Poverty Status"),
        ("B19", "Income"),
        ("B23", "Employment Status"),
        ("B25", "Housing Characteristics"),
    ];
    CATEGORIES
        .iter()
        .find(|(prefix, _)| table.starts_with(prefix))
        .map(|(_, name)| *name)
}

fn describe(id: &str, clean: &str, concept: &str) -> String {
    let mut parts = Vec::new();
    if !clean.is_empty() {
        parts.push(format!("Measures: {}", clean));
    }

    let concept = clean_label(concept);
    if !concept.is_empty() && !clean.to_lowercase().contains(&concept.to_lowercase()) {
        parts.push(format!("Context: {}", concept));
    }

    if let Some(name) = category(id) {
        parts.push(format!("Category: {}", name));
    }
    if id.ends_with("_001E") {
        parts.push("Type: Main estimate or total".to_string());
    }

    if parts.is_empty() {
        clean.to_string()
    } else {
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARIABLES: &str = r#"{
        "variables": {
            "for": {"label": "Census API FIPS 'for' clause", "concept": "Census API Geography Specification", "predicateType": "fips-for"},
            "B19013_001E": {"label": "Estimate!!Median household income in the past 12 months (in 2023 inflation-adjusted dollars)", "concept": "Median Household Income in the Past 12 Months (in 2023 Inflation-Adjusted Dollars)", "predicateType": "int"},
            "B19013_001EA": {"label": "Annotation of Estimate!!Median household income", "concept": "Median Household Income", "predicateType": "string"},
            "B19013_001M": {"label": "Margin of Error!!Median household income", "concept": "Median Household Income", "predicateType": "int"},
            "DP03_0128PE": {"label": "Percent!!PERCENTAGE OF FAMILIES AND PEOPLE WHOSE INCOME IN THE PAST 12 MONTHS IS BELOW THE POVERTY LEVEL!!All people", "concept": "Selected Economic Characteristics", "predicateType": "float"},
            "DP03_0009E": {"label": "Estimate!!EMPLOYMENT STATUS!!Civilian labor force!!Unemployment Rate", "concept": "Selected Economic Characteristics (%)", "predicateType": "float"},
            "B01003_001E": {"label": "Estimate!!Total", "concept": "Total Population", "predicateType": "int"}
        }
    }"#;

    #[test]
    fn test_from_variables_json_keeps_numeric_estimates() {
        let catalog = IndicatorCatalog::from_variables_json(VARIABLES).unwrap();
        let ids: Vec<&str> = catalog.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["B01003_001E", "B19013_001E", "DP03_0009E"]);
    }

    #[test]
    fn test_indicator_fields() {
        let catalog = IndicatorCatalog::from_variables_json(VARIABLES).unwrap();
        let income = catalog.get("B19013_001E").unwrap();
        assert_eq!(
            income.label,
            "Median household income in the past 12 months (in 2023 inflation-adjusted dollars)"
        );
        assert_eq!(income.table, "B19013");
        assert_eq!(income.scale, Scale::Raw);
        assert!(income.is_main_estimate());
        assert!(income.description.contains("Category: Income"));
        assert!(income.description.contains("Type: Main estimate or total"));

        let unemployment = catalog.get("DP03_0009E").unwrap();
        assert_eq!(unemployment.scale, Scale::Percentage);
        assert_eq!(unemployment.table, "DP03");
    }

    #[test]
    fn test_invalid_document() {
        let err = IndicatorCatalog::from_variables_json("{\"nope\": 1}").unwrap_err();
        assert!(matches!(err, DataSourceError::InvalidResponse { .. }));
    }

    #[test]
    fn test_clean_label() {
        assert_eq!(clean_label("Estimate!!Total!!Population"), "Total Population");
        assert_eq!(clean_label("  Annotation!!Median  age "), "Median age");
    }

    #[test]
    fn test_table_prefix() {
        assert_eq!(table_prefix("B01001A_001E"), "B01001");
        assert_eq!(table_prefix("S1701_C03_001E"), "S1701");
    }

    #[test]
    fn test_restored_snapshot_is_indexed() {
        let catalog = IndicatorCatalog::from_variables_json(VARIABLES).unwrap();
        let json = serde_json::to_string(&catalog).unwrap();
        assert!(json.starts_with('['));
        let restored: IndicatorCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), 3);
        assert!(restored.get("B01003_001E").is_some());
    }
}
