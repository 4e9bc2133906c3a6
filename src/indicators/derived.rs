//! Derived indicators: statistics computed per row from base indicators.

use serde::{Deserialize, Serialize};

use super::catalog::Scale;

/// Prefix of derived indicator ids.
pub const DERIVED_PREFIX: &str = "derived:";

/// Value a formula term reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// A base indicator value from the fetched row.
    Indicator(String),
    /// Land area of the row's tract in km².
    RegionArea,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// One `(operand, operator)` step, applied to the running value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaTerm {
    pub operand: Operand,
    pub operator: Operator,
}

/// Left fold of terms starting from zero, then scaled by `multiplier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub terms: Vec<FormulaTerm>,
    pub multiplier: f64,
}

impl Formula {
    /// `numerator / denominator * multiplier`.
    pub fn ratio(numerator: &str, denominator: &str, multiplier: f64) -> Self {
        Self {
            terms: vec![
                FormulaTerm {
                    operand: Operand::Indicator(numerator.to_string()),
                    operator: Operator::Add,
                },
                FormulaTerm {
                    operand: Operand::Indicator(denominator.to_string()),
                    operator: Operator::Divide,
                },
            ],
            multiplier,
        }
    }

    /// `numerator / region area`.
    pub fn per_area(numerator: &str) -> Self {
        Self {
            terms: vec![
                FormulaTerm {
                    operand: Operand::Indicator(numerator.to_string()),
                    operator: Operator::Add,
                },
                FormulaTerm {
                    operand: Operand::RegionArea,
                    operator: Operator::Divide,
                },
            ],
            multiplier: 1.0,
        }
    }

    /// Base indicator ids the formula reads, in term order.
    pub fn base_indicators(&self) -> Vec<&str> {
        self.terms
            .iter()
            .filter_map(|t| match &t.operand {
                Operand::Indicator(id) => Some(id.as_str()),
                Operand::RegionArea => None,
            })
            .collect()
    }

    pub fn needs_area(&self) -> bool {
        self.terms.iter().any(|t| t.operand == Operand::RegionArea)
    }

    /// Evaluate against one row.
    ///
    /// Returns `None` when any operand is missing or a divisor is zero.
    pub fn evaluate<F>(&self, value_of: F, area_km2: Option<f64>) -> Option<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let mut acc = 0.0;
        for term in &self.terms {
            let value = match &term.operand {
                Operand::Indicator(id) => value_of(id)?,
                Operand::RegionArea => area_km2?,
            };
            acc = match term.operator {
                Operator::Add => acc + value,
                Operator::Subtract => acc - value,
                Operator::Multiply => acc * value,
                Operator::Divide => {
                    if value == 0.0 {
                        return None;
                    }
                    acc / value
                }
            };
        }
        let result = acc * self.multiplier;
        result.is_finite().then_some(result)
    }
}

/// A named derived indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedIndicator {
    /// Registry name, e.g. `"poverty rate"`.
    pub name: String,
    pub label: String,
    pub description: String,
    pub synonyms: Vec<String>,
    pub formula: Formula,
    pub scale: Scale,
}

impl DerivedIndicator {
    /// Stable id, e.g. `derived:poverty_rate`.
    pub fn id(&self) -> String {
        format!("{}{}", DERIVED_PREFIX, self.name.replace(' ', "_"))
    }

    /// Whether `phrase` (lowercased, trimmed) names this indicator exactly.
    pub fn is_named(&self, phrase: &str) -> bool {
        self.name == phrase || self.synonyms.iter().any(|s| s == phrase)
    }
}

/// Fixed set of derived indicators.
#[derive(Debug, Clone)]
pub struct DerivedRegistry {
    indicators: Vec<DerivedIndicator>,
}

fn derived(
    name: &str,
    label: &str,
    description: &str,
    synonyms: &[&str],
    formula: Formula,
    scale: Scale,
) -> DerivedIndicator {
    DerivedIndicator {
        name: name.to_string(),
        label: label.to_string(),
        description: description.to_string(),
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        formula,
        scale,
    }
}

impl DerivedRegistry {
    pub fn new(indicators: Vec<DerivedIndicator>) -> Self {
        Self { indicators }
    }

    /// Built-in registry.
    pub fn standard() -> Self {
        Self::new(vec![
            derived(
                "population density",
                "Population Density (people per km²)",
                "Total population divided by tract land area",
                &[
                    "density",
                    "pop density",
                    "people per square kilometer",
                    "persons per km2",
                ],
                Formula::per_area("B01003_001E"),
                Scale::Raw,
            ),
            derived(
                "poverty rate",
                "Poverty Rate (%)",
                "People below the poverty level as a percentage of total population",
                &[
                    "poverty",
                    "percent in poverty",
                    "percent poverty",
                    "poverty percentage",
                ],
                Formula::ratio("B17001_002E", "B01001_001E", 100.0),
                Scale::Percentage,
            ),
            derived(
                "african american share",
                "African American Share (%)",
                "Black or African American alone as a percentage of total population",
                &[
                    "percent black",
                    "black share",
                    "percent african american",
                    "african american percentage",
                    "black population share",
                ],
                Formula::ratio("B02001_003E", "B02001_001E", 100.0),
                Scale::Percentage,
            ),
            derived(
                "unemployment rate",
                "Unemployment Rate (%)",
                "Unemployed as a percentage of the civilian labor force",
                &["unemployment", "percent unemployed", "jobless rate"],
                Formula::ratio("B23025_005E", "B23025_003E", 100.0),
                Scale::Percentage,
            ),
            derived(
                "hispanic share",
                "Hispanic or Latino Share (%)",
                "Hispanic or Latino population as a percentage of total population",
                &[
                    "percent hispanic",
                    "latino share",
                    "percent latino",
                    "hispanic percentage",
                ],
                Formula::ratio("B03003_003E", "B03003_001E", 100.0),
                Scale::Percentage,
            ),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivedIndicator> {
        self.indicators.iter()
    }

    /// Look up by id (`derived:...`).
    pub fn get(&self, id: &str) -> Option<&DerivedIndicator> {
        self.indicators.iter().find(|d| d.id() == id)
    }

    /// Exact name or synonym lookup.
    pub fn find_named(&self, phrase: &str) -> Option<&DerivedIndicator> {
        let phrase = phrase.trim().to_lowercase();
        self.indicators.iter().find(|d| d.is_named(&phrase))
    }
}

impl Default for DerivedRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_ratio_formula() {
        let formula = Formula::ratio("B17001_002E", "B01001_001E", 100.0);
        let row = values(&[("B17001_002E", 250.0), ("B01001_001E", 1000.0)]);
        let result = formula.evaluate(|id| row.get(id).copied(), None);
        assert_eq!(result, Some(25.0));
        assert_eq!(formula.base_indicators(), vec!["B17001_002E", "B01001_001E"]);
        assert!(!formula.needs_area());
    }

    #[test]
    fn test_per_area_formula() {
        let formula = Formula::per_area("B01003_001E");
        let row = values(&[("B01003_001E", 4000.0)]);
        assert!(formula.needs_area());
        assert_eq!(formula.evaluate(|id| row.get(id).copied(), Some(2.0)), Some(2000.0));
        assert_eq!(formula.evaluate(|id| row.get(id).copied(), None), None);
    }

    #[test]
    fn test_zero_divisor_yields_none() {
        let formula = Formula::ratio("A_001E", "A_002E", 100.0);
        let row = values(&[("A_001E", 5.0), ("A_002E", 0.0)]);
        assert_eq!(formula.evaluate(|id| row.get(id).copied(), None), None);
    }

    #[test]
    fn test_missing_operand_yields_none() {
        let formula = Formula::ratio("A_001E", "A_002E", 100.0);
        let row = values(&[("A_001E", 5.0)]);
        assert_eq!(formula.evaluate(|id| row.get(id).copied(), None), None);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = DerivedRegistry::standard();
        let poverty = registry.find_named("  Poverty Rate ").unwrap();
        assert_eq!(poverty.id(), "derived:poverty_rate");
        assert_eq!(poverty.scale, Scale::Percentage);

        let share = registry.find_named("percent black").unwrap();
        assert_eq!(share.name, "african american share");

        assert!(registry.get("derived:population_density").is_some());
        assert!(registry.find_named("median income").is_none());
    }

    #[test]
    fn test_registry_formulas_read_at_least_two_values() {
        for indicator in DerivedRegistry::standard().iter() {
            let inputs = indicator.formula.base_indicators().len()
                + usize::from(indicator.formula.needs_area());
            assert!(inputs >= 2, "{}", indicator.name);
        }
    }
}
