//! Indicator catalog, derived metrics and measure resolution.
//!
//! Base indicators come from the ACS variables catalog. Derived indicators
//! are computed per row from base values with a fixed [`Formula`] and are
//! never fetched as columns of their own.

mod catalog;
mod derived;
mod resolver;

pub use catalog::{clean_label, Indicator, IndicatorCatalog, Scale};
pub use derived::{
    DerivedIndicator, DerivedRegistry, Formula, FormulaTerm, Operand, Operator, DERIVED_PREFIX,
};
pub use resolver::{
    normalize_measure, score_indicator, token_set_ratio, Choice, Disambiguator,
    IndicatorCandidate, IndicatorResolution, IndicatorResolver, LlmDisambiguator,
    SelectionMethod,
};
