//! Geography resolution.
//!
//! Maps place phrases ("New Orleans", "st tammany", "Caddo Parish") to a
//! region code from a fixed directory using exact, alias and fuzzy matching.

mod directory;
mod resolver;

pub use directory::{normalize_place, DirectoryEntry, EntryKind, GeographyDirectory, Region};
pub use resolver::{GeographyResolver, MatchSource, PlaceHint, ResolvedGeography};
