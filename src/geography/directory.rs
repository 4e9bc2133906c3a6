//! Closed directory of Louisiana parishes, their aliases and major cities.

use serde::{Deserialize, Serialize};

/// A parish in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Three-digit county code, e.g. `"071"`.
    pub code: String,
    /// Short name, e.g. `"Orleans"`.
    pub name: String,
}

impl Region {
    /// Display name with the parish suffix, e.g. `"Orleans Parish"`.
    pub fn canonical_name(&self) -> String {
        format!("{} Parish", self.name)
    }
}

/// How a directory key relates to its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Canonical parish name (with or without the "Parish" suffix).
    Canonical,
    /// Alternate spelling of a parish name.
    Alias,
    /// City resolved through its containing parish.
    City,
}

/// A lookup key pointing at a region code.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Lowercased text as written in the directory.
    pub raw: String,
    /// Text after [`normalize_place`].
    pub normalized: String,
    pub code: String,
    pub kind: EntryKind,
}

const PARISHES: &[(&str, &str)] = &[
    ("001", "Acadia"),
    ("003", "Allen"),
    ("005", "Ascension"),
    ("007", "Assumption"),
    ("009", "Avoyelles"),
    ("011", "Beauregard"),
    ("013", "Bienville"),
    ("015", "Bossier"),
    ("017", "Caddo"),
    ("019", "Calcasieu"),
    ("021", "Caldwell"),
    ("023", "Cameron"),
    ("025", "Catahoula"),
    ("027", "Claiborne"),
    ("029", "Concordia"),
    ("031", "De Soto"),
    ("033", "East Baton Rouge"),
    ("035", "East Carroll"),
    ("037", "East Feliciana"),
    ("039", "Evangeline"),
    ("041", "Franklin"),
    ("043", "Grant"),
    ("045", "Iberia"),
    ("047", "Iberville"),
    ("049", "Jackson"),
    ("051", "Jefferson"),
    ("053", "Jefferson Davis"),
    ("055", "Lafayette"),
    ("057", "Lafourche"),
    ("059", "LaSalle"),
    ("061", "Lincoln"),
    ("063", "Livingston"),
    ("065", "Madison"),
    ("067", "Morehouse"),
    ("069", "Natchitoches"),
    ("071", "Orleans"),
    ("073", "Ouachita"),
    ("075", "Plaquemines"),
    ("077", "Pointe Coupee"),
    ("079", "Rapides"),
    ("081", "Red River"),
    ("083", "Richland"),
    ("085", "Sabine"),
    ("087", "St. Bernard"),
    ("089", "St. Charles"),
    ("091", "St. Helena"),
    ("093", "St. James"),
    ("095", "St. John the Baptist"),
    ("097", "St. Landry"),
    ("099", "St. Martin"),
    ("101", "St. Mary"),
    ("103", "St. Tammany"),
    ("105", "Tangipahoa"),
    ("107", "Tensas"),
    ("109", "Terrebonne"),
    ("111", "Union"),
    ("113", "Vermilion"),
    ("115", "Vernon"),
    ("117", "Washington"),
    ("119", "Webster"),
    ("121", "West Baton Rouge"),
    ("123", "West Carroll"),
    ("125", "West Feliciana"),
    ("127", "Winn"),
];

const ALIASES: &[(&str, &str)] = &[
    ("desoto", "031"),
    ("de soto", "031"),
    ("la salle", "059"),
    ("lasalle", "059"),
    ("ebr", "033"),
    ("st john", "095"),
    ("saint john", "095"),
    ("st. john", "095"),
    ("jeff davis", "053"),
    ("pointe coupée", "077"),
    ("vermillion", "113"),
];

const CITIES: &[(&str, &str)] = &[
    ("new orleans", "071"),
    ("nola", "071"),
    ("baton rouge", "033"),
    ("shreveport", "017"),
    ("lafayette", "055"),
    ("lake charles", "019"),
    ("kenner", "051"),
    ("metairie", "051"),
    ("marrero", "051"),
    ("harvey", "051"),
    ("gretna", "051"),
    ("westwego", "051"),
    ("bossier city", "015"),
    ("monroe", "073"),
    ("west monroe", "073"),
    ("alexandria", "079"),
    ("pineville", "079"),
    ("houma", "109"),
    ("new iberia", "045"),
    ("slidell", "103"),
    ("covington", "103"),
    ("mandeville", "103"),
    ("central", "033"),
    ("zachary", "033"),
    ("baker", "033"),
    ("ruston", "061"),
    ("sulphur", "019"),
    ("hammond", "105"),
    ("ponchatoula", "105"),
    ("bastrop", "067"),
    ("natchitoches", "069"),
    ("thibodaux", "057"),
    ("crowley", "001"),
    ("gonzales", "005"),
    ("donaldsonville", "005"),
    ("opelousas", "097"),
    ("eunice", "097"),
    ("washington", "097"),
    ("denham springs", "063"),
    ("morgan city", "101"),
    ("franklin", "101"),
    ("abbeville", "113"),
    ("bogalusa", "117"),
    ("minden", "119"),
    ("jennings", "053"),
    ("deridder", "011"),
    ("leesville", "115"),
    ("plaquemine", "047"),
    ("breaux bridge", "099"),
    ("st. martinville", "099"),
    ("jackson", "037"),
    ("chalmette", "087"),
    ("laplace", "095"),
    ("broussard", "055"),
    ("youngsville", "055"),
    ("carencro", "055"),
    ("port allen", "121"),
    ("ville platte", "039"),
    ("winnfield", "127"),
    ("jonesboro", "049"),
    ("homer", "027"),
    ("farmerville", "111"),
    ("mansfield", "031"),
    ("oakdale", "003"),
    ("marksville", "009"),
    ("vidalia", "029"),
    ("tallulah", "065"),
    ("lake providence", "035"),
    ("rayville", "083"),
    ("jena", "059"),
    ("st. francisville", "125"),
    ("belle chasse", "075"),
    ("new roads", "077"),
];

/// Names that are also everyday words; free-text scanning only accepts
/// them when followed by "parish".
pub(crate) const COMMON_WORD_NAMES: &[&str] = &[
    "allen", "baker", "cameron", "central", "franklin", "grant", "harvey", "homer", "jackson",
    "lincoln", "madison", "union", "vernon", "washington", "winn",
];

/// Normalize a place phrase for matching.
///
/// Lowercases, drops punctuation, expands `st`/`ste` to `saint`/`sainte`,
/// strips a leading "the" and trailing qualifiers such as "parish", "city",
/// "area", "louisiana".
pub fn normalize_place(phrase: &str) -> String {
    let cleaned: String = phrase
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<&str> = cleaned
        .split_whitespace()
        .map(|t| match t {
            "st" => "saint",
            "ste" => "sainte",
            other => other,
        })
        .collect();

    if tokens.first() == Some(&"the") {
        tokens.remove(0);
    }
    while let Some(last) = tokens.last() {
        if tokens.len() > 1
            && matches!(
                *last,
                "parish" | "city" | "area" | "county" | "region" | "louisiana" | "la"
            )
        {
            tokens.pop();
        } else {
            break;
        }
    }

    tokens.join(" ")
}

/// Directory of regions and lookup keys.
#[derive(Debug, Clone)]
pub struct GeographyDirectory {
    regions: Vec<Region>,
    entries: Vec<DirectoryEntry>,
}

impl GeographyDirectory {
    /// Build a directory from regions, aliases and cities.
    pub fn new(regions: Vec<Region>, aliases: &[(&str, &str)], cities: &[(&str, &str)]) -> Self {
        let mut entries = Vec::new();

        for region in &regions {
            for text in [region.name.to_lowercase(), region.canonical_name().to_lowercase()] {
                entries.push(DirectoryEntry {
                    normalized: normalize_place(&text),
                    raw: text,
                    code: region.code.clone(),
                    kind: EntryKind::Canonical,
                });
            }
        }

        for (list, kind) in [(aliases, EntryKind::Alias), (cities, EntryKind::City)] {
            for (text, code) in list {
                let raw = text.to_lowercase();
                entries.push(DirectoryEntry {
                    normalized: normalize_place(&raw),
                    raw,
                    code: code.to_string(),
                    kind,
                });
            }
        }

        Self { regions, entries }
    }

    /// The built-in Louisiana directory (64 parishes).
    pub fn louisiana() -> Self {
        let regions = PARISHES
            .iter()
            .map(|(code, name)| Region {
                code: code.to_string(),
                name: name.to_string(),
            })
            .collect();
        Self::new(regions, ALIASES, CITIES)
    }

    /// Look up a region by code.
    pub fn region(&self, code: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.code == code)
    }

    /// All regions in code order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// All lookup keys.
    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }
}
