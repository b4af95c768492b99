//! Registry-side entities. The registry serves these as loosely typed
//! attribute maps; they are pinned down to explicit structs here so a
//! malformed response fails at the boundary instead of inside aggregation.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::vocab;

/// Matches the two-letter country code embedded in registry identifiers,
/// e.g. `bbmri-eric:ID:DE_12345`.
fn country_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^:]+:ID:([A-Za-z]{2})_").expect("static pattern"))
}

/// Extracts the uppercased country code from a collection or biobank id.
pub fn extract_country_code(id: &str) -> Result<String, SyncError> {
    country_pattern()
        .captures(id)
        .and_then(|caps| caps.get(1))
        .map(|code| code.as_str().to_uppercase())
        .ok_or_else(|| SyncError::InvalidCollectionId(id.to_string()))
}

/// Everything after the last `:` of a registry identifier, used when
/// deriving synthetic fact ids.
pub fn id_suffix(id: &str) -> &str {
    id.rsplit(':').next().unwrap_or(id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub biobank: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub number_of_donors: u64,
    #[serde(default)]
    pub order_of_magnitude: u32,
    #[serde(default)]
    pub order_of_magnitude_donors: u32,
    #[serde(default)]
    pub sex: Vec<String>,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub storage_temperatures: Vec<String>,
    #[serde(default)]
    pub diagnosis_available: Vec<String>,
}

impl Collection {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.order_of_magnitude = order_of_magnitude(size);
    }

    pub fn set_number_of_donors(&mut self, donors: u64) {
        self.number_of_donors = donors;
        self.order_of_magnitude_donors = order_of_magnitude(donors);
    }

    /// Replaces the sex list with the deduplicated, converted values.
    pub fn set_sex(&mut self, values: impl IntoIterator<Item = String>) {
        self.sex = dedup(values.into_iter().map(|value| vocab::convert_sex(&value)));
    }

    pub fn set_materials<'a>(&mut self, values: impl IntoIterator<Item = Option<&'a str>>) {
        self.materials = dedup(values.into_iter().filter_map(vocab::convert_material));
    }

    pub fn set_storage_temperatures<'a>(
        &mut self,
        values: impl IntoIterator<Item = Option<&'a str>>,
    ) {
        self.storage_temperatures = dedup(
            values
                .into_iter()
                .filter_map(vocab::convert_storage_temperature),
        );
    }

    pub fn set_diagnosis_available<'a>(&mut self, values: impl IntoIterator<Item = Option<&'a str>>) {
        self.diagnosis_available = dedup(values.into_iter().filter_map(vocab::convert_diagnosis));
    }
}

/// Number of decimal digits minus one; zero for an empty collection.
pub fn order_of_magnitude(count: u64) -> u32 {
    let mut magnitude = 0;
    let mut remaining = count / 10;
    while remaining > 0 {
        magnitude += 1;
        remaining /= 10;
    }
    magnitude
}

fn dedup(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for value in values {
        if seen.insert(value.clone()) {
            out.push(value);
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Biobank {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}
