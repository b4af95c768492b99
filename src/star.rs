//! Star-model aggregation: raw observation rows become a privacy-suppressed
//! fact table broken down by sex, age range, diagnosis and material.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collection::{extract_country_code, id_suffix};
use crate::dataset::{InputDataset, InputRow};

/// Prefix for synthetic fact record identifiers.
pub const FACT_ID_PREFIX: &str = "bbmri-eric:factID:";

/// Age bucket labels paired with their inclusive lower bound in years.
/// Upper bounds are implied by the next entry.
const AGE_BUCKETS: &[(&str, u32)] = &[
    ("Newborn", 0),
    ("Infant", 1),
    ("Child", 2),
    ("Adolescent", 10),
    ("Young Adult", 18),
    ("Adult", 25),
    ("Middle-aged", 45),
    ("Aged (65-79 years)", 65),
    ("Aged (>80 years)", 80),
];

pub const UNKNOWN_AGE_RANGE: &str = "Unknown";

/// Buckets an age-at-diagnosis string. Empty or unparsable input lands in
/// the `Unknown` bucket rather than failing the row.
pub fn age_range(age_at_diagnosis: &str) -> &'static str {
    let Ok(age) = age_at_diagnosis.trim().parse::<u32>() else {
        return UNKNOWN_AGE_RANGE;
    };
    let mut label = UNKNOWN_AGE_RANGE;
    for (bucket, lower_bound) in AGE_BUCKETS {
        if age >= *lower_bound {
            label = bucket;
        }
    }
    label
}

/// One aggregated row of the star model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactRecord {
    pub id: String,
    pub collection_id: String,
    pub sex: String,
    pub age_range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_material: Option<String>,
    pub number_of_donors: u64,
    pub number_of_samples: u64,
    pub last_update: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_node: Option<String>,
}

impl FactRecord {
    /// Fills in the national node only when none is present. An existing
    /// value is never overwritten.
    pub fn ensure_national_node(&mut self, country_code: &str) {
        if self.national_node.is_none() {
            self.national_node = Some(country_code.to_string());
        }
    }
}

/// The fact records of one sync pass plus the country they belong to.
#[derive(Debug, Clone, Default)]
pub struct FactTable {
    pub records: Vec<FactRecord>,
    pub country_code: Option<String>,
}

impl FactTable {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Default)]
struct GroupStats {
    donors: BTreeSet<String>,
    samples: u64,
}

type GroupKey = (String, String, Option<String>, Option<String>);

/// Aggregates the dataset into a fact table.
///
/// The table's country code derives from the first encountered collection
/// id; a malformed first id leaves it unset. Groups below the dataset's
/// donor threshold are suppressed before any size cap is applied. When
/// `max_facts` is non-negative the combined output across all collections
/// is truncated to at most that many records in emission order; a negative
/// value means unlimited.
pub fn create_fact_tables(dataset: &InputDataset, max_facts: i32) -> FactTable {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let mut table = FactTable {
        country_code: dataset
            .collection_ids()
            .next()
            .and_then(|id| extract_country_code(id).ok()),
        ..FactTable::default()
    };

    for collection_id in dataset.collection_ids() {
        let mut groups: BTreeMap<GroupKey, GroupStats> = BTreeMap::new();
        for row in dataset.rows(collection_id) {
            let key = group_key(row);
            let stats = groups.entry(key).or_default();
            stats.donors.insert(row.subject_id().to_string());
            stats.samples += 1;
        }

        let before = groups.len();
        groups.retain(|_, stats| stats.donors.len() as u64 >= u64::from(dataset.min_donors()));
        if groups.len() < before {
            debug!(
                collection = collection_id,
                suppressed = before - groups.len(),
                "suppressed groups below donor threshold"
            );
        }

        let suffix = id_suffix(collection_id);
        for (sequence, ((sex, age_range, material, diagnosis), stats)) in
            groups.into_iter().enumerate()
        {
            table.records.push(FactRecord {
                id: format!("{FACT_ID_PREFIX}{suffix}:{}", sequence + 1),
                collection_id: collection_id.to_string(),
                sex,
                age_range,
                diagnosis,
                sample_material: material,
                number_of_donors: stats.donors.len() as u64,
                number_of_samples: stats.samples,
                last_update: today.clone(),
                national_node: None,
            });
        }
    }

    if max_facts >= 0 && table.records.len() > max_facts as usize {
        table.records.truncate(max_facts as usize);
    }
    table
}

fn group_key(row: &InputRow) -> GroupKey {
    (
        row.sex().to_string(),
        age_range(row.age_at_diagnosis()).to_string(),
        row.sample_material().map(str::to_string),
        row.diagnosis().map(str::to_string),
    )
}
