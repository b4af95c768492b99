//! Per-collection staging of normalized specimen observations. The dataset
//! is rebuilt from scratch on every sync pass and consumed once by the
//! aggregation engine.

use serde::Serialize;

use crate::vocab;

pub const DEFAULT_MIN_DONORS: u32 = 10;

/// One specimen/diagnosis observation with registry-normalized fields.
///
/// The setters on normalized fields ignore `None`: once a valid value has
/// been stored it is never erased by a later unresolvable extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputRow {
    collection_id: String,
    subject_id: String,
    sex: String,
    age_at_diagnosis: String,
    sample_material: Option<String>,
    diagnosis: Option<String>,
}

impl InputRow {
    pub fn new(collection_id: &str, subject_id: &str, sex: &str, age_at_diagnosis: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            subject_id: subject_id.to_string(),
            sex: vocab::convert_sex(sex),
            age_at_diagnosis: age_at_diagnosis.to_string(),
            sample_material: None,
            diagnosis: None,
        }
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn sex(&self) -> &str {
        &self.sex
    }

    pub fn age_at_diagnosis(&self) -> &str {
        &self.age_at_diagnosis
    }

    pub fn sample_material(&self) -> Option<&str> {
        self.sample_material.as_deref()
    }

    pub fn diagnosis(&self) -> Option<&str> {
        self.diagnosis.as_deref()
    }

    pub fn set_sample_material(&mut self, material: Option<&str>) {
        if let Some(converted) = vocab::convert_material(material) {
            self.sample_material = Some(converted);
        }
    }

    pub fn set_diagnosis(&mut self, diagnosis: Option<&str>) {
        if let Some(converted) = vocab::convert_diagnosis(diagnosis) {
            self.diagnosis = Some(converted);
        }
    }

    /// Overwrites the diagnosis with an already-corrected value, or clears
    /// it when the correction dropped the code entirely.
    pub fn apply_corrected_diagnosis(&mut self, diagnosis: Option<&str>) {
        self.diagnosis = vocab::convert_diagnosis(diagnosis);
    }
}

/// Rows keyed by collection id, insertion-ordered. Carries the suppression
/// threshold the aggregation engine applies.
#[derive(Debug, Clone)]
pub struct InputDataset {
    collection_order: Vec<String>,
    rows: std::collections::HashMap<String, Vec<InputRow>>,
    min_donors: u32,
}

impl Default for InputDataset {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DONORS)
    }
}

impl InputDataset {
    pub fn new(min_donors: u32) -> Self {
        Self {
            collection_order: Vec::new(),
            rows: std::collections::HashMap::new(),
            min_donors,
        }
    }

    pub fn min_donors(&self) -> u32 {
        self.min_donors
    }

    pub fn push(&mut self, row: InputRow) {
        let collection_id = row.collection_id().to_string();
        let entry = self.rows.entry(collection_id.clone()).or_default();
        if entry.is_empty() {
            self.collection_order.push(collection_id);
        }
        entry.push(row);
    }

    /// Collection ids in first-seen order.
    pub fn collection_ids(&self) -> impl Iterator<Item = &str> {
        self.collection_order.iter().map(String::as_str)
    }

    pub fn rows(&self, collection_id: &str) -> &[InputRow] {
        self.rows.get(collection_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rows_mut(&mut self, collection_id: &str) -> Option<&mut Vec<InputRow>> {
        self.rows.get_mut(collection_id)
    }

    pub fn is_empty(&self) -> bool {
        self.collection_order.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn distinct_subjects(&self, collection_id: &str) -> usize {
        let mut subjects = std::collections::BTreeSet::new();
        for row in self.rows(collection_id) {
            subjects.insert(row.subject_id());
        }
        subjects.len()
    }
}
