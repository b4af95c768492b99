//! Capability surface of the local clinical data store. The store hands
//! over already-resolved specimen and patient objects; anything it cannot
//! resolve comes back as `None`/empty and is skipped, never treated as an
//! error.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specimen {
    pub id: String,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub storage_temperature: Option<String>,
    #[serde(default)]
    pub diagnoses: Vec<String>,
    #[serde(default)]
    pub patient: Option<Patient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub age_at_diagnosis: Option<String>,
    #[serde(default)]
    pub condition_codes: Vec<String>,
}

pub trait SourceClient: Send + Sync {
    /// All specimens the store holds, grouped by biobank collection id.
    fn fetch_specimens_by_collection(&self) -> Result<BTreeMap<String, Vec<Specimen>>, SyncError>;

    /// The patient a specimen was taken from, when resolvable.
    fn extract_patient_from_specimen(&self, specimen: &Specimen) -> Option<Patient>;

    /// Condition codes recorded on the patient record itself.
    fn extract_condition_codes_from_patient(&self, patient: &Patient) -> Vec<String>;

    /// Diagnoses attached directly to the specimen.
    fn extract_diagnoses_from_specimen(&self, specimen: &Specimen) -> Vec<String>;
}

/// Reads a JSON specimen export from the store's HTTP endpoint.
pub struct HttpSourceClient {
    client: Client,
    base_url: String,
}

impl HttpSourceClient {
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("registry-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::SourceHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| SyncError::SourceHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl SourceClient for HttpSourceClient {
    fn fetch_specimens_by_collection(&self) -> Result<BTreeMap<String, Vec<Specimen>>, SyncError> {
        let url = format!("{}/export/specimens", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| SyncError::SourceHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "source store request failed".to_string());
            return Err(SyncError::SourceStatus { status, message });
        }
        response
            .json()
            .map_err(|err| SyncError::SourceHttp(err.to_string()))
    }

    fn extract_patient_from_specimen(&self, specimen: &Specimen) -> Option<Patient> {
        specimen.patient.clone()
    }

    fn extract_condition_codes_from_patient(&self, patient: &Patient) -> Vec<String> {
        patient.condition_codes.clone()
    }

    fn extract_diagnoses_from_specimen(&self, specimen: &Specimen) -> Vec<String> {
        specimen.diagnoses.clone()
    }
}
