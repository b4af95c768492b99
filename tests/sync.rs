use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use biobank_registry_sync::collection::{Biobank, Collection};
use biobank_registry_sync::config::{Credentials, ResolvedConfig, Transport};
use biobank_registry_sync::error::SyncError;
use biobank_registry_sync::registry::{PushOutcome, RegistryClient};
use biobank_registry_sync::source::{Patient, SourceClient, Specimen};
use biobank_registry_sync::star::FactRecord;
use biobank_registry_sync::sync::{SyncOutcome, SyncStep, Syncer};

const COLLECTION: &str = "bbmri-eric:ID:DE_A";
const BIOBANK: &str = "bbmri-eric:ID:DE_biobank1";

fn config(min_donors: u32) -> ResolvedConfig {
    ResolvedConfig {
        schema_version: 1,
        registry_url: "https://registry.example".to_string(),
        source_url: "http://store.example".to_string(),
        credentials: Some(Credentials {
            username: "sync".to_string(),
            password: "secret".to_string(),
        }),
        transport: Transport::Rest,
        retry_max: 1,
        retry_interval_secs: 0,
        min_donors,
        max_facts: -1,
        star_model: true,
        mock_registry: false,
    }
}

struct FakeSource {
    specimens: BTreeMap<String, Vec<Specimen>>,
}

impl FakeSource {
    fn with_cohort() -> Self {
        let mut specimens = Vec::new();
        // Twelve resolvable donors in the same aggregation group.
        for n in 0..12 {
            specimens.push(Specimen {
                id: format!("s{n}"),
                material: Some("tissue".to_string()),
                storage_temperature: Some("temperatureGN".to_string()),
                diagnoses: vec!["C75.4".to_string()],
                patient: Some(Patient {
                    id: format!("p{n}"),
                    sex: Some("male".to_string()),
                    age_at_diagnosis: Some("47".to_string()),
                    condition_codes: Vec::new(),
                }),
            });
        }
        // Two donors in a group below the suppression threshold.
        for n in 12..14 {
            specimens.push(Specimen {
                id: format!("s{n}"),
                material: Some("tissue".to_string()),
                storage_temperature: None,
                diagnoses: Vec::new(),
                patient: Some(Patient {
                    id: format!("p{n}"),
                    sex: Some("female".to_string()),
                    age_at_diagnosis: Some("3".to_string()),
                    condition_codes: vec!["E23.1".to_string()],
                }),
            });
        }
        // Unresolvable specimen, must be skipped without failing.
        specimens.push(Specimen {
            id: "s-orphan".to_string(),
            material: Some("tissue".to_string()),
            storage_temperature: None,
            diagnoses: Vec::new(),
            patient: None,
        });

        Self {
            specimens: BTreeMap::from([(COLLECTION.to_string(), specimens)]),
        }
    }
}

impl SourceClient for FakeSource {
    fn fetch_specimens_by_collection(&self) -> Result<BTreeMap<String, Vec<Specimen>>, SyncError> {
        Ok(self.specimens.clone())
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

#[derive(Default)]
struct FakeRegistry {
    valid_codes: BTreeSet<&'static str>,
    login_results: Mutex<VecDeque<bool>>,
    fact_pages: Mutex<VecDeque<Vec<String>>>,
    submitted_facts: Mutex<Vec<Vec<FactRecord>>>,
    deleted_ids: Mutex<Vec<Vec<String>>>,
    submitted_collections: Mutex<Vec<Vec<Collection>>>,
    fetched_biobanks: Mutex<Vec<String>>,
    reject_fact_blocks: bool,
    fail_biobank_pull: bool,
}

impl RegistryClient for FakeRegistry {
    fn login(&self) -> Result<bool, SyncError> {
        Ok(self.login_results.lock().unwrap().pop_front().unwrap_or(true))
    }

    fn fetch_biobank(&self, id: &str) -> Result<Option<Biobank>, SyncError> {
        self.fetched_biobanks.lock().unwrap().push(id.to_string());
        if self.fail_biobank_pull {
            return Err(SyncError::RegistryHttp("connection reset".to_string()));
        }
        Ok(Some(Biobank {
            id: id.to_string(),
            name: Some("Test Biobank".to_string()),
            country: Some("DE".to_string()),
        }))
    }

    fn fetch_collections(&self, ids: &[String]) -> Result<Vec<Collection>, SyncError> {
        Ok(ids
            .iter()
            .map(|id| {
                let mut collection = Collection::new(id);
                collection.biobank = Some(BIOBANK.to_string());
                collection
            })
            .collect())
    }

    fn submit_collections(&self, collections: &[Collection]) -> Result<PushOutcome, SyncError> {
        self.submitted_collections
            .lock()
            .unwrap()
            .push(collections.to_vec());
        Ok(PushOutcome::Accepted)
    }

    fn submit_fact_block(
        &self,
        _country: Option<&str>,
        records: &[FactRecord],
    ) -> Result<PushOutcome, SyncError> {
        if self.reject_fact_blocks {
            return Ok(PushOutcome::Rejected("schema mismatch".to_string()));
        }
        self.submitted_facts.lock().unwrap().push(records.to_vec());
        Ok(PushOutcome::Accepted)
    }

    fn next_fact_id_page(
        &self,
        _country: Option<&str>,
        _collection_id: &str,
    ) -> Result<Option<Vec<String>>, SyncError> {
        Ok(Some(
            self.fact_pages.lock().unwrap().pop_front().unwrap_or_default(),
        ))
    }

    fn delete_facts(
        &self,
        _country: Option<&str>,
        fact_ids: &[String],
    ) -> Result<PushOutcome, SyncError> {
        self.deleted_ids.lock().unwrap().push(fact_ids.to_vec());
        Ok(PushOutcome::Accepted)
    }

    fn is_valid_diagnosis_code(&self, code: &str) -> Result<bool, SyncError> {
        Ok(self.valid_codes.contains(code))
    }
}

fn registry_with_vocabulary() -> FakeRegistry {
    FakeRegistry {
        valid_codes: BTreeSet::from(["C75", "E23.1"]),
        ..FakeRegistry::default()
    }
}

#[test]
fn full_pass_succeeds_and_reports_all_steps() {
    let source = FakeSource::with_cohort();
    let registry = registry_with_vocabulary();
    registry
        .fact_pages
        .lock()
        .unwrap()
        .extend([vec!["F1".to_string(), "F2".to_string()], vec![]]);

    let config = config(10);
    let mut syncer = Syncer::new(&config, &source, &registry);
    let report = syncer.run();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.attempts, 1);
    let steps: Vec<SyncStep> = report.passes[0]
        .steps
        .iter()
        .map(|step| step.step)
        .collect();
    assert_eq!(
        steps,
        vec![
            SyncStep::InitResources,
            SyncStep::DiagnosisCorrection,
            SyncStep::StarModelUpdate,
            SyncStep::CollectionUpdate,
            SyncStep::BiobankPull,
        ]
    );
    assert_eq!(syncer.counters(), (1, 0));

    // Stale facts were deleted page by page before the new push.
    let deletes = registry.deleted_ids.lock().unwrap();
    assert_eq!(*deletes, vec![vec!["F1".to_string(), "F2".to_string()]]);
}

#[test]
fn aggregation_suppresses_and_corrects() {
    let source = FakeSource::with_cohort();
    let registry = registry_with_vocabulary();

    let config = config(10);
    Syncer::new(&config, &source, &registry).run();

    let submitted = registry.submitted_facts.lock().unwrap();
    assert_eq!(submitted.len(), 1, "one block expected");
    let facts = &submitted[0];
    // The two-donor group is suppressed, only the twelve-donor group remains.
    assert_eq!(facts.len(), 1);
    let fact = &facts[0];
    assert_eq!(fact.number_of_donors, 12);
    assert_eq!(fact.number_of_samples, 12);
    assert_eq!(fact.age_range, "Middle-aged");
    assert_eq!(fact.sample_material.as_deref(), Some("TISSUE_FROZEN"));
    // C75.4 is unknown to the registry and degrades to its category code.
    assert_eq!(fact.diagnosis.as_deref(), Some("urn:miriam:icd:C75"));
    assert_eq!(fact.national_node.as_deref(), Some("DE"));
}

#[test]
fn collection_update_carries_counts_and_vocabulary() {
    let source = FakeSource::with_cohort();
    let registry = registry_with_vocabulary();

    let config = config(10);
    Syncer::new(&config, &source, &registry).run();

    let submitted = registry.submitted_collections.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    let collection = &submitted[0][0];
    assert_eq!(collection.id, COLLECTION);
    assert_eq!(collection.country.as_deref(), Some("DE"));
    // 14 resolvable specimens, each one row; the orphan is skipped.
    assert_eq!(collection.size, 14);
    assert_eq!(collection.number_of_donors, 14);
    assert_eq!(collection.order_of_magnitude, 1);
    assert_eq!(collection.sex, vec!["MALE", "FEMALE"]);
    assert_eq!(collection.materials, vec!["TISSUE_FROZEN"]);
    assert_eq!(collection.storage_temperatures, vec!["temperatureOther"]);
    assert_eq!(
        collection.diagnosis_available,
        vec!["urn:miriam:icd:C75", "urn:miriam:icd:E23.1"]
    );
}

#[test]
fn multi_diagnosis_specimens_count_once_in_collection_size() {
    let specimen = Specimen {
        id: "s1".to_string(),
        material: Some("tissue".to_string()),
        storage_temperature: None,
        diagnoses: vec!["C75".to_string(), "E23.1".to_string()],
        patient: Some(Patient {
            id: "p1".to_string(),
            sex: Some("male".to_string()),
            age_at_diagnosis: Some("47".to_string()),
            condition_codes: Vec::new(),
        }),
    };
    let source = FakeSource {
        specimens: BTreeMap::from([(COLLECTION.to_string(), vec![specimen])]),
    };
    let registry = registry_with_vocabulary();

    let config = config(1);
    let report = Syncer::new(&config, &source, &registry).run();
    assert_eq!(report.outcome, SyncOutcome::Success);

    let submitted = registry.submitted_collections.lock().unwrap();
    let collection = &submitted[0][0];
    // One specimen, two diagnosis rows.
    assert_eq!(collection.size, 1);
    assert_eq!(collection.number_of_donors, 1);
    assert_eq!(
        collection.diagnosis_available,
        vec!["urn:miriam:icd:C75", "urn:miriam:icd:E23.1"]
    );
}

#[test]
fn biobank_pull_runs_and_failures_do_not_fail_the_pass() {
    let source = FakeSource::with_cohort();
    let registry = FakeRegistry {
        fail_biobank_pull: true,
        ..registry_with_vocabulary()
    };

    let config = config(10);
    let report = Syncer::new(&config, &source, &registry).run();

    assert_eq!(report.outcome, SyncOutcome::Success);
    let pull = report.passes[0]
        .steps
        .iter()
        .find(|step| step.step == SyncStep::BiobankPull)
        .unwrap();
    assert!(!pull.errors.is_empty());
    assert_eq!(*registry.fetched_biobanks.lock().unwrap(), vec![BIOBANK]);
}

#[test]
fn failing_fact_block_aborts_pass_and_exhausts_retries() {
    let source = FakeSource::with_cohort();
    let registry = FakeRegistry {
        reject_fact_blocks: true,
        ..registry_with_vocabulary()
    };

    let mut config = config(10);
    config.retry_max = 2;
    let mut syncer = Syncer::new(&config, &source, &registry);
    let report = syncer.run();

    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.passes.len(), 2);
    for pass in &report.passes {
        assert!(!pass.success);
        let (step, _) = pass.first_failure().unwrap();
        assert_eq!(step, SyncStep::StarModelUpdate);
        // Collection update is never reached.
        assert!(
            !pass
                .steps
                .iter()
                .any(|step| step.step == SyncStep::CollectionUpdate)
        );
    }
    assert!(registry.submitted_collections.lock().unwrap().is_empty());
    assert_eq!(syncer.counters(), (0, 1));
}

#[test]
fn retry_loop_stops_at_first_success() {
    let source = FakeSource::with_cohort();
    let registry = registry_with_vocabulary();
    registry.login_results.lock().unwrap().extend([false, true]);

    let mut config = config(10);
    config.retry_max = 3;
    let mut syncer = Syncer::new(&config, &source, &registry);
    let report = syncer.run();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.passes.len(), 2);
    assert!(!report.passes[0].success);
    assert!(report.passes[1].success);
}

#[test]
fn missing_credentials_disable_the_invocation() {
    let source = FakeSource::with_cohort();
    let registry = registry_with_vocabulary();

    let mut config = config(10);
    config.credentials = None;
    let mut syncer = Syncer::new(&config, &source, &registry);
    let report = syncer.run();

    assert_eq!(report.outcome, SyncOutcome::Disabled);
    assert_eq!(report.attempts, 0);
    assert!(report.passes.is_empty());
    assert!(registry.submitted_facts.lock().unwrap().is_empty());
}

#[test]
fn star_model_step_is_skipped_when_disabled() {
    let source = FakeSource::with_cohort();
    let registry = registry_with_vocabulary();

    let mut config = config(10);
    config.star_model = false;
    let report = Syncer::new(&config, &source, &registry).run();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert!(
        !report.passes[0]
            .steps
            .iter()
            .any(|step| step.step == SyncStep::StarModelUpdate)
    );
    assert!(registry.submitted_facts.lock().unwrap().is_empty());
    assert_eq!(registry.submitted_collections.lock().unwrap().len(), 1);
}

#[test]
fn consecutive_failures_accumulate_on_the_counters() {
    let source = FakeSource::with_cohort();
    let registry = FakeRegistry {
        reject_fact_blocks: true,
        ..registry_with_vocabulary()
    };

    let config = config(10);
    let mut syncer = Syncer::new(&config, &source, &registry);
    for _ in 0..7 {
        let report = syncer.run();
        assert_eq!(report.outcome, SyncOutcome::Failed);
    }
    assert_eq!(syncer.counters(), (0, 7));
}
