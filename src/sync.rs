//! One-shot synchronization orchestrator: a sequential pass over
//! `INIT_RESOURCES → DIAGNOSIS_CORRECTION → STAR_MODEL_UPDATE →
//! COLLECTION_UPDATE → BIOBANK_PULL`, wrapped in a bounded retry loop with
//! blocking sleeps. One `Syncer` runs at most one pass at a time; the
//! scheduler outside the process is expected to drop overlapping triggers.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::collection::{Collection, extract_country_code};
use crate::config::ResolvedConfig;
use crate::dataset::{InputDataset, InputRow};
use crate::diagnosis::DiagnosisCorrector;
use crate::reconcile::Reconciler;
use crate::registry::RegistryClient;
use crate::source::SourceClient;
use crate::star::create_fact_tables;
use crate::vocab::ICD_URN_PREFIX;

/// Invocation count between repeated "never succeeded" warnings.
const FAILURE_WARNING_PERIOD: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStep {
    InitResources,
    DiagnosisCorrection,
    StarModelUpdate,
    CollectionUpdate,
    BiobankPull,
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncStep::InitResources => "INIT_RESOURCES",
            SyncStep::DiagnosisCorrection => "DIAGNOSIS_CORRECTION",
            SyncStep::StarModelUpdate => "STAR_MODEL_UPDATE",
            SyncStep::CollectionUpdate => "COLLECTION_UPDATE",
            SyncStep::BiobankPull => "BIOBANK_PULL",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step: SyncStep,
    pub messages: Vec<String>,
    pub errors: Vec<String>,
}

impl StepReport {
    fn new(step: SyncStep) -> Self {
        Self {
            step,
            messages: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub success: bool,
    pub steps: Vec<StepReport>,
}

impl PassReport {
    /// Step name and first error of the step that sank the pass.
    pub fn first_failure(&self) -> Option<(SyncStep, &str)> {
        self.steps
            .iter()
            .filter(|report| !matches!(report.step, SyncStep::BiobankPull))
            .find(|report| report.failed())
            .and_then(|report| Some((report.step, report.errors.first()?.as_str())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Failed,
    /// Registry credentials absent: sync is intentionally disabled and the
    /// invocation is skipped without error.
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub attempts: u32,
    pub passes: Vec<PassReport>,
}

/// Everything one pass accumulates. Rebuilt from scratch each pass and
/// dropped at its end; nothing here survives across invocations.
#[derive(Default)]
struct PassContext {
    dataset: InputDataset,
    // Resolvable specimens per collection. The dataset holds one row per
    // diagnosis, so collection sizes are counted here instead.
    specimen_counts: BTreeMap<String, u64>,
    storage_temperatures: BTreeMap<String, Vec<String>>,
    registry_collections: Vec<Collection>,
}

pub struct Syncer<'a> {
    config: &'a ResolvedConfig,
    source: &'a dyn SourceClient,
    registry: &'a dyn RegistryClient,
    // Process-lifetime counters feeding the "consistently failing"
    // warning. Reset on restart, never persisted.
    successes: u32,
    failures: u32,
}

impl<'a> Syncer<'a> {
    pub fn new(
        config: &'a ResolvedConfig,
        source: &'a dyn SourceClient,
        registry: &'a dyn RegistryClient,
    ) -> Self {
        Self {
            config,
            source,
            registry,
            successes: 0,
            failures: 0,
        }
    }

    /// (successes, failures) counted since process start.
    pub fn counters(&self) -> (u32, u32) {
        (self.successes, self.failures)
    }

    /// Runs one invocation: up to `retry_max` passes with
    /// `retry_interval` seconds of sleep between attempts, stopping at the
    /// first fully successful pass.
    pub fn run(&mut self) -> SyncReport {
        if self.config.credentials.is_none() && !self.config.mock_registry {
            info!("registry credentials not configured, sync disabled");
            return SyncReport {
                outcome: SyncOutcome::Disabled,
                attempts: 0,
                passes: Vec::new(),
            };
        }

        let mut passes = Vec::new();
        for attempt in 1..=self.config.retry_max {
            info!(attempt, max = self.config.retry_max, "starting sync pass");
            let pass = self.run_pass();
            let success = pass.success;
            if let Some((step, message)) = pass.first_failure() {
                warn!(step = %step, message, "sync pass failed");
            }
            passes.push(pass);
            if success {
                self.successes += 1;
                return SyncReport {
                    outcome: SyncOutcome::Success,
                    attempts: attempt,
                    passes,
                };
            }
            if attempt < self.config.retry_max {
                std::thread::sleep(Duration::from_secs(self.config.retry_interval_secs));
            }
        }

        self.failures += 1;
        if self.successes == 0 && self.failures % FAILURE_WARNING_PERIOD == 0 {
            warn!(
                invocations = self.failures,
                "sync has not succeeded once since process start, check registry and source store"
            );
        }
        SyncReport {
            outcome: SyncOutcome::Failed,
            attempts: self.config.retry_max,
            passes,
        }
    }

    fn run_pass(&self) -> PassReport {
        let mut ctx = PassContext::default();
        let mut steps = Vec::new();

        let report = self.init_resources(&mut ctx);
        let failed = report.failed();
        steps.push(report);
        if failed {
            return PassReport { success: false, steps };
        }

        let report = self.diagnosis_correction(&mut ctx);
        let failed = report.failed();
        steps.push(report);
        if failed {
            return PassReport { success: false, steps };
        }

        if self.config.star_model {
            let report = self.star_model_update(&ctx);
            let failed = report.failed();
            steps.push(report);
            if failed {
                return PassReport { success: false, steps };
            }
        }

        let report = self.collection_update(&mut ctx);
        let failed = report.failed();
        steps.push(report);
        if failed {
            return PassReport { success: false, steps };
        }

        // Best effort: errors here are reported but never fail the pass.
        steps.push(self.biobank_pull(&ctx));

        PassReport { success: true, steps }
    }

    fn init_resources(&self, ctx: &mut PassContext) -> StepReport {
        let mut report = StepReport::new(SyncStep::InitResources);

        match self.registry.login() {
            Ok(true) => report.messages.push("registry login succeeded".to_string()),
            Ok(false) => report.errors.push("registry login rejected".to_string()),
            Err(err) => report.errors.push(err.to_string()),
        }
        if report.failed() {
            return report;
        }

        let specimens = match self.source.fetch_specimens_by_collection() {
            Ok(specimens) => specimens,
            Err(err) => {
                report.errors.push(err.to_string());
                return report;
            }
        };

        ctx.dataset = InputDataset::new(self.config.min_donors);
        let mut skipped = 0usize;
        for (collection_id, specimens) in &specimens {
            for specimen in specimens {
                let Some(patient) = self.source.extract_patient_from_specimen(specimen) else {
                    skipped += 1;
                    continue;
                };
                let Some(sex) = patient.sex.as_deref() else {
                    skipped += 1;
                    continue;
                };
                let age = patient.age_at_diagnosis.as_deref().unwrap_or("");

                *ctx.specimen_counts.entry(collection_id.clone()).or_default() += 1;
                if let Some(temperature) = &specimen.storage_temperature {
                    ctx.storage_temperatures
                        .entry(collection_id.clone())
                        .or_default()
                        .push(temperature.clone());
                }

                let mut diagnoses = self.source.extract_diagnoses_from_specimen(specimen);
                if diagnoses.is_empty() {
                    diagnoses = self.source.extract_condition_codes_from_patient(&patient);
                }

                if diagnoses.is_empty() {
                    let mut row = InputRow::new(collection_id, &patient.id, sex, age);
                    row.set_sample_material(specimen.material.as_deref());
                    ctx.dataset.push(row);
                } else {
                    for diagnosis in diagnoses {
                        let mut row = InputRow::new(collection_id, &patient.id, sex, age);
                        row.set_sample_material(specimen.material.as_deref());
                        row.set_diagnosis(Some(&diagnosis));
                        ctx.dataset.push(row);
                    }
                }
            }
        }

        report.messages.push(format!(
            "staged {} rows across {} collections ({} unresolvable specimens skipped)",
            ctx.dataset.total_rows(),
            specimens.len(),
            skipped
        ));
        report
    }

    fn diagnosis_correction(&self, ctx: &mut PassContext) -> StepReport {
        let mut report = StepReport::new(SyncStep::DiagnosisCorrection);

        let mut codes: BTreeMap<String, Option<String>> = BTreeMap::new();
        for collection_id in ctx.dataset.collection_ids() {
            for row in ctx.dataset.rows(collection_id) {
                if let Some(code) = row.diagnosis().map(strip_icd_urn) {
                    codes.insert(code.to_string(), Some(code.to_string()));
                }
            }
        }

        let corrector =
            DiagnosisCorrector::new(self.registry, !self.config.mock_registry);
        if let Err(err) = corrector.correct(&mut codes) {
            report.errors.push(err.to_string());
            return report;
        }

        let changed: Vec<String> = codes
            .iter()
            .filter(|(code, corrected)| corrected.as_deref() != Some(code.as_str()))
            .map(|(code, _)| code.clone())
            .collect();
        if !changed.is_empty() {
            let collection_ids: Vec<String> = ctx
                .dataset
                .collection_ids()
                .map(str::to_string)
                .collect();
            for collection_id in collection_ids {
                if let Some(rows) = ctx.dataset.rows_mut(&collection_id) {
                    for row in rows {
                        let Some(code) = row.diagnosis().map(strip_icd_urn).map(str::to_string)
                        else {
                            continue;
                        };
                        if let Some(corrected) = codes.get(&code) {
                            row.apply_corrected_diagnosis(corrected.as_deref());
                        }
                    }
                }
            }
        }

        report.messages.push(format!(
            "checked {} diagnosis codes, corrected or dropped {}",
            codes.len(),
            changed.len()
        ));
        report
    }

    fn star_model_update(&self, ctx: &PassContext) -> StepReport {
        let mut report = StepReport::new(SyncStep::StarModelUpdate);
        let reconciler = Reconciler::new(self.registry);

        for collection_id in ctx.dataset.collection_ids() {
            let country = match extract_country_code(collection_id) {
                Ok(country) => country,
                Err(err) => {
                    report.errors.push(err.to_string());
                    return report;
                }
            };
            match reconciler.delete_facts(&country, collection_id) {
                Ok(deleted) if deleted > 0 => report
                    .messages
                    .push(format!("deleted {deleted} stale facts of {collection_id}")),
                Ok(_) => {}
                Err(err) => {
                    report.errors.push(err.to_string());
                    return report;
                }
            }
        }

        let mut table = create_fact_tables(&ctx.dataset, self.config.max_facts);
        let total = table.len();
        match reconciler.update_facts(&mut table) {
            Ok(blocks) => report
                .messages
                .push(format!("submitted {total} facts in {blocks} blocks")),
            Err(err) => report.errors.push(err.to_string()),
        }
        report
    }

    fn collection_update(&self, ctx: &mut PassContext) -> StepReport {
        let mut report = StepReport::new(SyncStep::CollectionUpdate);

        let ids: Vec<String> = ctx.dataset.collection_ids().map(str::to_string).collect();
        let fetched = match self.registry.fetch_collections(&ids) {
            Ok(fetched) => fetched,
            Err(err) => {
                report.errors.push(err.to_string());
                return report;
            }
        };

        let mut updated = Vec::new();
        for id in &ids {
            let mut collection = fetched
                .iter()
                .find(|collection| &collection.id == id)
                .cloned()
                .unwrap_or_else(|| Collection::new(id));
            collection.country = extract_country_code(id).ok();

            let rows = ctx.dataset.rows(id);
            collection.set_size(ctx.specimen_counts.get(id).copied().unwrap_or(0));
            collection.set_number_of_donors(ctx.dataset.distinct_subjects(id) as u64);
            collection.set_sex(rows.iter().map(|row| row.sex().to_string()));
            collection.set_materials(rows.iter().map(InputRow::sample_material));
            collection.set_diagnosis_available(rows.iter().map(InputRow::diagnosis));
            collection.set_storage_temperatures(
                ctx.storage_temperatures
                    .get(id)
                    .into_iter()
                    .flatten()
                    .map(|temperature| Some(temperature.as_str())),
            );
            updated.push(collection);
        }

        match Reconciler::new(self.registry).update_collections(&updated) {
            Ok(()) => report
                .messages
                .push(format!("submitted {} collections", updated.len())),
            Err(err) => report.errors.push(err.to_string()),
        }
        ctx.registry_collections = updated;
        report
    }

    fn biobank_pull(&self, ctx: &PassContext) -> StepReport {
        let mut report = StepReport::new(SyncStep::BiobankPull);

        let mut biobank_ids: Vec<String> = ctx
            .registry_collections
            .iter()
            .filter_map(|collection| collection.biobank.clone())
            .collect();
        biobank_ids.sort_unstable();
        biobank_ids.dedup();

        for id in biobank_ids {
            match self.registry.fetch_biobank(&id) {
                Ok(Some(biobank)) => report.messages.push(format!(
                    "biobank {} ({})",
                    biobank.id,
                    biobank.name.as_deref().unwrap_or("unnamed")
                )),
                Ok(None) => report
                    .messages
                    .push(format!("biobank {id} not present in registry")),
                Err(err) => {
                    warn!(biobank = %id, error = %err, "biobank pull failed");
                    report.errors.push(err.to_string());
                }
            }
        }
        report
    }
}

fn strip_icd_urn(diagnosis: &str) -> &str {
    diagnosis.strip_prefix(ICD_URN_PREFIX).unwrap_or(diagnosis)
}
