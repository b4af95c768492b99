//! Correction of diagnosis codes against the registry's accepted disease
//! vocabulary. Unrecognized subcategory codes degrade to their category
//! code; codes the registry does not know at all are dropped.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::registry::RegistryClient;

pub struct DiagnosisCorrector<'a> {
    registry: &'a dyn RegistryClient,
    enabled: bool,
}

impl<'a> DiagnosisCorrector<'a> {
    /// `enabled = false` turns correction into a pass-through, used when
    /// the registry is mocked and has no vocabulary to consult.
    pub fn new(registry: &'a dyn RegistryClient, enabled: bool) -> Self {
        Self { registry, enabled }
    }

    /// Validates each raw code, replacing it with its 3-character category
    /// code when only that is recognized, and with `None` when neither is.
    pub fn correct(
        &self,
        diagnoses: &mut BTreeMap<String, Option<String>>,
    ) -> Result<(), SyncError> {
        if !self.enabled {
            debug!("diagnosis correction disabled, passing codes through");
            return Ok(());
        }
        for (code, corrected) in diagnoses.iter_mut() {
            if self.registry.is_valid_diagnosis_code(code)? {
                continue;
            }
            if let Some(category) = code.get(..3).filter(|_| code.len() > 3) {
                if self.registry.is_valid_diagnosis_code(category)? {
                    debug!(code, category, "diagnosis degraded to category code");
                    *corrected = Some(category.to_string());
                    continue;
                }
            }
            warn!(code, "diagnosis unknown to registry, dropping");
            *corrected = None;
        }
        Ok(())
    }
}
