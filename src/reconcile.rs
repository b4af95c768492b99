//! Reconciliation of the computed star model against the registry: fact
//! records go up in fixed-size blocks, stale facts come down page by page
//! and are deleted as units. Operations try the country-scoped endpoint
//! first and fall back once to the country-agnostic one when the registry
//! reports it absent.

use tracing::{info, warn};

use crate::collection::Collection;
use crate::error::SyncError;
use crate::registry::{PushOutcome, RegistryClient};
use crate::star::FactTable;

/// Records submitted per update block. The final block may be shorter.
pub const FACT_BLOCK_SIZE: usize = 1000;

pub struct Reconciler<'a> {
    registry: &'a dyn RegistryClient,
}

impl<'a> Reconciler<'a> {
    pub fn new(registry: &'a dyn RegistryClient) -> Self {
        Self { registry }
    }

    /// Pushes the fact table in blocks of [`FACT_BLOCK_SIZE`]. Each record
    /// gets the table's country code as national node unless it already
    /// carries one. Submission stops at the first failing block.
    pub fn update_facts(&self, table: &mut FactTable) -> Result<usize, SyncError> {
        if table.is_empty() {
            info!("no facts to submit");
            return Ok(0);
        }
        let country = table
            .country_code
            .clone()
            .ok_or_else(|| SyncError::InvalidCollectionId("fact table without country".into()))?;

        let mut scope = Some(country.as_str());
        let mut submitted = 0;
        let total_blocks = table.records.len().div_ceil(FACT_BLOCK_SIZE);
        for (index, block) in table.records.chunks_mut(FACT_BLOCK_SIZE).enumerate() {
            for record in block.iter_mut() {
                record.ensure_national_node(&country);
            }

            let mut outcome = self.registry.submit_fact_block(scope, block)?;
            if outcome == PushOutcome::NotFound && scope.is_some() {
                warn!(
                    country = %country,
                    "country-scoped fact endpoint absent, retrying against global endpoint"
                );
                scope = None;
                outcome = self.registry.submit_fact_block(scope, block)?;
            }
            match outcome {
                PushOutcome::Accepted => {
                    submitted += 1;
                    info!(block = index + 1, total = total_blocks, "fact block accepted");
                }
                PushOutcome::NotFound => {
                    return Err(SyncError::FactBlockRejected {
                        block: index + 1,
                        message: "fact endpoint not found".to_string(),
                    });
                }
                PushOutcome::Rejected(message) => {
                    return Err(SyncError::FactBlockRejected {
                        block: index + 1,
                        message,
                    });
                }
            }
        }
        Ok(submitted)
    }

    /// Deletes all registry facts of one collection, page by page. Each
    /// delete shrinks the registry-side listing, so the loop always asks
    /// for the first page of what remains. An empty page ends pagination
    /// successfully without issuing a delete; a failed deletion aborts
    /// with an error.
    pub fn delete_facts(&self, country: &str, collection_id: &str) -> Result<usize, SyncError> {
        let mut scope = Some(country);
        let mut deleted = 0;
        loop {
            let mut page = self.registry.next_fact_id_page(scope, collection_id)?;
            if page.is_none() && scope.is_some() {
                warn!(
                    country,
                    "country-scoped fact listing absent, retrying against global endpoint"
                );
                scope = None;
                page = self.registry.next_fact_id_page(scope, collection_id)?;
            }
            let ids = match page {
                Some(ids) => ids,
                None => {
                    return Err(SyncError::FactDeleteRejected {
                        collection: collection_id.to_string(),
                        message: "fact listing endpoint not found".to_string(),
                    });
                }
            };
            if ids.is_empty() {
                break;
            }

            match self.registry.delete_facts(scope, &ids)? {
                PushOutcome::Accepted => {
                    deleted += ids.len();
                }
                PushOutcome::NotFound => {
                    return Err(SyncError::FactDeleteRejected {
                        collection: collection_id.to_string(),
                        message: "fact deletion endpoint not found".to_string(),
                    });
                }
                PushOutcome::Rejected(message) => {
                    return Err(SyncError::FactDeleteRejected {
                        collection: collection_id.to_string(),
                        message,
                    });
                }
            }
        }
        if deleted > 0 {
            info!(collection = collection_id, deleted, "removed stale facts");
        }
        Ok(deleted)
    }

    /// Submits the recomputed collection records.
    pub fn update_collections(&self, collections: &[Collection]) -> Result<(), SyncError> {
        if collections.is_empty() {
            return Ok(());
        }
        match self.registry.submit_collections(collections)? {
            PushOutcome::Accepted => Ok(()),
            PushOutcome::NotFound => Err(SyncError::CollectionRejected(
                "collection endpoint not found".to_string(),
            )),
            PushOutcome::Rejected(message) => Err(SyncError::CollectionRejected(message)),
        }
    }
}
