use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid collection identifier: {0}")]
    InvalidCollectionId(String),

    #[error("missing config file registry-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value for {field}: {message}")]
    ConfigValue { field: String, message: String },

    #[error("registry request failed: {0}")]
    RegistryHttp(String),

    #[error("registry returned status {status}: {message}")]
    RegistryStatus { status: u16, message: String },

    #[error("registry rejected fact block {block}: {message}")]
    FactBlockRejected { block: usize, message: String },

    #[error("registry rejected fact deletion for collection {collection}: {message}")]
    FactDeleteRejected { collection: String, message: String },

    #[error("registry rejected collection update: {0}")]
    CollectionRejected(String),

    #[error("source store request failed: {0}")]
    SourceHttp(String),

    #[error("source store returned status {status}: {message}")]
    SourceStatus { status: u16, message: String },
}
