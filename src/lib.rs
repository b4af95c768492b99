pub mod collection;
pub mod config;
pub mod dataset;
pub mod diagnosis;
pub mod error;
pub mod output;
pub mod reconcile;
pub mod registry;
pub mod source;
pub mod star;
pub mod sync;
pub mod vocab;
