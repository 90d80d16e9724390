//! Configuration for datalab.
//!
//! [`LabConfig`] is read from TOML, adjusted by `DATALAB_*` environment
//! variables, validated, and then converted into the configuration of each
//! component.

#![warn(missing_docs, clippy::pedantic)]

pub mod loader;
pub mod schema;

pub use loader::{
    ENV_ALLOWED_PATHS, ENV_DATA_DIR, ENV_LOG_LEVEL, ENV_MAX_CONCURRENCY, ENV_MEMORY_LIMIT_BYTES,
    ENV_TIMEOUT_SECS,
};
pub use schema::{
    DEFAULT_CAPABILITIES, LabConfig, LimitsSection, LoggingSection, PolicySection,
    StorageSection, WorkerSection,
};
