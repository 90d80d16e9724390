//! datalab facade.
//!
//! Bundles the datalab crates behind feature flags: the tiered dataset
//! registry, the security policy and query validator, the capability
//! sandbox, and the execution kernel that supervises worker processes and
//! dispatches tool calls.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use lab_primitives as primitives;

/// Tiered dataset registry (enabled by `registry` feature).
#[cfg(feature = "registry")]
pub use lab_registry as registry;

/// Security policy and query validation (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use lab_policy as policy;

/// Capability sandbox and worker runtime (enabled by `sandbox` feature).
#[cfg(feature = "sandbox")]
pub use lab_sandbox as sandbox;

/// Supervisor, query engine, and dispatcher (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use lab_kernel as kernel;

/// Configuration loading (enabled by `config` feature).
#[cfg(feature = "config")]
pub use lab_config as config;

/// Tracing setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use lab_telemetry as telemetry;
