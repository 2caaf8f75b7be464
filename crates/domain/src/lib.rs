//! Shared domain types for the Sibyl runtime core: the error taxonomy,
//! workspace configuration model, fixed-point cost arithmetic, preserved
//! session state, and structured trace events.

pub mod config;
pub mod cost;
pub mod error;
pub mod fingerprint;
pub mod preserved;
pub mod secrets;
pub mod trace;

pub use cost::CostUsd;
pub use error::{Error, ErrorKind, Result};
pub use fingerprint::ProviderFingerprint;
pub use preserved::{PreservedState, ScalarValue};
pub use trace::TraceEvent;
