//! Durable tabular state for the runtime core: conversations, sessions,
//! rotations, subagent calls, token usage, budget reconciliation, phase
//! checkpoints, and config snapshots.
//!
//! All tables live behind one write lock, so every multi-row mutation the
//! schema requires (conversation creation, the rotation swap, call
//! reconciliation) is atomic by construction. Terminal calls are journaled
//! to JSONL; the full table set snapshots to JSON on `flush`.

mod integrity;
mod records;
mod store;

pub use integrity::{
    IntegrityFinding, IntegrityReport, RepairSummary, StaleReservation, TokenMismatch,
};
pub use records::*;
pub use store::{SessionSeed, StateStore, UsageDraft, SCHEMA_VERSION};
