use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sibyl_domain::error::{Error, Result};
use sibyl_domain::{ErrorKind, PreservedState};

use crate::records::*;

/// Current persisted schema version. Version 2 is the base schema;
/// version 3 added session rotation. Migration is one-way.
pub const SCHEMA_VERSION: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All tables behind the store's single write lock. Holding the write
/// lock IS the write transaction; every multi-row mutation below is
/// therefore atomic.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    pub conversations: HashMap<String, Conversation>,
    pub sessions: HashMap<String, Session>,
    /// conversation_id → id of its single active session.
    pub active_sessions: HashMap<String, String>,
    pub rotations: Vec<SessionRotation>,
    /// call_key → call row (unique index on call_key).
    pub calls: HashMap<String, SubagentCall>,
    /// session_id → usage rows in turn order.
    pub usage: HashMap<String, Vec<SessionTokenUsage>>,
    pub reconciliations: Vec<BudgetReconciliation>,
    /// conversation_id → checkpoints in record order.
    pub checkpoints: HashMap<String, Vec<PhaseCheckpoint>>,
    pub config_snapshots: HashMap<String, ConfigSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    schema_version: u32,
}

struct StorePaths {
    snapshot: PathBuf,
    journal: PathBuf,
    meta: PathBuf,
}

/// Inputs for minting a new session row.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub tokens_budget: u64,
    pub summarize_threshold_pct: f64,
    pub rotate_threshold_pct: f64,
    pub model_name: Option<String>,
    pub agent_type: Option<String>,
    pub preserved_state: PreservedState,
    pub context_summary_ref: Option<String>,
}

/// A usage insert before the store assigns `turn_id` and cumulative fields.
#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub call_key: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub active_generation: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StateStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The durable tabular store. Backed by a JSON snapshot (`state.json`)
/// plus an append-only JSONL journal of terminal calls; `in_memory()`
/// omits persistence for tests.
pub struct StateStore {
    inner: RwLock<Tables>,
    paths: Option<StorePaths>,
    loaded_schema_version: u32,
}

impl StateStore {
    /// Open (or create) the store under `state_path/state/`.
    pub fn open(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("state");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        let paths = StorePaths {
            snapshot: dir.join("state.json"),
            journal: dir.join("calls.jsonl"),
            meta: dir.join("meta.json"),
        };

        let loaded_schema_version = match std::fs::read_to_string(&paths.meta) {
            Ok(raw) => {
                let meta: Meta = serde_json::from_str(&raw)?;
                match meta.schema_version {
                    2 | 3 => meta.schema_version,
                    v => {
                        return Err(Error::State(format!(
                            "unsupported schema version {v} (this build speaks v2/v3)"
                        )))
                    }
                }
            }
            Err(_) => SCHEMA_VERSION,
        };

        let tables = if paths.snapshot.exists() {
            let raw = std::fs::read_to_string(&paths.snapshot).map_err(Error::Io)?;
            serde_json::from_str(&raw)?
        } else {
            Tables::default()
        };

        let store = Self {
            inner: RwLock::new(tables),
            paths: Some(paths),
            loaded_schema_version,
        };

        if loaded_schema_version < SCHEMA_VERSION {
            // One-way migration: serde defaults fill the rotation fields
            // the base schema lacked; record the bump immediately.
            tracing::info!(
                from = loaded_schema_version,
                to = SCHEMA_VERSION,
                "migrating state schema"
            );
            store.write_meta()?;
        } else if !store.paths_meta_exists() {
            store.write_meta()?;
        }

        Ok(store)
    }

    /// A store with no persistence, for tests.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
            paths: None,
            loaded_schema_version: SCHEMA_VERSION,
        }
    }

    /// The schema version found on disk before any migration.
    pub fn loaded_schema_version(&self) -> u32 {
        self.loaded_schema_version
    }

    fn paths_meta_exists(&self) -> bool {
        self.paths
            .as_ref()
            .map(|p| p.meta.exists())
            .unwrap_or(true)
    }

    fn write_meta(&self) -> Result<()> {
        if let Some(paths) = &self.paths {
            let meta = Meta {
                schema_version: SCHEMA_VERSION,
            };
            write_atomic(&paths.meta, serde_json::to_vec(&meta)?.as_slice())?;
        }
        Ok(())
    }

    /// Persist the full table set to the JSON snapshot.
    pub fn flush(&self) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        let json = {
            let tables = self.inner.read();
            serde_json::to_vec(&*tables)?
        };
        write_atomic(&paths.snapshot, &json)?;
        self.write_meta()
    }

    /// Append a terminal call to the JSONL journal.
    fn journal_call(&self, call: &SubagentCall) {
        let Some(paths) = &self.paths else { return };
        if let Ok(json) = serde_json::to_string(call) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&paths.journal)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    // ── Conversation lifecycle ───────────────────────────────────────

    /// Create a conversation with its initial session and pinned config
    /// snapshot, in one transaction.
    pub fn create_conversation(
        &self,
        workflow_type: &str,
        token_budget: u64,
        config_version: &str,
        config_content: serde_json::Value,
        seed: SessionSeed,
    ) -> Result<(Conversation, Session)> {
        let mut tables = self.inner.write();

        tables
            .config_snapshots
            .entry(config_version.to_owned())
            .or_insert_with(|| ConfigSnapshot {
                config_version: config_version.to_owned(),
                content: config_content,
                created_at: Utc::now(),
            });

        let conversation = Conversation::new(workflow_type, token_budget, config_version);
        let session = make_session(&conversation.id, None, 1, &seed);

        tables
            .active_sessions
            .insert(conversation.id.clone(), session.id.clone());
        tables.sessions.insert(session.id.clone(), session.clone());
        tables
            .conversations
            .insert(conversation.id.clone(), conversation.clone());

        Ok((conversation, session))
    }

    /// Transition a conversation to a terminal status, exactly once.
    /// Completing also completes the active session; failing, cancelling,
    /// or crashing abandons it.
    pub fn terminate_conversation(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        error: Option<(ErrorKind, String)>,
        failed_step: Option<String>,
    ) -> Result<Conversation> {
        debug_assert!(status.is_terminal());
        let mut tables = self.inner.write();

        let active_id = tables.active_sessions.get(conversation_id).cloned();
        let conv = tables
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::State(format!("unknown conversation {conversation_id}")))?;

        if conv.status.is_terminal() {
            return Ok(conv.clone());
        }

        conv.status = status;
        conv.finished_at = Some(Utc::now());
        if let Some((kind, message)) = error {
            conv.error_kind = Some(kind);
            conv.error_message = Some(message);
        }
        conv.failed_step = failed_step;
        let result = conv.clone();

        if let Some(session_id) = active_id {
            if let Some(session) = tables.sessions.get_mut(&session_id) {
                if !session.status.is_terminal() {
                    session.status = if status == ConversationStatus::Completed {
                        SessionStatus::Completed
                    } else {
                        SessionStatus::Abandoned
                    };
                    session.status_changed_at = Utc::now();
                    session.completed_at = Some(Utc::now());
                }
            }
            tables.active_sessions.remove(conversation_id);
        }

        Ok(result)
    }

    /// Run a closure over a conversation under the write lock. Budget
    /// counters are only ever updated through here, which serializes them
    /// on the conversation row.
    pub fn with_conversation_mut<R>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Result<R> {
        let mut tables = self.inner.write();
        let conv = tables
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::State(format!("unknown conversation {conversation_id}")))?;
        Ok(f(conv))
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner.read().conversations.get(conversation_id).cloned()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        let mut all: Vec<_> = self.inner.read().conversations.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    pub fn active_session(&self, conversation_id: &str) -> Option<Session> {
        let tables = self.inner.read();
        let id = tables.active_sessions.get(conversation_id)?;
        tables.sessions.get(id).cloned()
    }

    pub fn sessions_for(&self, conversation_id: &str) -> Vec<Session> {
        let mut sessions: Vec<_> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.conversation_id == conversation_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.session_number);
        sessions
    }

    /// Start a fresh session for a conversation that currently has none
    /// (crash recovery / restart path). The successor continues the
    /// session numbering after the given parent, when one is named.
    pub fn start_session(
        &self,
        conversation_id: &str,
        parent: Option<&str>,
        seed: SessionSeed,
    ) -> Result<Session> {
        let mut tables = self.inner.write();
        if !tables.conversations.contains_key(conversation_id) {
            return Err(Error::State(format!("unknown conversation {conversation_id}")));
        }
        if tables.active_sessions.contains_key(conversation_id) {
            return Err(Error::State(format!(
                "conversation {conversation_id} already has an active session"
            )));
        }

        let (parent_id, next_number, attempts) = match parent {
            Some(pid) => {
                let p = tables
                    .sessions
                    .get(pid)
                    .ok_or_else(|| Error::State(format!("unknown session {pid}")))?;
                (Some(pid.to_owned()), p.session_number + 1, p.rotation_attempts)
            }
            None => {
                let max = tables
                    .sessions
                    .values()
                    .filter(|s| s.conversation_id == conversation_id)
                    .map(|s| s.session_number)
                    .max()
                    .unwrap_or(0);
                (None, max + 1, 0)
            }
        };

        let mut session = make_session(conversation_id, parent_id, next_number, &seed);
        session.rotation_attempts = attempts;
        tables
            .active_sessions
            .insert(conversation_id.to_owned(), session.id.clone());
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Compare-and-set guarded session mutation: the closure runs only if
    /// the session's `active_generation` still matches `expected`.
    pub fn session_cas<R>(
        &self,
        session_id: &str,
        expected_generation: u64,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R> {
        let mut tables = self.inner.write();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;
        if session.active_generation != expected_generation {
            return Err(Error::SessionRotatedDuringCall {
                session_id: session_id.to_owned(),
                captured: expected_generation,
                current: session.active_generation,
            });
        }
        Ok(f(session))
    }

    /// Step 1 of the rotation swap: CAS `rotation_in_progress` at the
    /// expected generation. Fails if another rotation is in progress or
    /// the session is not in a rotatable state.
    pub fn begin_rotation(&self, session_id: &str, expected_generation: u64) -> Result<()> {
        let mut tables = self.inner.write();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;

        if session.active_generation != expected_generation {
            return Err(Error::SessionRotatedDuringCall {
                session_id: session_id.to_owned(),
                captured: expected_generation,
                current: session.active_generation,
            });
        }
        if session.rotation_in_progress {
            return Err(Error::RotationFailed(format!(
                "rotation already in progress for session {session_id}"
            )));
        }
        if !matches!(
            session.status,
            SessionStatus::Active | SessionStatus::Summarizing
        ) {
            return Err(Error::RotationFailed(format!(
                "session {session_id} is {:?}, not rotatable",
                session.status
            )));
        }

        session.rotation_in_progress = true;
        session.status = SessionStatus::Rotating;
        session.status_changed_at = Utc::now();
        Ok(())
    }

    /// Steps 2–4 of the rotation swap in one transaction: insert the
    /// successor, complete the old session (bumping its generation so
    /// in-flight calls observe the swap), move the conversation's active
    /// pointer, and append the rotation event.
    pub fn complete_rotation(
        &self,
        from_session_id: &str,
        successor: Session,
        mut rotation: SessionRotation,
    ) -> Result<Session> {
        let mut tables = self.inner.write();

        let from = tables
            .sessions
            .get_mut(from_session_id)
            .ok_or_else(|| Error::State(format!("unknown session {from_session_id}")))?;
        if !from.rotation_in_progress {
            return Err(Error::RotationFailed(format!(
                "session {from_session_id} has no rotation in progress"
            )));
        }
        if successor.parent_session_id.as_deref() != Some(from_session_id)
            || successor.session_number != from.session_number + 1
        {
            return Err(Error::RotationFailed(format!(
                "successor of {from_session_id} has inconsistent lineage"
            )));
        }

        from.status = SessionStatus::Completed;
        from.status_changed_at = Utc::now();
        from.completed_at = Some(Utc::now());
        from.rotation_in_progress = false;
        // The generation bump: any in-flight call that captured the old
        // generation now completes against a differing one.
        from.active_generation += 1;

        let conversation_id = from.conversation_id.clone();
        rotation.to_session_id = Some(successor.id.clone());
        rotation.completed_at = Some(Utc::now());

        tables
            .active_sessions
            .insert(conversation_id, successor.id.clone());
        tables
            .sessions
            .insert(successor.id.clone(), successor.clone());
        tables.rotations.push(rotation);

        Ok(successor)
    }

    /// Record a failed rotation attempt: the session is marked failed and
    /// the (failed) rotation event is appended.
    pub fn fail_rotation(
        &self,
        session_id: &str,
        mut rotation: SessionRotation,
    ) -> Result<Session> {
        let mut tables = self.inner.write();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;

        session.status = SessionStatus::Failed;
        session.status_changed_at = Utc::now();
        session.completed_at = Some(Utc::now());
        session.rotation_in_progress = false;
        session.active_generation += 1;
        session.rotation_attempts += 1;
        let snapshot = session.clone();

        let conversation_id = session.conversation_id.clone();
        tables.active_sessions.remove(&conversation_id);

        rotation.failed = true;
        rotation.completed_at = Some(Utc::now());
        tables.rotations.push(rotation);
        Ok(snapshot)
    }

    /// Flip an Active session to Summarizing (edge-triggered; returns
    /// false when already triggered or not active).
    pub fn mark_summarizing(&self, session_id: &str, expected_generation: u64) -> Result<bool> {
        self.session_cas(session_id, expected_generation, |session| {
            if session.summarize_triggered || session.status != SessionStatus::Active {
                return false;
            }
            session.summarize_triggered = true;
            session.status = SessionStatus::Summarizing;
            session.status_changed_at = Utc::now();
            true
        })
    }

    pub fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut tables = self.inner.write();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;
        session.status = status;
        session.status_changed_at = Utc::now();
        if status.is_terminal() {
            session.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    // ── Token usage ──────────────────────────────────────────────────

    /// Insert a usage row, assigning `turn_id`, updating the session's
    /// spent counter, and computing cumulative utilization.
    pub fn record_usage(&self, session_id: &str, draft: UsageDraft) -> Result<SessionTokenUsage> {
        let mut tables = self.inner.write();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;

        session.last_turn_id += 1;
        let tokens_total = draft.tokens_in + draft.tokens_out;
        session.tokens_spent += tokens_total;

        let row = SessionTokenUsage {
            session_id: session_id.to_owned(),
            turn_id: session.last_turn_id,
            call_key: draft.call_key,
            tokens_in: draft.tokens_in,
            tokens_out: draft.tokens_out,
            tokens_total,
            cumulative_tokens: session.tokens_spent,
            utilization_pct: session.utilization_pct(),
            active_generation: draft.active_generation,
            generation_at_completion: None,
            recorded_at: Utc::now(),
        };

        tables
            .usage
            .entry(session_id.to_owned())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    /// Record the generation observed when the call completed.
    pub fn set_usage_completion_generation(
        &self,
        session_id: &str,
        turn_id: u64,
        generation: u64,
    ) -> Result<()> {
        let mut tables = self.inner.write();
        let rows = tables
            .usage
            .get_mut(session_id)
            .ok_or_else(|| Error::State(format!("no usage for session {session_id}")))?;
        let row = rows
            .iter_mut()
            .find(|r| r.turn_id == turn_id)
            .ok_or_else(|| Error::State(format!("no turn {turn_id} for session {session_id}")))?;
        row.generation_at_completion = Some(generation);
        Ok(())
    }

    pub fn usage_for_session(&self, session_id: &str) -> Vec<SessionTokenUsage> {
        self.inner
            .read()
            .usage
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    // ── Subagent calls ───────────────────────────────────────────────

    /// Insert a call row. `call_key` is a unique index; duplicates are
    /// rejected.
    pub fn insert_call(&self, call: SubagentCall) -> Result<()> {
        let mut tables = self.inner.write();
        if tables.calls.contains_key(&call.call_key) {
            return Err(Error::State(format!(
                "call_key {} already exists",
                call.call_key
            )));
        }
        tables.calls.insert(call.call_key.clone(), call);
        Ok(())
    }

    /// Update a call in place; journals the row when the update made it
    /// terminal.
    pub fn update_call(
        &self,
        call_key: &str,
        f: impl FnOnce(&mut SubagentCall),
    ) -> Result<SubagentCall> {
        let updated = {
            let mut tables = self.inner.write();
            let call = tables
                .calls
                .get_mut(call_key)
                .ok_or_else(|| Error::State(format!("unknown call_key {call_key}")))?;
            let was_terminal = call.status.is_terminal();
            f(call);
            if call.status.is_terminal() && call.completed_at.is_none() {
                call.completed_at = Some(Utc::now());
                call.duration_ms = Some(
                    (Utc::now() - call.started_at).num_milliseconds().max(0) as u64,
                );
            }
            let became_terminal = !was_terminal && call.status.is_terminal();
            (call.clone(), became_terminal)
        };
        let (snapshot, became_terminal) = updated;
        if became_terminal {
            self.journal_call(&snapshot);
        }
        Ok(snapshot)
    }

    pub fn call(&self, call_key: &str) -> Option<SubagentCall> {
        self.inner.read().calls.get(call_key).cloned()
    }

    pub fn calls_for_conversation(&self, conversation_id: &str) -> Vec<SubagentCall> {
        let mut calls: Vec<_> = self
            .inner
            .read()
            .calls
            .values()
            .filter(|c| c.conversation_id == conversation_id)
            .cloned()
            .collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    // ── Budget reconciliation ────────────────────────────────────────

    /// Apply a reconciliation: append the delta row and fold it into the
    /// conversation counters. Idempotent by call_key.
    pub fn apply_reconciliation(&self, row: BudgetReconciliation) -> Result<()> {
        let mut tables = self.inner.write();
        if tables
            .reconciliations
            .iter()
            .any(|r| r.call_key == row.call_key)
        {
            return Ok(());
        }
        let conv = tables
            .conversations
            .get_mut(&row.conversation_id)
            .ok_or_else(|| Error::State(format!("unknown conversation {}", row.conversation_id)))?;

        conv.tokens_reserved = conv.tokens_reserved.saturating_sub(row.tokens_reserved);
        conv.tokens_spent = conv
            .tokens_spent
            .saturating_sub(row.tokens_reserved)
            .saturating_add(row.tokens_actual);
        conv.cost_usd = conv.cost_usd.saturating_add(row.cost_usd);

        tables.reconciliations.push(row);
        Ok(())
    }

    pub fn reconciliations_for(&self, conversation_id: &str) -> Vec<BudgetReconciliation> {
        self.inner
            .read()
            .reconciliations
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    // ── Rotations ────────────────────────────────────────────────────

    pub fn rotations_for_conversation(&self, conversation_id: &str) -> Vec<SessionRotation> {
        self.inner
            .read()
            .rotations
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    // ── Checkpoints ──────────────────────────────────────────────────

    /// Record (or replace) a phase checkpoint.
    pub fn record_checkpoint(&self, checkpoint: PhaseCheckpoint) -> Result<()> {
        let mut tables = self.inner.write();
        if !tables.conversations.contains_key(&checkpoint.conversation_id) {
            return Err(Error::State(format!(
                "unknown conversation {}",
                checkpoint.conversation_id
            )));
        }
        let list = tables
            .checkpoints
            .entry(checkpoint.conversation_id.clone())
            .or_default();
        list.retain(|c| c.phase != checkpoint.phase);
        list.push(checkpoint);
        Ok(())
    }

    pub fn checkpoint(&self, conversation_id: &str, phase: &str) -> Option<PhaseCheckpoint> {
        self.inner
            .read()
            .checkpoints
            .get(conversation_id)?
            .iter()
            .find(|c| c.phase == phase)
            .cloned()
    }

    pub fn checkpoints_for(&self, conversation_id: &str) -> Vec<PhaseCheckpoint> {
        self.inner
            .read()
            .checkpoints
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent completed checkpoint of a conversation.
    pub fn last_completed_checkpoint(&self, conversation_id: &str) -> Option<PhaseCheckpoint> {
        self.inner
            .read()
            .checkpoints
            .get(conversation_id)?
            .iter()
            .filter(|c| c.status == CheckpointStatus::Completed)
            .max_by_key(|c| c.recorded_at)
            .cloned()
    }

    // ── Config snapshots ─────────────────────────────────────────────

    pub fn config_snapshot(&self, config_version: &str) -> Option<ConfigSnapshot> {
        self.inner
            .read()
            .config_snapshots
            .get(config_version)
            .cloned()
    }

    pub(crate) fn with_tables_mut<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.inner.read())
    }
}

pub(crate) fn make_session(
    conversation_id: &str,
    parent_session_id: Option<String>,
    session_number: u32,
    seed: &SessionSeed,
) -> Session {
    Session {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_owned(),
        parent_session_id,
        session_number,
        active_generation: 1,
        rotation_in_progress: false,
        tokens_budget: seed.tokens_budget,
        tokens_spent: 0,
        summarize_threshold_pct: seed.summarize_threshold_pct,
        rotate_threshold_pct: seed.rotate_threshold_pct,
        context_summary_ref: seed.context_summary_ref.clone(),
        preserved_state: seed.preserved_state.clone(),
        status: SessionStatus::Active,
        model_name: seed.model_name.clone(),
        agent_type: seed.agent_type.clone(),
        created_at: Utc::now(),
        status_changed_at: Utc::now(),
        completed_at: None,
        rotation_attempts: 0,
        summarize_triggered: false,
        last_turn_id: 0,
    }
}

/// Write via tmp file + rename so a crash never leaves a torn snapshot.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, bytes).map_err(Error::Io)?;
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
