//! Boot-time integrity views and repair.
//!
//! A crash can leave sessions mid-rotation, rotation events pointing at
//! sessions that were never written, active sessions of finished
//! conversations, and token counters that disagree with the usage log.
//! `integrity_scan` finds all four; `integrity_repair` fixes what is
//! mechanically repairable and reports what it did.

use chrono::{Duration, Utc};
use uuid::Uuid;

use sibyl_domain::TraceEvent;

use crate::records::*;
use crate::store::{make_session, SessionSeed, StateStore};

/// Allowed disagreement between the recorded spend and the recomputed
/// spend before a conversation counts as mismatched.
pub const TOKEN_TOLERANCE: u64 = 100;

/// One conversation whose spend counter disagrees with its ledgers.
///
/// The invariant: `tokens_spent == Σ actual tokens of committed calls +
/// pending reserved tokens`, within [`TOKEN_TOLERANCE`]. A live
/// reservation satisfies the invariant and is never a mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMismatch {
    pub conversation_id: String,
    /// `tokens_spent` as recorded on the conversation row.
    pub recorded: u64,
    /// Committed actuals from the reconciliation log plus pending
    /// reservations.
    pub recomputed: u64,
}

/// A reservation found at boot with nothing left that could settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleReservation {
    pub conversation_id: String,
    pub tokens_released: u64,
}

/// A single finding, for logs and the readiness check.
#[derive(Debug, Clone)]
pub enum IntegrityFinding {
    StuckSession(String),
    OrphanedRotation(String),
    AbandonedActiveSession(String),
    TokenMismatch(TokenMismatch),
}

impl std::fmt::Display for IntegrityFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StuckSession(id) => write!(f, "session {id} stuck mid-rotation"),
            Self::OrphanedRotation(id) => write!(f, "rotation {id} references a missing session"),
            Self::AbandonedActiveSession(id) => {
                write!(f, "session {id} active under a finished conversation")
            }
            Self::TokenMismatch(m) => write!(
                f,
                "conversation {} spent {} but the ledgers say {}",
                m.conversation_id, m.recorded, m.recomputed
            ),
        }
    }
}

/// Everything the boot sweep found.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub stuck_sessions: Vec<String>,
    pub orphaned_rotations: Vec<String>,
    pub abandoned_active_sessions: Vec<String>,
    pub token_mismatches: Vec<TokenMismatch>,
}

impl IntegrityReport {
    pub fn is_empty(&self) -> bool {
        self.stuck_sessions.is_empty()
            && self.orphaned_rotations.is_empty()
            && self.abandoned_active_sessions.is_empty()
            && self.token_mismatches.is_empty()
    }

    pub fn total_findings(&self) -> usize {
        self.stuck_sessions.len()
            + self.orphaned_rotations.len()
            + self.abandoned_active_sessions.len()
            + self.token_mismatches.len()
    }

    pub fn findings(&self) -> Vec<IntegrityFinding> {
        let mut out = Vec::with_capacity(self.total_findings());
        out.extend(self.stuck_sessions.iter().cloned().map(IntegrityFinding::StuckSession));
        out.extend(
            self.orphaned_rotations
                .iter()
                .cloned()
                .map(IntegrityFinding::OrphanedRotation),
        );
        out.extend(
            self.abandoned_active_sessions
                .iter()
                .cloned()
                .map(IntegrityFinding::AbandonedActiveSession),
        );
        out.extend(
            self.token_mismatches
                .iter()
                .cloned()
                .map(IntegrityFinding::TokenMismatch),
        );
        out
    }
}

/// What the boot repair actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub stuck_repaired: usize,
    pub orphans_deleted: usize,
    pub sessions_abandoned: usize,
    pub mismatches_reconciled: usize,
    pub stale_reservations_released: usize,
}

impl RepairSummary {
    pub fn total(&self) -> usize {
        self.stuck_repaired
            + self.orphans_deleted
            + self.sessions_abandoned
            + self.mismatches_reconciled
            + self.stale_reservations_released
    }
}

impl StateStore {
    /// Scan all tables for crash damage.
    pub fn integrity_scan(&self, rotation_timeout: Duration) -> IntegrityReport {
        let now = Utc::now();
        self.with_tables(|tables| {
            let mut report = IntegrityReport::default();

            for session in tables.sessions.values() {
                if matches!(
                    session.status,
                    SessionStatus::Rotating | SessionStatus::Summarizing
                ) && now - session.status_changed_at > rotation_timeout
                {
                    report.stuck_sessions.push(session.id.clone());
                }

                let conversation_finished = tables
                    .conversations
                    .get(&session.conversation_id)
                    .map(|c| c.status.is_terminal())
                    .unwrap_or(true);
                if !session.status.is_terminal() && conversation_finished {
                    report.abandoned_active_sessions.push(session.id.clone());
                }
            }

            for rotation in &tables.rotations {
                if let Some(to) = &rotation.to_session_id {
                    if !tables.sessions.contains_key(to) {
                        report.orphaned_rotations.push(rotation.id.clone());
                    }
                }
            }

            for conv in tables.conversations.values() {
                if conv.status.is_terminal() {
                    continue;
                }
                let committed: u64 = tables
                    .reconciliations
                    .iter()
                    .filter(|r| r.conversation_id == conv.id)
                    .map(|r| r.tokens_actual)
                    .sum();
                let recomputed = committed + conv.tokens_reserved;
                if conv.tokens_spent.abs_diff(recomputed) > TOKEN_TOLERANCE {
                    report.token_mismatches.push(TokenMismatch {
                        conversation_id: conv.id.clone(),
                        recorded: conv.tokens_spent,
                        recomputed,
                    });
                }
            }

            report.stuck_sessions.sort();
            report.abandoned_active_sessions.sort();
            report
        })
    }

    /// Repair the findings of a scan.
    ///
    /// Stuck sessions are force-completed with `fallback_used = true` and,
    /// when their conversation is still running, replaced by a
    /// restart-strategy successor carrying only the preserved state.
    /// Orphaned rotations are deleted, abandoned sessions marked, and
    /// mismatched counters recomputed from the usage log (dropping any
    /// reservation no process can still hold).
    pub fn integrity_repair(
        &self,
        report: &IntegrityReport,
        restart_seed: impl Fn(&Session) -> SessionSeed,
    ) -> RepairSummary {
        let mut summary = RepairSummary::default();

        self.with_tables_mut(|tables| {
            for session_id in &report.stuck_sessions {
                let Some(stuck) = tables.sessions.get_mut(session_id) else {
                    continue;
                };
                stuck.status = SessionStatus::Completed;
                stuck.status_changed_at = Utc::now();
                stuck.completed_at = Some(Utc::now());
                stuck.rotation_in_progress = false;
                stuck.active_generation += 1;
                let stuck = stuck.clone();

                let conversation_running = tables
                    .conversations
                    .get(&stuck.conversation_id)
                    .map(|c| !c.status.is_terminal())
                    .unwrap_or(false);

                let successor_id = if conversation_running {
                    let mut seed = restart_seed(&stuck);
                    seed.preserved_state = stuck.preserved_state.clone();
                    seed.context_summary_ref = None;
                    let successor = make_session(
                        &stuck.conversation_id,
                        Some(stuck.id.clone()),
                        stuck.session_number + 1,
                        &seed,
                    );
                    tables
                        .active_sessions
                        .insert(stuck.conversation_id.clone(), successor.id.clone());
                    let id = successor.id.clone();
                    tables.sessions.insert(id.clone(), successor);
                    Some(id)
                } else {
                    tables.active_sessions.remove(&stuck.conversation_id);
                    None
                };

                tables.rotations.push(SessionRotation {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: stuck.conversation_id.clone(),
                    from_session_id: stuck.id.clone(),
                    to_session_id: successor_id.clone(),
                    trigger: RotationTrigger::Forced,
                    tokens_before_rotation: stuck.tokens_spent,
                    tokens_threshold: 0,
                    summarization_strategy: SummarizationStrategy::Restart,
                    context_summary_ref: None,
                    compression_ratio: 1.0,
                    agent_before: stuck.agent_type.clone(),
                    agent_after: stuck.agent_type.clone(),
                    model_before: stuck.model_name.clone(),
                    model_after: stuck.model_name.clone(),
                    started_at: Utc::now(),
                    completed_at: Some(Utc::now()),
                    handoff_ms: Some(0),
                    preserved_context_keys: stuck.preserved_state.keys().map(String::from).collect(),
                    fallback_used: true,
                    failed: false,
                });

                TraceEvent::IntegrityRepaired {
                    finding: "stuck_session".into(),
                    subject_id: stuck.id.clone(),
                }
                .emit();
                summary.stuck_repaired += 1;
            }

            if !report.orphaned_rotations.is_empty() {
                let before = tables.rotations.len();
                tables
                    .rotations
                    .retain(|r| !report.orphaned_rotations.contains(&r.id));
                summary.orphans_deleted = before - tables.rotations.len();
            }

            for session_id in &report.abandoned_active_sessions {
                if let Some(session) = tables.sessions.get_mut(session_id) {
                    if !session.status.is_terminal() {
                        session.status = SessionStatus::Abandoned;
                        session.status_changed_at = Utc::now();
                        session.completed_at = Some(Utc::now());
                        summary.sessions_abandoned += 1;
                    }
                }
            }

            for mismatch in &report.token_mismatches {
                if let Some(conv) = tables.conversations.get_mut(&mismatch.conversation_id) {
                    // Restore the invariant; pending reservations are part
                    // of it and stay untouched here.
                    conv.tokens_spent = mismatch.recomputed;
                    TraceEvent::IntegrityRepaired {
                        finding: "token_mismatch".into(),
                        subject_id: conv.id.clone(),
                    }
                    .emit();
                    summary.mismatches_reconciled += 1;
                }
            }
        });

        if summary.total() > 0 {
            tracing::warn!(
                stuck = summary.stuck_repaired,
                orphans = summary.orphans_deleted,
                abandoned = summary.sessions_abandoned,
                mismatches = summary.mismatches_reconciled,
                "integrity repair applied"
            );
        }
        summary
    }

    /// Boot-path sweep: refund reservations with no live holder.
    ///
    /// A reservation is held by a call that is still queued or running;
    /// after a crash no such call exists, so whatever `tokens_reserved`
    /// the snapshot carries can never be committed or released by its
    /// owner. This runs during crash recovery only; the readiness scan
    /// must not treat an in-flight reservation as damage.
    pub fn release_stale_reservations(&self) -> Vec<StaleReservation> {
        let released = self.with_tables_mut(|tables| {
            let stale: Vec<String> = tables
                .conversations
                .values()
                .filter(|conv| !conv.status.is_terminal() && conv.tokens_reserved > 0)
                .filter(|conv| {
                    !tables
                        .calls
                        .values()
                        .any(|c| c.conversation_id == conv.id && !c.status.is_terminal())
                })
                .map(|conv| conv.id.clone())
                .collect();

            let mut released = Vec::with_capacity(stale.len());
            for conversation_id in stale {
                if let Some(conv) = tables.conversations.get_mut(&conversation_id) {
                    let tokens = conv.tokens_reserved;
                    conv.tokens_spent = conv.tokens_spent.saturating_sub(tokens);
                    conv.tokens_reserved = 0;
                    TraceEvent::IntegrityRepaired {
                        finding: "stale_reservation".into(),
                        subject_id: conversation_id.clone(),
                    }
                    .emit();
                    released.push(StaleReservation {
                        conversation_id,
                        tokens_released: tokens,
                    });
                }
            }
            released
        });

        for stale in &released {
            tracing::warn!(
                conversation_id = %stale.conversation_id,
                tokens = stale.tokens_released,
                "released reservation with no live holder"
            );
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_domain::PreservedState;

    /// A minimal non-terminal call row, the live holder of a reservation.
    fn live_call(key: &str, conversation_id: &str, session_id: &str) -> SubagentCall {
        SubagentCall {
            call_key: key.to_owned(),
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_owned(),
            session_id: session_id.to_owned(),
            phase: "phase".into(),
            agent_type: None,
            model_name: "m".into(),
            provider: "mock".into(),
            provider_fingerprint: None,
            prompt_ref: "p".into(),
            response_ref: None,
            tokens_in_reserved: 200,
            tokens_in_actual: 0,
            tokens_out_actual: 0,
            cost_usd: sibyl_domain::CostUsd::ZERO,
            status: CallStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            retry_of: None,
            retry_count: 0,
            finish_reason: None,
            error: None,
            error_kind: None,
            correlation_id: conversation_id.to_owned(),
            span_id: Uuid::new_v4().to_string(),
        }
    }

    fn seed() -> SessionSeed {
        SessionSeed {
            tokens_budget: 1000,
            summarize_threshold_pct: 60.0,
            rotate_threshold_pct: 70.0,
            model_name: None,
            agent_type: None,
            preserved_state: PreservedState::new(),
            context_summary_ref: None,
        }
    }

    fn restart_seed(session: &Session) -> SessionSeed {
        SessionSeed {
            tokens_budget: session.tokens_budget,
            summarize_threshold_pct: session.summarize_threshold_pct,
            rotate_threshold_pct: session.rotate_threshold_pct,
            model_name: session.model_name.clone(),
            agent_type: session.agent_type.clone(),
            preserved_state: PreservedState::new(),
            context_summary_ref: None,
        }
    }

    #[test]
    fn clean_store_scans_empty() {
        let store = StateStore::in_memory();
        store
            .create_conversation("qa", 1000, "v1", serde_json::json!({}), seed())
            .unwrap();
        let report = store.integrity_scan(Duration::seconds(300));
        assert!(report.is_empty(), "unexpected findings: {report:?}");
    }

    #[test]
    fn stuck_rotation_is_found_and_repaired_with_restart_successor() {
        let store = StateStore::in_memory();
        let (conv, session) = store
            .create_conversation("qa", 1000, "v1", serde_json::json!({}), seed())
            .unwrap();

        // Wedge the session mid-rotation, backdated past the timeout.
        store.begin_rotation(&session.id, 1).unwrap();
        store.with_tables_mut(|tables| {
            let s = tables.sessions.get_mut(&session.id).unwrap();
            s.status_changed_at = Utc::now() - Duration::seconds(600);
            s.preserved_state.insert("phase", "fix");
        });

        let report = store.integrity_scan(Duration::seconds(300));
        assert_eq!(report.stuck_sessions, vec![session.id.clone()]);

        let summary = store.integrity_repair(&report, restart_seed);
        assert_eq!(summary.stuck_repaired, 1);

        let old = store.session(&session.id).unwrap();
        assert_eq!(old.status, SessionStatus::Completed);
        assert!(!old.rotation_in_progress);

        let successor = store.active_session(&conv.id).expect("restart successor");
        assert_eq!(successor.parent_session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(successor.session_number, 2);
        assert!(successor.preserved_state.get("phase").is_some());

        let rotations = store.rotations_for_conversation(&conv.id);
        assert_eq!(rotations.len(), 1);
        assert!(rotations[0].fallback_used);
        assert_eq!(rotations[0].trigger, RotationTrigger::Forced);
        assert_eq!(
            rotations[0].summarization_strategy,
            SummarizationStrategy::Restart
        );

        // A second scan comes back clean.
        assert!(store.integrity_scan(Duration::seconds(300)).is_empty());
    }

    #[test]
    fn orphaned_rotation_is_deleted() {
        let store = StateStore::in_memory();
        let (conv, session) = store
            .create_conversation("qa", 1000, "v1", serde_json::json!({}), seed())
            .unwrap();

        store.with_tables_mut(|tables| {
            tables.rotations.push(SessionRotation {
                id: "rot-orphan".into(),
                conversation_id: conv.id.clone(),
                from_session_id: session.id.clone(),
                to_session_id: Some("no-such-session".into()),
                trigger: RotationTrigger::TokenThreshold,
                tokens_before_rotation: 0,
                tokens_threshold: 0,
                summarization_strategy: SummarizationStrategy::LlmCompress,
                context_summary_ref: None,
                compression_ratio: 1.0,
                agent_before: None,
                agent_after: None,
                model_before: None,
                model_after: None,
                started_at: Utc::now(),
                completed_at: None,
                handoff_ms: None,
                preserved_context_keys: Vec::new(),
                fallback_used: false,
                failed: false,
            });
        });

        let report = store.integrity_scan(Duration::seconds(300));
        assert_eq!(report.orphaned_rotations, vec!["rot-orphan".to_string()]);

        let summary = store.integrity_repair(&report, restart_seed);
        assert_eq!(summary.orphans_deleted, 1);
        assert!(store.rotations_for_conversation(&conv.id).is_empty());
    }

    #[test]
    fn abandoned_active_session_is_marked() {
        let store = StateStore::in_memory();
        let (conv, session) = store
            .create_conversation("qa", 1000, "v1", serde_json::json!({}), seed())
            .unwrap();

        // Terminate the conversation behind the store's back, leaving the
        // session active (simulates a crash between the two writes of an
        // older schema).
        store.with_tables_mut(|tables| {
            let c = tables.conversations.get_mut(&conv.id).unwrap();
            c.status = ConversationStatus::Failed;
            c.finished_at = Some(Utc::now());
        });

        let report = store.integrity_scan(Duration::seconds(300));
        assert_eq!(report.abandoned_active_sessions, vec![session.id.clone()]);

        let summary = store.integrity_repair(&report, restart_seed);
        assert_eq!(summary.sessions_abandoned, 1);
        assert_eq!(
            store.session(&session.id).unwrap().status,
            SessionStatus::Abandoned
        );
    }

    /// Simulate one settled call: reserve, then reconcile to actuals.
    fn settle_call(store: &StateStore, conversation_id: &str, call_key: &str, actual: u64) {
        store
            .with_conversation_mut(conversation_id, |c| {
                c.tokens_spent += actual;
            })
            .unwrap();
        store
            .apply_reconciliation(crate::records::BudgetReconciliation {
                call_key: call_key.to_owned(),
                conversation_id: conversation_id.to_owned(),
                tokens_reserved: actual,
                tokens_actual: actual,
                delta: 0,
                cost_usd: sibyl_domain::CostUsd::ZERO,
                recorded_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn token_mismatch_is_reconciled_from_committed_calls() {
        let store = StateStore::in_memory();
        let (conv, _) = store
            .create_conversation("qa", 100_000, "v1", serde_json::json!({}), seed())
            .unwrap();

        settle_call(&store, &conv.id, "k1", 400);

        // Corrupt the spend counter well past tolerance.
        store
            .with_conversation_mut(&conv.id, |c| c.tokens_spent = 5000)
            .unwrap();

        let report = store.integrity_scan(Duration::seconds(300));
        assert_eq!(report.token_mismatches.len(), 1);
        assert_eq!(report.token_mismatches[0].recorded, 5000);
        assert_eq!(report.token_mismatches[0].recomputed, 400);

        let summary = store.integrity_repair(&report, restart_seed);
        assert_eq!(summary.mismatches_reconciled, 1);
        assert_eq!(store.conversation(&conv.id).unwrap().tokens_spent, 400);
    }

    #[test]
    fn mismatch_within_tolerance_is_ignored() {
        let store = StateStore::in_memory();
        let (conv, _) = store
            .create_conversation("qa", 100_000, "v1", serde_json::json!({}), seed())
            .unwrap();

        settle_call(&store, &conv.id, "k1", 400);
        store
            .with_conversation_mut(&conv.id, |c| c.tokens_spent = 450)
            .unwrap();

        let report = store.integrity_scan(Duration::seconds(300));
        assert!(report.token_mismatches.is_empty());
    }

    #[test]
    fn live_reservation_satisfies_the_invariant() {
        let store = StateStore::in_memory();
        let (conv, session) = store
            .create_conversation("qa", 100_000, "v1", serde_json::json!({}), seed())
            .unwrap();

        // An in-flight call: reservation charged, call row non-terminal.
        store
            .with_conversation_mut(&conv.id, |c| {
                c.tokens_spent += 200;
                c.tokens_reserved += 200;
            })
            .unwrap();
        store
            .insert_call(live_call("k1", &conv.id, &session.id))
            .unwrap();

        // Perfectly healthy: the scan a readiness probe runs stays empty.
        let report = store.integrity_scan(Duration::seconds(300));
        assert!(report.is_empty(), "unexpected findings: {report:?}");
    }

    #[test]
    fn stale_reservation_is_released_on_boot_sweep() {
        let store = StateStore::in_memory();
        let (conv, _) = store
            .create_conversation("qa", 100_000, "v1", serde_json::json!({}), seed())
            .unwrap();

        settle_call(&store, &conv.id, "k1", 150);

        // A crashed process left a charged reservation and no call that
        // could ever settle it.
        store
            .with_conversation_mut(&conv.id, |c| {
                c.tokens_spent += 300;
                c.tokens_reserved += 300;
            })
            .unwrap();

        let released = store.release_stale_reservations();
        assert_eq!(
            released,
            vec![StaleReservation {
                conversation_id: conv.id.clone(),
                tokens_released: 300,
            }]
        );

        let conv = store.conversation(&conv.id).unwrap();
        assert_eq!(conv.tokens_spent, 150);
        assert_eq!(conv.tokens_reserved, 0);

        // Sweeping again finds nothing.
        assert!(store.release_stale_reservations().is_empty());
    }

    #[test]
    fn reservation_with_live_call_is_not_swept() {
        let store = StateStore::in_memory();
        let (conv, session) = store
            .create_conversation("qa", 100_000, "v1", serde_json::json!({}), seed())
            .unwrap();

        store
            .with_conversation_mut(&conv.id, |c| {
                c.tokens_spent += 200;
                c.tokens_reserved += 200;
            })
            .unwrap();
        store
            .insert_call(live_call("k1", &conv.id, &session.id))
            .unwrap();

        assert!(store.release_stale_reservations().is_empty());
        assert_eq!(store.conversation(&conv.id).unwrap().tokens_reserved, 200);
    }
}
