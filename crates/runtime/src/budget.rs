//! Per-conversation token and cost accounting with reserve/commit
//! semantics.
//!
//! A reservation charges the estimate against the conversation up front;
//! committing reconciles the charge to actuals via a delta row, and
//! releasing refunds it. The invariant the reconciliation log maintains:
//! `tokens_spent == Σ actual(committed) + Σ reserved(pending)`, never
//! above the budget.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use sibyl_domain::config::BudgetConfig;
use sibyl_domain::error::{Error, Result};
use sibyl_domain::{CostUsd, TraceEvent};
use sibyl_state::{BudgetReconciliation, StateStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A pending token charge. Becomes an actual charge on `commit`, or is
/// refunded on `release`. Not copyable: exactly one of the two happens.
#[derive(Debug)]
pub struct Reservation {
    pub conversation_id: String,
    pub session_id: String,
    pub tokens: u64,
}

/// Snapshot of a conversation's budget position.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub spent: u64,
    pub remaining: u64,
    pub reserved: u64,
    pub cost_usd: CostUsd,
    pub request_count: u64,
    pub utilization_pct: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BudgetTracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token/cost budget enforcement. All counter updates route through the
/// state store's conversation row, which serializes them.
pub struct BudgetTracker {
    state: Arc<StateStore>,
    config: BudgetConfig,
    /// Conversations that already emitted their one budget alert.
    alerted: Mutex<HashSet<String>>,
}

impl BudgetTracker {
    pub fn new(state: Arc<StateStore>, config: BudgetConfig) -> Self {
        Self {
            state,
            config,
            alerted: Mutex::new(HashSet::new()),
        }
    }

    /// Atomically charge `estimate_tokens` against the conversation.
    ///
    /// Fails with `BudgetExhausted`, before any provider call is made,
    /// when the estimate would exceed the token budget, the request cap,
    /// or the cost ceiling.
    pub fn reserve(
        &self,
        conversation_id: &str,
        session_id: &str,
        estimate_tokens: u64,
    ) -> Result<Reservation> {
        let alert_threshold = self.config.alert_threshold_pct;
        let max_requests = self.config.max_requests;
        let max_cost = self.config.max_cost_usd;

        let outcome = self.state.with_conversation_mut(conversation_id, |conv| {
            let remaining = conv.token_budget.saturating_sub(conv.tokens_spent);
            if estimate_tokens > remaining {
                return Err(Error::BudgetExhausted {
                    requested: estimate_tokens,
                    remaining,
                });
            }
            if let Some(cap) = max_requests {
                if conv.request_count >= cap {
                    return Err(Error::BudgetExhausted {
                        requested: estimate_tokens,
                        remaining: 0,
                    });
                }
            }
            if let Some(cap) = max_cost {
                if conv.cost_usd >= cap {
                    return Err(Error::BudgetExhausted {
                        requested: estimate_tokens,
                        remaining: 0,
                    });
                }
            }

            conv.tokens_spent += estimate_tokens;
            conv.tokens_reserved += estimate_tokens;
            conv.request_count += 1;

            let utilization =
                conv.tokens_spent as f64 / conv.token_budget.max(1) as f64 * 100.0;
            Ok((utilization, conv.token_budget))
        })?;

        match outcome {
            Ok((utilization, _budget)) => {
                if utilization >= alert_threshold
                    && self.alerted.lock().insert(conversation_id.to_owned())
                {
                    TraceEvent::BudgetAlert {
                        conversation_id: conversation_id.to_owned(),
                        utilization_pct: utilization,
                        threshold_pct: alert_threshold,
                    }
                    .emit();
                }
                Ok(Reservation {
                    conversation_id: conversation_id.to_owned(),
                    session_id: session_id.to_owned(),
                    tokens: estimate_tokens,
                })
            }
            Err(err) => {
                if let Error::BudgetExhausted { requested, remaining } = &err {
                    TraceEvent::ReservationDenied {
                        conversation_id: conversation_id.to_owned(),
                        requested: *requested,
                        remaining: *remaining,
                    }
                    .emit();
                }
                Err(err)
            }
        }
    }

    /// Reconcile a reservation to actuals. Idempotent by `call_key`: the
    /// second commit for the same key is a no-op.
    pub fn commit(
        &self,
        reservation: Reservation,
        call_key: &str,
        actual_tokens: u64,
        cost_usd: CostUsd,
    ) -> Result<()> {
        self.state.apply_reconciliation(BudgetReconciliation {
            call_key: call_key.to_owned(),
            conversation_id: reservation.conversation_id.clone(),
            tokens_reserved: reservation.tokens,
            tokens_actual: actual_tokens,
            delta: actual_tokens as i64 - reservation.tokens as i64,
            cost_usd,
            recorded_at: Utc::now(),
        })
    }

    /// Refund an unused reservation (the call never consumed tokens).
    pub fn release(&self, reservation: Reservation) -> Result<()> {
        self.state
            .with_conversation_mut(&reservation.conversation_id, |conv| {
                conv.tokens_spent = conv.tokens_spent.saturating_sub(reservation.tokens);
                conv.tokens_reserved = conv.tokens_reserved.saturating_sub(reservation.tokens);
            })
    }

    pub fn snapshot(&self, conversation_id: &str) -> Result<BudgetSnapshot> {
        let conv = self
            .state
            .conversation(conversation_id)
            .ok_or_else(|| Error::State(format!("unknown conversation {conversation_id}")))?;
        Ok(BudgetSnapshot {
            spent: conv.tokens_spent,
            remaining: conv.token_budget.saturating_sub(conv.tokens_spent),
            reserved: conv.tokens_reserved,
            cost_usd: conv.cost_usd,
            request_count: conv.request_count,
            utilization_pct: conv.tokens_spent as f64 / conv.token_budget.max(1) as f64 * 100.0,
        })
    }
}
