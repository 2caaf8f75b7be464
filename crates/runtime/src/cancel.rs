//! Cooperative cancellation, scoped the way the runtime spends work: one
//! flag per conversation, one per in-flight call, with conversation
//! cancellation fanning out to every call still registered under it.
//!
//! A call that enters an already-cancelled conversation receives a token
//! that is born cancelled, so late submissions stop before they reach a
//! provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation flag checked by the runtime at suspension points.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that starts life cancelled.
    fn already_cancelled() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything cancellable under one conversation: its own flag plus the
/// flags of its in-flight calls, keyed by call_key.
#[derive(Default)]
struct ConversationScope {
    token: CancelToken,
    calls: HashMap<String, CancelToken>,
}

/// Cancellation scopes for running conversations and their calls.
pub struct CancelRegistry {
    scopes: Mutex<HashMap<String, ConversationScope>>,
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// The conversation's token, created on first use. A cancellation
    /// issued before the run starts still takes effect, because the run
    /// picks up this same token.
    pub fn conversation(&self, conversation_id: &str) -> CancelToken {
        self.scopes
            .lock()
            .entry(conversation_id.to_owned())
            .or_default()
            .token
            .clone()
    }

    /// Register a call under its conversation. When the conversation is
    /// already cancelled the returned token is too.
    pub fn register_call(&self, conversation_id: &str, call_key: &str) -> CancelToken {
        let mut scopes = self.scopes.lock();
        let scope = scopes.entry(conversation_id.to_owned()).or_default();
        let token = if scope.token.is_cancelled() {
            CancelToken::already_cancelled()
        } else {
            CancelToken::new()
        };
        scope.calls.insert(call_key.to_owned(), token.clone());
        token
    }

    /// Cancel a conversation and every call registered under it.
    /// Returns true when the conversation was known.
    pub fn cancel_conversation(&self, conversation_id: &str) -> bool {
        let scopes = self.scopes.lock();
        let Some(scope) = scopes.get(conversation_id) else {
            return false;
        };
        scope.token.cancel();
        for call_token in scope.calls.values() {
            call_token.cancel();
        }
        true
    }

    /// Drop a finished call's registration. Cancelling the conversation
    /// afterwards no longer touches it.
    pub fn finish_call(&self, conversation_id: &str, call_key: &str) {
        let mut scopes = self.scopes.lock();
        if let Some(scope) = scopes.get_mut(conversation_id) {
            scope.calls.remove(call_key);
        }
    }

    /// Drop a finished conversation and anything still registered under it.
    pub fn finish_conversation(&self, conversation_id: &str) {
        self.scopes.lock().remove(conversation_id);
    }

    /// Calls still registered under a conversation.
    pub fn active_calls(&self, conversation_id: &str) -> usize {
        self.scopes
            .lock()
            .get(conversation_id)
            .map(|scope| scope.calls.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_flips_once_and_stays() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn token_clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn conversation_token_is_stable_across_lookups() {
        let registry = CancelRegistry::new();
        let first = registry.conversation("conv");
        let second = registry.conversation("conv");
        first.cancel();
        assert!(second.is_cancelled());
    }

    #[test]
    fn cancel_before_run_starts_takes_effect() {
        let registry = CancelRegistry::new();
        registry.conversation("conv").cancel();

        // The run later obtains the same token and sees the cancellation.
        assert!(registry.conversation("conv").is_cancelled());
    }

    #[test]
    fn conversation_cancel_fans_out_to_calls() {
        let registry = CancelRegistry::new();
        let call_a = registry.register_call("conv", "key-a");
        let call_b = registry.register_call("conv", "key-b");

        assert!(registry.cancel_conversation("conv"));
        assert!(call_a.is_cancelled());
        assert!(call_b.is_cancelled());
    }

    #[test]
    fn call_registered_after_cancel_is_born_cancelled() {
        let registry = CancelRegistry::new();
        registry.register_call("conv", "early");
        registry.cancel_conversation("conv");

        let late = registry.register_call("conv", "late");
        assert!(late.is_cancelled());
    }

    #[test]
    fn finished_call_is_outside_the_blast_radius() {
        let registry = CancelRegistry::new();
        let done = registry.register_call("conv", "done");
        registry.finish_call("conv", "done");
        assert_eq!(registry.active_calls("conv"), 0);

        registry.cancel_conversation("conv");
        assert!(!done.is_cancelled());
    }

    #[test]
    fn cancel_unknown_conversation_returns_false() {
        let registry = CancelRegistry::new();
        assert!(!registry.cancel_conversation("ghost"));
    }

    #[test]
    fn finish_conversation_drops_the_scope() {
        let registry = CancelRegistry::new();
        registry.register_call("conv", "k");
        registry.finish_conversation("conv");
        assert_eq!(registry.active_calls("conv"), 0);
        assert!(!registry.cancel_conversation("conv"));
        // Finishing again is harmless.
        registry.finish_conversation("conv");
    }
}
