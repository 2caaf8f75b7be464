//! Liveness and readiness.
//!
//! Live means the process runs. Ready means the state store is open, a
//! primary LLM provider is registered, and no boot-integrity finding is
//! outstanding.

use serde::Serialize;

use crate::context::RuntimeContext;

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub live: bool,
    pub ready: bool,
    pub reasons: Vec<String>,
}

/// Evaluate the health contract against the running context.
pub fn check(ctx: &RuntimeContext) -> Health {
    let mut reasons = Vec::new();

    if ctx.providers.primary_llm().is_none() {
        reasons.push("no primary LLM provider registered".to_owned());
    }
    for init_error in ctx.providers.init_errors() {
        reasons.push(format!(
            "provider {} failed to initialize: {}",
            init_error.provider_name, init_error.error
        ));
    }

    let timeout = chrono::Duration::seconds(ctx.config.session.rotation_timeout_secs as i64);
    let report = ctx.state.integrity_scan(timeout);
    if !report.is_empty() {
        reasons.push(format!(
            "{} unrepaired integrity findings",
            report.total_findings()
        ));
    }

    Health {
        live: true,
        ready: reasons.is_empty(),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_domain::config::WorkspaceConfig;
    use sibyl_providers::mock::MockLlm;
    use sibyl_providers::ProviderRegistry;
    use std::sync::Arc;

    #[test]
    fn ready_with_provider_and_clean_store() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(MockLlm::new("main")));
        let ctx = RuntimeContext::build(WorkspaceConfig::default(), registry, None).unwrap();

        let health = check(&ctx);
        assert!(health.live);
        assert!(health.ready, "reasons: {:?}", health.reasons);
    }

    #[test]
    fn ready_while_a_reservation_is_in_flight() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(MockLlm::new("main")));
        let ctx = RuntimeContext::build(WorkspaceConfig::default(), registry, None).unwrap();

        // A running conversation holding a live reservation is normal
        // operation; a readiness probe landing mid-call must stay green.
        let (conv, session) = ctx
            .state
            .create_conversation(
                "qa",
                100_000,
                &ctx.config_version,
                serde_json::json!({}),
                ctx.sessions.seed(
                    None,
                    None,
                    sibyl_domain::PreservedState::new(),
                    None,
                ),
            )
            .unwrap();
        ctx.budget.reserve(&conv.id, &session.id, 200).unwrap();

        let health = check(&ctx);
        assert!(health.ready, "reasons: {:?}", health.reasons);
    }

    #[test]
    fn not_ready_without_primary_llm() {
        let ctx =
            RuntimeContext::build(WorkspaceConfig::default(), ProviderRegistry::new(), None)
                .unwrap();
        let health = check(&ctx);
        assert!(health.live);
        assert!(!health.ready);
        assert!(health.reasons[0].contains("primary LLM"));
    }

    #[test]
    fn provider_init_errors_block_readiness() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(MockLlm::new("main")));
        registry.record_init_error("backup", "llm", "bad credentials");
        let ctx = RuntimeContext::build(WorkspaceConfig::default(), registry, None).unwrap();

        let health = check(&ctx);
        assert!(!health.ready);
        assert!(health.reasons.iter().any(|r| r.contains("backup")));
    }
}
