//! Agent manager: sessions, dispatch, cost accounting.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    AgentSession, ContextWindow, CostAccumulator, DropOldest, ProviderRegistry, ProviderRequest,
    Role, SendParams, SessionSummary, TokenBucket, TokenUsage, TruncationPolicy, Turn,
};
use crate::cache::{CacheKey, CachedResponse, PromptCache};
use crate::core::{EngineError, EngineResult};

/// What a dispatch returns to the stage handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub text: String,
    pub usage: TokenUsage,
    /// Served from the prompt cache (no provider call, no cost)
    pub cached: bool,
    /// Cost charged to the session for this call
    pub cost: f64,
}

/// Owns provider adapters, rate limiters, the prompt cache and live sessions.
pub struct AgentManager {
    providers: ProviderRegistry,
    limiters: HashMap<String, Arc<TokenBucket>>,
    cache: Arc<PromptCache>,
    sessions: Mutex<HashMap<String, AgentSession>>,
    truncation: Arc<dyn TruncationPolicy>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("providers", &self.providers.len())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl AgentManager {
    /// Create a manager; one rate limiter is built per provider.
    pub fn new(providers: ProviderRegistry, cache: Arc<PromptCache>) -> Self {
        let limiters = providers
            .iter()
            .map(|p| {
                let bucket =
                    TokenBucket::per_minute(p.config.requests_per_minute, p.config.burst);
                (p.config.name.clone(), Arc::new(bucket))
            })
            .collect();

        Self {
            providers,
            limiters,
            cache,
            sessions: Mutex::new(HashMap::new()),
            truncation: Arc::new(DropOldest),
        }
    }

    /// Use a different context truncation policy for new sessions.
    pub fn with_truncation_policy(mut self, policy: Arc<dyn TruncationPolicy>) -> Self {
        self.truncation = policy;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn cache(&self) -> &Arc<PromptCache> {
        &self.cache
    }

    /// Fail with `RequirementUnmet` unless some provider covers `required`.
    pub fn check_capabilities(&self, stage_id: &str, required: &BTreeSet<String>) -> EngineResult<()> {
        let missing = self.providers.missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::RequirementUnmet { stage: stage_id.to_string(), missing })
        }
    }

    /// Open a session on the first provider covering `required`.
    pub fn open_session(
        &self,
        stage_id: &str,
        required: &BTreeSet<String>,
        budget: usize,
        cancel: CancellationToken,
    ) -> EngineResult<String> {
        self.check_capabilities(stage_id, required)?;
        let provider = self
            .providers
            .select_for(required)
            .ok_or_else(|| EngineError::RequirementUnmet {
                stage: stage_id.to_string(),
                missing: required.iter().cloned().collect(),
            })?;

        let session = AgentSession {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.config.name.clone(),
            model: provider.config.model.clone(),
            stage_id: stage_id.to_string(),
            context: ContextWindow::with_policy(budget, Arc::clone(&self.truncation)),
            cost: CostAccumulator::default(),
            usage: TokenUsage::default(),
            provider_calls: 0,
            cache_hits: 0,
            cancel,
        };
        let id = session.id.clone();

        tracing::debug!(session = %id, stage = stage_id, provider = %session.provider, "Opened agent session");
        self.sessions.lock().insert(id.clone(), session);
        Ok(id)
    }

    /// Add a pinned turn (e.g. a system preamble) to a session.
    pub fn pin(&self, session_id: &str, role: Role, content: impl Into<String>) -> EngineResult<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        session.context.push(Turn::new(role, content).pinned());
        Ok(())
    }

    /// Current context window of a session.
    pub fn context(&self, session_id: &str) -> EngineResult<Vec<Turn>> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.context.turns())
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    /// Running totals of a live session.
    pub fn summary(&self, session_id: &str) -> EngineResult<SessionSummary> {
        self.sessions
            .lock()
            .get(session_id)
            .map(AgentSession::summary)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    /// Close a session and return its totals.
    pub fn close_session(&self, session_id: &str) -> EngineResult<SessionSummary> {
        let session = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        let summary = session.summary();
        tracing::debug!(
            session = %summary.session_id,
            cost = summary.cost,
            calls = summary.provider_calls,
            cache_hits = summary.cache_hits,
            "Closed agent session"
        );
        Ok(summary)
    }

    /// Send a rendered prompt through the session's provider.
    ///
    /// Consults the prompt cache first; on a miss the single-flight leader
    /// takes a rate-limiter token and calls the adapter under the provider's
    /// request timeout. Provider errors propagate unchanged so the stage
    /// retry policy sees them.
    pub async fn dispatch(
        &self,
        session_id: &str,
        prompt: &str,
        params: &SendParams,
    ) -> EngineResult<DispatchResult> {
        let (provider_name, model, cancel) = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            (session.provider.clone(), session.model.clone(), session.cancel.clone())
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let registered = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| EngineError::NotFound(format!("provider {provider_name}")))?;
        let adapter = Arc::clone(&registered.adapter);
        let pricing = registered.config.pricing;
        let request_timeout = registered.config.request_timeout;
        let limiter = self
            .limiters
            .get(&provider_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(TokenBucket::unlimited()));

        let key = CacheKey::new(prompt, &model, params);
        let request =
            ProviderRequest { prompt: prompt.to_string(), model: model.clone(), params: params.clone() };

        let call_cancel = cancel.clone();
        let call_provider = provider_name.clone();
        let lookup = self
            .cache
            .get_or_compute(&key, || async move {
                limiter.acquire(&call_cancel).await?;
                tracing::debug!(provider = %call_provider, model = %request.model, "Calling provider");

                let call = tokio::time::timeout(request_timeout, adapter.send(&request, &call_cancel));
                // Adapter first, so it can observe the token and unwind itself.
                let response = tokio::select! {
                    biased;
                    result = call => result.map_err(|_| {
                        EngineError::Timeout(format!(
                            "provider '{call_provider}' call exceeded {}ms",
                            request_timeout.as_millis()
                        ))
                    })??,
                    () = call_cancel.cancelled() => return Err(EngineError::Cancelled),
                };

                Ok::<_, EngineError>(CachedResponse {
                    text: response.text,
                    usage: response.usage,
                    model: request.model,
                })
            })
            .await?;

        let usage = lookup.response.usage;
        let cost = if lookup.hit { 0.0 } else { usage.cost(&pricing) };

        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            session.context.push(Turn::new(Role::User, prompt).with_tokens(usage.prompt_tokens as usize));
            session.context.push(
                Turn::new(Role::Assistant, lookup.response.text.clone())
                    .with_tokens(usage.completion_tokens as usize),
            );
            if lookup.hit {
                session.cache_hits += 1;
            } else {
                session.cost.add(cost);
                session.usage.add(usage);
                session.provider_calls += 1;
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        Ok(DispatchResult { text: lookup.response.text.clone(), usage, cached: lookup.hit, cost })
    }
}

/// Budget-scoped handle to one session, handed to stage handlers.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    manager: Arc<AgentManager>,
    session_id: String,
    cancel: CancellationToken,
}

impl AgentHandle {
    pub fn new(manager: Arc<AgentManager>, session_id: String, cancel: CancellationToken) -> Self {
        Self { manager, session_id, cancel }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Dispatch with default parameters.
    pub async fn ask(&self, prompt: &str) -> EngineResult<DispatchResult> {
        self.dispatch(prompt, &SendParams::default()).await
    }

    /// Dispatch through the session's provider.
    pub async fn dispatch(&self, prompt: &str, params: &SendParams) -> EngineResult<DispatchResult> {
        self.manager.dispatch(&self.session_id, prompt, params).await
    }

    /// Pin a system preamble into the context window.
    pub fn pin_system(&self, content: impl Into<String>) -> EngineResult<()> {
        self.manager.pin(&self.session_id, Role::System, content)
    }

    /// Current context window.
    pub fn context(&self) -> EngineResult<Vec<Turn>> {
        self.manager.context(&self.session_id)
    }

    /// Running totals so far.
    pub fn summary(&self) -> EngineResult<SessionSummary> {
        self.manager.summary(&self.session_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::{Provider, ProviderConfig, ScriptedProvider};
    use crate::cache::CacheConfig;

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn manager_with(provider: Arc<ScriptedProvider>, config: ProviderConfig) -> Arc<AgentManager> {
        let mut registry = ProviderRegistry::new();
        registry.register(config, provider).unwrap();
        Arc::new(AgentManager::new(registry, Arc::new(PromptCache::default())))
    }

    fn priced() -> ProviderConfig {
        ProviderConfig::new("fixture")
            .with_kind("scripted")
            .with_capabilities(["text"])
            .with_pricing(1.0, 2.0)
    }

    #[tokio::test]
    async fn test_dispatch_accumulates_cost_and_context() {
        let provider = Arc::new(ScriptedProvider::new("fixture"));
        provider.push_response("one", TokenUsage::new(1000, 500));
        provider.push_response("two", TokenUsage::new(2000, 0));
        let manager = manager_with(Arc::clone(&provider), priced());

        let session = manager
            .open_session("design", &caps(&["text"]), 10_000, CancellationToken::new())
            .unwrap();
        let first = manager.dispatch(&session, "p1", &SendParams::default()).await.unwrap();
        let second = manager.dispatch(&session, "p2", &SendParams::default()).await.unwrap();

        assert!((first.cost - 2.0).abs() < 1e-9);
        assert!((second.cost - 2.0).abs() < 1e-9);
        assert_eq!(manager.context(&session).unwrap().len(), 4);

        let summary = manager.close_session(&session).unwrap();
        assert!((summary.cost - 4.0).abs() < 1e-9);
        assert_eq!(summary.provider_calls, 2);
        assert_eq!(summary.usage, TokenUsage::new(3000, 500));
        assert!(manager.close_session(&session).is_err());
    }

    #[tokio::test]
    async fn test_cache_hit_costs_nothing() {
        let provider = Arc::new(ScriptedProvider::new("fixture"));
        provider.push_response("answer", TokenUsage::new(1000, 1000));
        let manager = manager_with(Arc::clone(&provider), priced());

        let session = manager
            .open_session("design", &caps(&["text"]), 10_000, CancellationToken::new())
            .unwrap();
        manager.dispatch(&session, "same", &SendParams::default()).await.unwrap();
        let again = manager.dispatch(&session, "same", &SendParams::default()).await.unwrap();

        assert!(again.cached);
        assert_eq!(again.cost, 0.0);
        assert_eq!(again.text, "answer");
        assert_eq!(provider.call_count(), 1);

        let summary = manager.close_session(&session).unwrap();
        assert_eq!(summary.cache_hits, 1);
        assert!((summary.cost - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_share_one_upstream_call() {
        let provider =
            Arc::new(ScriptedProvider::new("fixture").with_latency(Duration::from_millis(50)));
        let manager = manager_with(Arc::clone(&provider), priced());

        let a = manager.open_session("a", &caps(&["text"]), 1000, CancellationToken::new()).unwrap();
        let b = manager.open_session("b", &caps(&["text"]), 1000, CancellationToken::new()).unwrap();

        let params = SendParams::default();
        let (ra, rb) = tokio::join!(
            manager.dispatch(&a, "identical", &params),
            manager.dispatch(&b, "identical", &params)
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(provider.call_count(), 1);
        assert_eq!(ra.text, rb.text);
        assert!(ra.cached != rb.cached);
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let provider = Arc::new(ScriptedProvider::new("fixture"));
        provider.push_error(EngineError::RateLimited {
            provider: "fixture".into(),
            retry_after: Duration::from_millis(10),
        });
        let manager = manager_with(Arc::clone(&provider), priced());
        let session =
            manager.open_session("s", &caps(&["text"]), 1000, CancellationToken::new()).unwrap();

        let err = manager.dispatch(&session, "p", &SendParams::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(10)));
        assert_eq!(manager.summary(&session).unwrap().provider_calls, 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let provider =
            Arc::new(ScriptedProvider::new("fixture").with_latency(Duration::from_secs(10)));
        let config = priced().with_request_timeout(Duration::from_millis(20));
        let manager = manager_with(Arc::clone(&provider), config);
        let session =
            manager.open_session("s", &caps(&["text"]), 1000, CancellationToken::new()).unwrap();

        let err = manager.dispatch(&session, "slow", &SendParams::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_outstanding_call() {
        let provider =
            Arc::new(ScriptedProvider::new("fixture").with_latency(Duration::from_secs(10)));
        let manager = manager_with(Arc::clone(&provider), priced());
        let token = CancellationToken::new();
        let session = manager.open_session("s", &caps(&["text"]), 1000, token.clone()).unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = manager.dispatch(&session, "slow", &SendParams::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn test_open_session_requires_capabilities() {
        let manager = manager_with(Arc::new(ScriptedProvider::new("fixture")), priced());
        let err = manager
            .open_session("release", &caps(&["deploy"]), 1000, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::RequirementUnmet { .. }));
    }

    #[tokio::test]
    async fn test_disabled_cache_still_dispatches() {
        let provider = Arc::new(ScriptedProvider::new("fixture"));
        let mut registry = ProviderRegistry::new();
        registry.register(priced(), Arc::clone(&provider) as Arc<dyn Provider>).unwrap();
        let cache = Arc::new(PromptCache::new(CacheConfig { enabled: false, ..Default::default() }));
        let manager = AgentManager::new(registry, cache);

        let session =
            manager.open_session("s", &caps(&["text"]), 1000, CancellationToken::new()).unwrap();
        manager.dispatch(&session, "p", &SendParams::default()).await.unwrap();
        manager.dispatch(&session, "p", &SendParams::default()).await.unwrap();
        assert_eq!(provider.call_count(), 2);
    }
}
