//! Interception engine.
//!
//! One [`Engine`] is shared as `Arc<Engine>` by every adapter. For each
//! outgoing request it assigns a transaction id, consults the mock resolver,
//! registers the pending transaction and hands back a [`RoutingDecision`]
//! naming the URL to dial. `intercept` never blocks on I/O and never fails:
//! unusable mock rules degrade to pass-through.

mod decision;

pub use decision::{Route, RoutingDecision};

use crate::config::{NetscopeConfig, RecorderConfig};
use crate::error::{MockResolutionError, RuleSetError};
use crate::metrics;
use crate::mock_endpoint::MockEndpoint;
use crate::model::{MockApplied, MockKind, Request, Transaction, TransactionId};
use crate::recorder::Recorder;
use crate::resolver::{MockResolver, MockRule, MockTarget};
use anyhow::Context;
use decision::Finalizer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Per-call options supplied by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptOption {
    /// Adapter name, recorded on the transaction
    pub name: String,
}

impl InterceptOption {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

struct Routed {
    route: Route,
    url: Url,
    mock: Option<MockApplied>,
    staged_on: Option<Arc<MockEndpoint>>,
}

impl Routed {
    fn pass_through(request: &Request) -> Self {
        Self {
            route: Route::PassThrough,
            url: request.url().clone(),
            mock: None,
            staged_on: None,
        }
    }
}

pub struct Engine {
    enabled: AtomicBool,
    next_id: AtomicU64,
    resolver: Arc<MockResolver>,
    recorder: Arc<Recorder>,
    endpoint: Option<Arc<MockEndpoint>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Build an engine from configuration, starting the mock endpoint when
    /// it is enabled. Must be called inside a tokio runtime.
    pub async fn from_config(config: &NetscopeConfig) -> anyhow::Result<Arc<Self>> {
        let rules = config
            .rules
            .iter()
            .map(|rule| rule.to_rule())
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut builder = Engine::builder()
            .enabled(config.enabled)
            .recorder_config(config.recorder.clone())
            .rules(rules);

        if config.mock_endpoint.enabled {
            let endpoint =
                MockEndpoint::start(&config.mock_endpoint.host, config.mock_endpoint.port)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to start mock endpoint on {}:{}",
                            config.mock_endpoint.host, config.mock_endpoint.port
                        )
                    })?;
            builder = builder.endpoint(endpoint);
        }

        let engine = builder.build().context("Invalid mock rules")?;
        info!(
            "Interception engine ready: {} mock rules, recorder capacity {}",
            engine.resolver.len(),
            engine.recorder.capacity()
        );
        Ok(engine)
    }

    /// Route one outgoing request.
    pub fn intercept(&self, request: Request, option: InterceptOption) -> RoutingDecision {
        let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        if !self.is_enabled() {
            metrics::record_intercepted(&option.name, "disabled");
            return RoutingDecision::detached(id, request.url().clone());
        }

        let routed = self.route(id, &request, &option.name);
        metrics::record_intercepted(&option.name, routed.route.as_str());
        debug!(
            "Transaction {} via {}: {} {} -> {} ({})",
            id,
            option.name,
            request.method(),
            request.url(),
            routed.url,
            routed.route.as_str()
        );

        self.recorder.begin(Transaction::pending(
            id,
            option.name.clone(),
            request.clone(),
            routed.mock.clone(),
        ));

        RoutingDecision::armed(
            id,
            routed.url,
            routed.route,
            Finalizer {
                adapter: option.name,
                request,
                mock: routed.mock,
                recorder: Arc::clone(&self.recorder),
                staged_on: routed.staged_on,
            },
        )
    }

    fn route(&self, id: TransactionId, request: &Request, adapter: &str) -> Routed {
        let resolution = match self.resolver.resolve(request) {
            Ok(Some(resolution)) => resolution,
            Ok(None) => return Routed::pass_through(request),
            Err(e) => {
                warn!("Mock resolution failed, passing through: {}", e);
                metrics::record_mock_resolution_error(adapter);
                return Routed::pass_through(request);
            }
        };
        let rule_id = resolution.rule.id.clone();

        match resolution.target {
            MockTarget::Redirect(url) => Routed {
                route: Route::Redirect {
                    rule_id: rule_id.clone(),
                },
                mock: Some(MockApplied {
                    rule_id,
                    kind: MockKind::Redirect,
                    dialed_url: url.clone(),
                }),
                url,
                staged_on: None,
            },
            MockTarget::Literal(response) => {
                let Some(endpoint) = &self.endpoint else {
                    let e = MockResolutionError::NoMockEndpoint { rule_id };
                    warn!("Mock resolution failed, passing through: {}", e);
                    metrics::record_mock_resolution_error(adapter);
                    return Routed::pass_through(request);
                };
                let url = endpoint.stage(id, response);
                Routed {
                    route: Route::Literal {
                        rule_id: rule_id.clone(),
                    },
                    mock: Some(MockApplied {
                        rule_id,
                        kind: MockKind::Literal,
                        dialed_url: url.clone(),
                    }),
                    url,
                    staged_on: Some(Arc::clone(endpoint)),
                }
            }
        }
    }

    /// Evict transactions pending for longer than `grace` and release any
    /// mock responses staged for them.
    pub fn reap_stale(&self, grace: Duration) -> usize {
        let reaped = self.recorder.reap_pending(grace);
        if let Some(endpoint) = &self.endpoint {
            for id in &reaped {
                endpoint.release(*id);
            }
        }
        reaped.len()
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval`. The task ends
    /// once the engine is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, grace: Duration) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Engine dropped, reaper exiting");
                    break;
                };
                engine.reap_stale(grace);
            }
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(
            "Interception {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn resolver(&self) -> &Arc<MockResolver> {
        &self.resolver
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn endpoint(&self) -> Option<&Arc<MockEndpoint>> {
        self.endpoint.as_ref()
    }
}

/// Wires resolver, recorder and mock endpoint into an [`Engine`].
pub struct EngineBuilder {
    enabled: bool,
    resolver: Option<Arc<MockResolver>>,
    recorder: Option<Arc<Recorder>>,
    recorder_config: RecorderConfig,
    endpoint: Option<Arc<MockEndpoint>>,
    rules: Vec<MockRule>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            resolver: None,
            recorder: None,
            recorder_config: RecorderConfig::default(),
            endpoint: None,
            rules: Vec::new(),
        }
    }
}

impl EngineBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Share an existing resolver.
    pub fn resolver(mut self, resolver: Arc<MockResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Share an existing recorder. Takes precedence over `recorder_config`.
    pub fn recorder(mut self, recorder: Arc<Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn recorder_config(mut self, config: RecorderConfig) -> Self {
        self.recorder_config = config;
        self
    }

    pub fn endpoint(mut self, endpoint: Arc<MockEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Rules to install when building. Replaces the resolver's rule set if
    /// non-empty.
    pub fn rules(mut self, rules: Vec<MockRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, RuleSetError> {
        let resolver = self.resolver.unwrap_or_default();
        if !self.rules.is_empty() {
            resolver.replace_rules(self.rules)?;
        }
        let recorder = self
            .recorder
            .unwrap_or_else(|| Arc::new(Recorder::new(&self.recorder_config)));

        Ok(Arc::new(Engine {
            enabled: AtomicBool::new(self.enabled),
            next_id: AtomicU64::new(0),
            resolver,
            recorder,
            endpoint: self.endpoint,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Method, Response};
    use crate::resolver::{MockResponse, RuleMatcher};
    use tracing_test::traced_test;

    fn get(url: &str) -> Request {
        Request::parse("GET", url, "test").unwrap()
    }

    fn option() -> InterceptOption {
        InterceptOption::new("test")
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let engine = Engine::builder().build().unwrap();
        let a = engine.intercept(get("http://h/a"), option());
        let b = engine.intercept(get("http://h/b"), option());
        assert!(b.id() > a.id());
        assert_eq!(engine.recorder().pending().len(), 2);
    }

    #[test]
    fn test_pass_through_keeps_url() {
        let engine = Engine::builder().build().unwrap();
        let decision = engine.intercept(get("http://h/v1/ping?x=1"), option());
        assert_eq!(decision.actual_or_mock_request_url().as_str(), "http://h/v1/ping?x=1");
        assert_eq!(decision.route(), &Route::PassThrough);

        decision.on_response(Response::new(200)).unwrap();
        let recorded = engine.recorder().snapshot();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].adapter, "test");
        assert!(recorded[0].mock.is_none());
        assert_eq!(recorded[0].dialed_url().as_str(), "http://h/v1/ping?x=1");
    }

    #[test]
    fn test_redirect_route() {
        let engine = Engine::builder()
            .rules(vec![MockRule::redirect(
                "user-42",
                RuleMatcher::exact("/users/42").method(Method::Get),
                "http://mock.local/users/42",
            )])
            .build()
            .unwrap();

        let mocked = engine.intercept(get("https://api/users/42"), option());
        assert_eq!(
            mocked.route(),
            &Route::Redirect {
                rule_id: "user-42".to_string()
            }
        );
        assert_eq!(
            mocked.actual_or_mock_request_url().as_str(),
            "http://mock.local/users/42"
        );

        let other = engine.intercept(get("https://api/users/43"), option());
        assert!(!other.is_mocked());
        let post = engine.intercept(
            Request::parse("POST", "https://api/users/42", "test").unwrap(),
            option(),
        );
        assert!(!post.is_mocked());

        let pending = engine.recorder().get(mocked.id()).unwrap();
        assert_eq!(
            pending.mock.as_ref().map(|m| m.rule_id.as_str()),
            Some("user-42")
        );
    }

    #[traced_test]
    #[test]
    fn test_literal_without_endpoint_passes_through() {
        let engine = Engine::builder()
            .rules(vec![MockRule::respond(
                "literal",
                RuleMatcher::any(),
                MockResponse::new(200),
            )])
            .build()
            .unwrap();

        let decision = engine.intercept(get("http://h/x"), option());
        assert!(!decision.is_mocked());
        assert_eq!(decision.actual_or_mock_request_url().as_str(), "http://h/x");
        assert!(logs_contain("no mock endpoint is running"));
    }

    #[test]
    fn test_disabled_engine_records_nothing() {
        let engine = Engine::builder().enabled(false).build().unwrap();
        let decision = engine.intercept(get("http://h/x"), option());
        decision.on_response(Response::new(200)).unwrap();
        assert!(engine.recorder().is_empty());
        assert!(engine.recorder().pending().is_empty());

        engine.set_enabled(true);
        let decision = engine.intercept(get("http://h/x"), option());
        decision.on_response(Response::new(200)).unwrap();
        assert_eq!(engine.recorder().len(), 1);
    }

    #[tokio::test]
    async fn test_literal_staged_and_released() {
        let endpoint = MockEndpoint::start("127.0.0.1", 0).await.unwrap();
        let engine = Engine::builder()
            .endpoint(Arc::clone(&endpoint))
            .rules(vec![MockRule::respond(
                "teapot",
                RuleMatcher::prefix("/tea"),
                MockResponse::new(418),
            )])
            .build()
            .unwrap();

        let decision = engine.intercept(get("https://api/tea/pot"), option());
        let url = decision.actual_or_mock_request_url();
        assert_eq!(url.port(), Some(endpoint.addr().port()));
        assert_eq!(url.path(), format!("/__netscope/mock/{}", decision.id()));
        assert!(endpoint.is_staged(decision.id()));

        decision.on_response(Response::new(418)).unwrap();
        assert!(!endpoint.is_staged(decision.id()));
        let recorded = engine.recorder().get(decision.id()).unwrap();
        assert_eq!(recorded.mock.as_ref().map(|m| m.kind), Some(MockKind::Literal));
    }

    #[tokio::test]
    async fn test_reap_stale_releases_staged() {
        let endpoint = MockEndpoint::start("127.0.0.1", 0).await.unwrap();
        let engine = Engine::builder()
            .endpoint(Arc::clone(&endpoint))
            .rules(vec![MockRule::respond(
                "any",
                RuleMatcher::any(),
                MockResponse::new(200),
            )])
            .build()
            .unwrap();

        // A call still stuck in flight
        let decision = engine.intercept(get("http://h/stuck"), option());
        let id = decision.id();
        assert!(endpoint.is_staged(id));

        assert_eq!(engine.reap_stale(Duration::ZERO), 1);
        assert!(!endpoint.is_staged(id));
        assert!(engine.recorder().get(id).is_none());
    }

    #[tokio::test]
    async fn test_dropped_decisions_release_staged_after_overflow() {
        let endpoint = MockEndpoint::start("127.0.0.1", 0).await.unwrap();
        let engine = Engine::builder()
            .endpoint(Arc::clone(&endpoint))
            .recorder_config(RecorderConfig {
                pending_capacity: 1,
                ..RecorderConfig::default()
            })
            .rules(vec![MockRule::respond(
                "any",
                RuleMatcher::any(),
                MockResponse::new(200),
            )])
            .build()
            .unwrap();

        let decisions: Vec<_> = (0..3)
            .map(|i| engine.intercept(get(&format!("http://h/abandoned/{i}")), option()))
            .collect();
        assert_eq!(endpoint.staged_count(), 3);
        // Only the newest is still tracked as pending
        assert_eq!(engine.recorder().pending().len(), 1);

        drop(decisions);
        assert_eq!(endpoint.staged_count(), 0);

        assert_eq!(engine.reap_stale(Duration::ZERO), 1);
        assert!(engine.recorder().pending().is_empty());
        assert_eq!(endpoint.staged_count(), 0);
    }
}
