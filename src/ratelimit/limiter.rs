//! Per-request orchestration of the rate limiter.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, instrument, warn};

use crate::config::RateLimitingConfig;
use crate::error::Result;

use super::decision::{decide, Decision, HeaderSet, BLOCKED_BODY, TOO_MANY_REQUESTS};
use super::host::{RequestContext, ResponseControl};
use super::identifier::resolve;
use super::store::{CounterClient, CounterStore, IncrementOutcome};
use super::usage::{evaluate, Evaluation};
use super::window::{Clock, Period, SystemClock, WindowAnchors};

/// What the hosting pipeline should do after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep processing the request.
    Continue,
    /// Stop; an early response has been sent.
    Pause,
}

/// Lifecycle of one request through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Nothing has run yet.
    Start,
    /// The caller's identifier and scope are known.
    IdentifierResolved,
    /// Usage has been read, possibly partially.
    Evaluated,
    /// The admission decision has been made.
    Decided,
    /// A 429 was sent and the pipeline stopped.
    Blocked,
    /// The request was released to the pipeline.
    Allowed,
    /// Counters were incremented after release.
    Incremented,
    /// Usage could not be read and the request was rejected.
    Failed,
}

/// Rate limiter shared by every request of one configuration load.
///
/// This struct is thread-safe; wrap it in an `Arc` to share it across tasks.
pub struct RateLimiter {
    config: Arc<RateLimitingConfig>,
    counters: CounterClient,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(config: RateLimitingConfig, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(
        config: RateLimitingConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            counters: CounterClient::new(store),
            clock,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &RateLimitingConfig {
        &self.config
    }

    /// Start handling a new request.
    pub fn context(&self) -> RateLimitingContext<'_> {
        RateLimitingContext {
            limiter: self,
            headers: None,
            state: RequestState::Start,
        }
    }
}

/// State kept for a single request between its request and response phases.
pub struct RateLimitingContext<'a> {
    limiter: &'a RateLimiter,
    headers: Option<HeaderSet>,
    state: RequestState,
}

impl<'a> RateLimitingContext<'a> {
    /// Where this request is in its lifecycle.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Headers waiting to be attached to the response.
    pub fn pending_headers(&self) -> Option<&HeaderSet> {
        self.headers.as_ref()
    }

    /// Evaluate the request when its headers arrive.
    ///
    /// Blocked requests get an early 429 and consume no quota. Allowed requests
    /// are released to the pipeline before every evaluated counter is
    /// incremented. Usage read failures are fatal unless the limiter is fault
    /// tolerant, in which case the request always goes through. Periods read
    /// before the failure still report headers and get incremented.
    #[instrument(skip_all)]
    pub async fn on_request_headers<H>(&mut self, host: &mut H) -> Result<Action>
    where
        H: RequestContext + ResponseControl,
    {
        let config = self.limiter.config.as_ref();
        let anchors = WindowAnchors::at(&self.limiter.clock.now());

        let identifier = resolve(
            config.limit_by,
            config.header_name.as_deref(),
            config.path.as_deref(),
            &*host,
        );
        let scope = host.scope();
        self.state = RequestState::IdentifierResolved;

        let counters = &self.limiter.counters;
        let evaluation = match evaluate(config, counters, &scope, &identifier, &anchors).await {
            Ok(evaluation) => evaluation,
            Err(e) if config.fault_tolerant => {
                error!(
                    identifier = %identifier,
                    error = %e,
                    "Failed to get usage, letting request through"
                );
                // Incomplete usage never blocks.
                let mut partial = e.partial;
                partial.blocking = None;
                partial
            }
            Err(e) => {
                error!(
                    identifier = %identifier,
                    error = %e,
                    "Failed to get usage, rejecting request"
                );
                self.state = RequestState::Failed;
                return Err(e.into());
            }
        };
        self.state = RequestState::Evaluated;

        let decision = decide(&evaluation, &anchors, config.hide_client_headers);
        self.state = RequestState::Decided;

        match decision {
            Decision::Block {
                period,
                retry_after,
                headers,
            } => {
                warn!(
                    identifier = %identifier,
                    period = %period,
                    retry_after,
                    "Rate limit exceeded"
                );
                host.send_early_response(TOO_MANY_REQUESTS, headers, BLOCKED_BODY);
                self.state = RequestState::Blocked;
                Ok(Action::Pause)
            }
            Decision::Allow { headers } => {
                debug!(identifier = %identifier, "Request allowed");
                self.headers = headers;
                host.continue_pipeline();
                self.state = RequestState::Allowed;

                let outcomes = self.increment(&evaluation).await;
                let dropped = outcomes.iter().filter(|(_, outcome)| !outcome.is_saved()).count();
                if dropped > 0 {
                    warn!(identifier = %identifier, dropped, "Some counters were not incremented");
                }
                self.state = RequestState::Incremented;
                Ok(Action::Continue)
            }
        }
    }

    /// Attach the headers computed at request time to the response.
    pub fn on_response_headers<H>(&mut self, host: &mut H) -> Action
    where
        H: ResponseControl + ?Sized,
    {
        if let Some(headers) = self.headers.take() {
            let mut merged = host.response_headers();
            merged.extend(headers);
            host.replace_response_headers(merged);
        }
        Action::Continue
    }

    /// Add one hit to every evaluated counter. Failures only get logged.
    async fn increment(&self, evaluation: &Evaluation) -> Vec<(Period, IncrementOutcome)> {
        let counters = &self.limiter.counters;
        let increments = evaluation.snapshots.iter().map(|snapshot| async move {
            let outcome = counters.increment(&snapshot.key, snapshot.counter).await;
            (snapshot.period, outcome)
        });
        join_all(increments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::decision::{RATELIMIT_REMAINING, RATELIMIT_RESET, RETRY_AFTER};
    use crate::ratelimit::host::Scope;
    use crate::ratelimit::identifier::Identifier;
    use crate::ratelimit::store::{CasToken, CounterKey, InMemoryCounterStore, StoreError};
    use crate::ratelimit::window::FixedClock;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockHost {
        request_headers: HashMap<String, String>,
        path: Option<String>,
        client: Option<String>,
        scope: Scope,
        early_response: Option<(u16, HeaderSet, Vec<u8>)>,
        continued: bool,
        response_headers: HeaderSet,
    }

    impl MockHost {
        fn from_ip(addr: &str) -> Self {
            Self {
                client: Some(addr.to_string()),
                scope: Scope::new("route-1", "service-1"),
                response_headers: vec![(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )],
                ..Default::default()
            }
        }

        fn response_header(&self, name: &str) -> Option<&str> {
            self.response_headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    impl RequestContext for MockHost {
        fn header(&self, name: &str) -> Option<String> {
            self.request_headers.get(name).cloned()
        }

        fn path(&self) -> Option<String> {
            self.path.clone()
        }

        fn client_address(&self) -> Option<String> {
            self.client.clone()
        }

        fn scope(&self) -> Scope {
            self.scope.clone()
        }
    }

    impl ResponseControl for MockHost {
        fn send_early_response(&mut self, status: u16, headers: HeaderSet, body: &[u8]) {
            self.early_response = Some((status, headers, body.to_vec()));
        }

        fn continue_pipeline(&mut self) {
            self.continued = true;
        }

        fn response_headers(&self) -> HeaderSet {
            self.response_headers.clone()
        }

        fn replace_response_headers(&mut self, headers: HeaderSet) {
            self.response_headers = headers;
        }
    }

    /// Store whose reads always fail.
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn get(
            &self,
            _key: &str,
        ) -> std::result::Result<Option<(u64, CasToken)>, StoreError> {
            Err(StoreError::Unavailable("shared memory unavailable".to_string()))
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _value: u64,
            _expected: CasToken,
        ) -> std::result::Result<CasToken, StoreError> {
            Err(StoreError::Unavailable("shared memory unavailable".to_string()))
        }
    }

    /// Store whose reads fail from the given read onwards.
    struct FlakyStore {
        inner: InMemoryCounterStore,
        reads: AtomicUsize,
        fail_from: usize,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn get(
            &self,
            key: &str,
        ) -> std::result::Result<Option<(u64, CasToken)>, StoreError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) >= self.fail_from {
                return Err(StoreError::Unavailable("shared memory unavailable".to_string()));
            }
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            value: u64,
            expected: CasToken,
        ) -> std::result::Result<CasToken, StoreError> {
            self.inner.compare_and_set(key, value, expected).await
        }
    }

    const NOW: &str = "2024-03-15T13:45:30Z";

    fn limiter(json: &str, store: Arc<dyn CounterStore>) -> RateLimiter {
        let config = RateLimitingConfig::from_json(json).unwrap();
        let clock = FixedClock(DateTime::parse_from_rfc3339(NOW).unwrap());
        RateLimiter::with_clock(config, store, Arc::new(clock))
    }

    /// Run one request through both phases.
    async fn run(limiter: &RateLimiter, host: &mut MockHost) -> Result<Action> {
        let mut ctx = limiter.context();
        let action = ctx.on_request_headers(host).await?;
        if action == Action::Continue {
            ctx.on_response_headers(host);
        }
        Ok(action)
    }

    fn total_usage(
        store: &InMemoryCounterStore,
        limiter: &RateLimiter,
        host: &MockHost,
        period: Period,
    ) -> Option<u64> {
        let anchors = WindowAnchors::at(&DateTime::parse_from_rfc3339(NOW).unwrap());
        let id = resolve(
            limiter.config().limit_by,
            limiter.config().header_name.as_deref(),
            limiter.config().path.as_deref(),
            host,
        );
        let key = CounterKey::new(&host.scope, &id, period, anchors.anchor(period));
        store.value(&key.to_store_key())
    }

    #[tokio::test]
    async fn test_minute_quota_scenario() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(r#"{"minute": 2, "hour": -1}"#, store.clone());

        let mut first = MockHost::from_ip("10.0.0.1");
        assert_eq!(run(&limiter, &mut first).await.unwrap(), Action::Continue);
        assert!(first.continued);
        assert_eq!(first.response_header(RATELIMIT_REMAINING), Some("1"));
        assert_eq!(first.response_header("X-RateLimit-Remaining-Minute"), Some("1"));
        assert_eq!(first.response_header("content-type"), Some("application/json"));

        let mut second = MockHost::from_ip("10.0.0.1");
        assert_eq!(run(&limiter, &mut second).await.unwrap(), Action::Continue);
        assert_eq!(second.response_header(RATELIMIT_REMAINING), Some("0"));

        let mut third = MockHost::from_ip("10.0.0.1");
        assert_eq!(run(&limiter, &mut third).await.unwrap(), Action::Pause);
        assert!(!third.continued);

        let (status, headers, body) = third.early_response.clone().unwrap();
        assert_eq!(status, 429);
        assert_eq!(body, BLOCKED_BODY);
        assert!(headers.contains(&(RETRY_AFTER.to_string(), "30".to_string())));
        assert!(headers.contains(&(RATELIMIT_RESET.to_string(), "30".to_string())));
        assert!(!headers.iter().any(|(k, _)| k.ends_with("-Hour")));

        // The blocked request did not consume quota.
        assert_eq!(total_usage(&store, &limiter, &third, Period::Minute), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_allowed_request_increments_every_period() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(
            r#"{"second": 100, "minute": 100, "day": 1000, "year": 5000}"#,
            store.clone(),
        );

        let mut host = MockHost::from_ip("10.0.0.1");
        let mut ctx = limiter.context();
        ctx.on_request_headers(&mut host).await.unwrap();
        assert_eq!(ctx.state(), RequestState::Incremented);

        for period in [Period::Second, Period::Minute, Period::Day, Period::Year] {
            assert_eq!(total_usage(&store, &limiter, &host, period), Some(1), "{period}");
        }
        assert_eq!(total_usage(&store, &limiter, &host, Period::Hour), None);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_block_in_one_period_increments_nothing() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(r#"{"minute": 1, "hour": 100}"#, store.clone());

        run(&limiter, &mut MockHost::from_ip("10.0.0.1")).await.unwrap();

        let mut host = MockHost::from_ip("10.0.0.1");
        let mut ctx = limiter.context();
        assert_eq!(ctx.on_request_headers(&mut host).await.unwrap(), Action::Pause);
        assert_eq!(ctx.state(), RequestState::Blocked);
        assert!(ctx.pending_headers().is_none());

        assert_eq!(total_usage(&store, &limiter, &host, Period::Minute), Some(1));
        assert_eq!(total_usage(&store, &limiter, &host, Period::Hour), Some(1));
    }

    #[tokio::test]
    async fn test_callers_are_limited_separately() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(r#"{"minute": 1}"#, store.clone());

        let mut first = MockHost::from_ip("10.0.0.1");
        let mut other = MockHost::from_ip("10.0.0.2");
        let mut again = MockHost::from_ip("10.0.0.1");
        assert_eq!(run(&limiter, &mut first).await.unwrap(), Action::Continue);
        assert_eq!(run(&limiter, &mut other).await.unwrap(), Action::Continue);
        assert_eq!(run(&limiter, &mut again).await.unwrap(), Action::Pause);
    }

    #[tokio::test]
    async fn test_header_identification() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(
            r#"{"minute": 1, "limit_by": "header", "header_name": "x-api-key"}"#,
            store.clone(),
        );

        let with_key = |addr: &str| {
            let mut host = MockHost::from_ip(addr);
            host.request_headers.insert("x-api-key".to_string(), "key-1".to_string());
            host
        };

        // Same key from two addresses shares one bucket.
        assert_eq!(run(&limiter, &mut with_key("10.0.0.1")).await.unwrap(), Action::Continue);
        assert_eq!(run(&limiter, &mut with_key("10.0.0.2")).await.unwrap(), Action::Pause);
    }

    #[tokio::test]
    async fn test_missing_address_shares_one_bucket() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(r#"{"minute": 1}"#, store.clone());

        assert_eq!(run(&limiter, &mut MockHost::default()).await.unwrap(), Action::Continue);
        assert_eq!(run(&limiter, &mut MockHost::default()).await.unwrap(), Action::Pause);
    }

    #[tokio::test]
    async fn test_hidden_headers_are_not_attached() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(r#"{"minute": 1, "hide_client_headers": true}"#, store.clone());

        let mut allowed = MockHost::from_ip("10.0.0.1");
        run(&limiter, &mut allowed).await.unwrap();
        assert_eq!(allowed.response_headers.len(), 1);

        let mut blocked = MockHost::from_ip("10.0.0.1");
        run(&limiter, &mut blocked).await.unwrap();
        let (_, headers, _) = blocked.early_response.unwrap();
        assert_eq!(headers, vec![(RETRY_AFTER.to_string(), "30".to_string())]);
    }

    #[tokio::test]
    async fn test_fault_tolerant_lets_request_through() {
        let limiter = limiter(r#"{"minute": 1, "fault_tolerant": true}"#, Arc::new(BrokenStore));

        let mut host = MockHost::from_ip("10.0.0.1");
        let mut ctx = limiter.context();
        assert_eq!(ctx.on_request_headers(&mut host).await.unwrap(), Action::Continue);
        assert!(host.continued);
        assert!(host.early_response.is_none());

        ctx.on_response_headers(&mut host);
        assert!(host.response_header(RATELIMIT_REMAINING).is_none());
    }

    #[tokio::test]
    async fn test_fault_tolerant_ignores_exhausted_partial_usage() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryCounterStore::new(),
            reads: AtomicUsize::new(0),
            fail_from: 1,
        });
        let limiter = limiter(
            r#"{"minute": 1, "hour": 10, "fault_tolerant": true}"#,
            store.clone(),
        );

        // Exhaust the minute window; the hour read will fail.
        let mut host = MockHost::from_ip("10.0.0.1");
        let anchors = WindowAnchors::at(&DateTime::parse_from_rfc3339(NOW).unwrap());
        let minute = CounterKey::new(
            &host.scope,
            &Identifier::new("10.0.0.1"),
            Period::Minute,
            anchors.anchor(Period::Minute),
        );
        store
            .inner
            .compare_and_set(&minute.to_store_key(), 1, CasToken::ABSENT)
            .await
            .unwrap();

        let mut ctx = limiter.context();
        assert_eq!(ctx.on_request_headers(&mut host).await.unwrap(), Action::Continue);
        assert_eq!(ctx.state(), RequestState::Incremented);
        assert!(host.continued);
        assert!(host.early_response.is_none());

        ctx.on_response_headers(&mut host);
        assert_eq!(host.response_header("X-RateLimit-Remaining-Minute"), Some("0"));
        assert!(host.response_header("X-RateLimit-Remaining-Hour").is_none());

        // Only the period read before the failure is incremented.
        assert_eq!(total_usage(&store.inner, &limiter, &host, Period::Minute), Some(2));
        assert_eq!(total_usage(&store.inner, &limiter, &host, Period::Hour), None);
    }

    #[tokio::test]
    async fn test_not_fault_tolerant_fails_request() {
        let limiter = limiter(r#"{"minute": 1, "fault_tolerant": false}"#, Arc::new(BrokenStore));

        let mut host = MockHost::from_ip("10.0.0.1");
        let mut ctx = limiter.context();
        let err = ctx.on_request_headers(&mut host).await.unwrap_err();

        assert!(matches!(err, TollgateError::Usage(ref e) if e.period == Period::Minute));
        assert_eq!(ctx.state(), RequestState::Failed);
        assert!(!host.continued);
        assert!(host.early_response.is_none());
    }

    #[tokio::test]
    async fn test_response_phase_without_pending_headers_is_noop() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = limiter(r#"{"minute": 1}"#, store);

        let mut host = MockHost::from_ip("10.0.0.1");
        let mut ctx = limiter.context();
        assert_eq!(ctx.on_response_headers(&mut host), Action::Continue);
        assert_eq!(host.response_headers.len(), 1);
    }
}
