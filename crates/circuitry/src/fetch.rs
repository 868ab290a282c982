//! Resilient fetch over single-use circuits.
//!
//! Per call:
//! - Lease a circuit with `Pool::take` (never when already cancelled)
//! - Race one request against a fresh per-attempt timeout
//! - 2xx → body; other status → application error; both discard the circuit
//! - Transport error or timeout → evict, back off `base * 2^attempt`, retry
//! - Cancellation at any await → `Aborted`, no further attempts

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::pool::{Pool, PoolError, ResourceFactory};
use crate::transport::{Circuit, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl FetchConfig {
    /// Delay after failed attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("No circuit available: {0}")]
    Pool(#[source] PoolError),
    #[error("Remote responded with status {status}")]
    Application { status: u16, body: String },
    #[error("Gave up after {attempts} attempts: {last_error}")]
    TooManyRetries {
        attempts: u32,
        last_error: TransportError,
    },
    #[error("Fetch aborted")]
    Aborted,
    #[error("Invalid fetch key: {0}")]
    InvalidKey(String),
}

impl From<PoolError> for FetchError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Cancelled => FetchError::Aborted,
            other => FetchError::Pool(other),
        }
    }
}

/// Fetch engine over a pool of circuits.
pub struct Fetcher<F>
where
    F: ResourceFactory,
    F::Resource: Circuit,
{
    pool: Pool<F>,
    config: FetchConfig,
    replenish: bool,
}

impl<F> Fetcher<F>
where
    F: ResourceFactory,
    F::Resource: Circuit,
{
    pub fn new(pool: Pool<F>, config: FetchConfig) -> Self {
        Self {
            pool,
            config,
            replenish: false,
        }
    }

    /// Start rebuilding each vacated slot as soon as its circuit is leased.
    pub fn with_replenish(mut self, replenish: bool) -> Self {
        self.replenish = replenish;
        self
    }

    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `url`, returning the body of a 2xx response.
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError> {
        let mut last_error = TransportError::Cancelled;

        for attempt in 0..self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Aborted);
            }

            let lease = self.pool.take(cancel).await?;
            if self.replenish {
                self.pool.replenish(lease.index());
            }
            tracing::debug!(url = %url, slot = lease.index(), attempt, "Fetching");

            let timeout = self.config.attempt_timeout;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(url = %url, slot = lease.index(), "Fetch cancelled mid-request");
                    lease.discard();
                    return Err(FetchError::Aborted);
                }
                result = tokio::time::timeout(timeout, lease.request(url, timeout)) => {
                    result.unwrap_or(Err(TransportError::Timeout(timeout)))
                }
            };

            match outcome {
                Ok(response) if response.is_success() => {
                    lease.discard();
                    return Ok(response.body);
                }
                Ok(response) => {
                    // A valid HTTP error is not a circuit failure.
                    tracing::debug!(url = %url, status = response.status, "Remote returned error status");
                    lease.discard();
                    return Err(FetchError::Application {
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(e) => {
                    lease.evict(&e);
                    if cancel.is_cancelled() {
                        return Err(FetchError::Aborted);
                    }
                    last_error = e;
                }
            }

            if attempt + 1 >= self.config.max_attempts {
                break;
            }

            let backoff = self.config.backoff(attempt);
            tracing::warn!(
                url = %url,
                error = %last_error,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis(),
                "Fetch attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        tracing::error!(
            url = %url,
            error = %last_error,
            attempts = self.config.max_attempts,
            "Fetch failed after max attempts"
        );
        Err(FetchError::TooManyRetries {
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::pool::FactoryError;
    use crate::transport::Response;

    /// What a scripted circuit does when asked to carry a request.
    #[derive(Clone)]
    pub(crate) enum Script {
        Respond(u16, &'static str),
        Fail,
        Hang,
    }

    #[derive(Default)]
    pub(crate) struct Stage {
        pub script: Mutex<VecDeque<Script>>,
        pub created: AtomicUsize,
        pub destroyed: AtomicUsize,
        pub requests: Mutex<Vec<Instant>>,
    }

    impl Stage {
        pub fn scripted(steps: impl IntoIterator<Item = Script>) -> Arc<Self> {
            let stage = Self::default();
            stage.script.lock().unwrap().extend(steps);
            Arc::new(stage)
        }

        pub fn requests(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn gaps(&self) -> Vec<Duration> {
            let times = self.requests.lock().unwrap();
            times.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    pub(crate) struct ScriptedCircuit {
        stage: Arc<Stage>,
        destroyed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Circuit for ScriptedCircuit {
        async fn request(&self, _url: &str, _timeout: Duration) -> Result<Response, TransportError> {
            self.stage.requests.lock().unwrap().push(Instant::now());
            let step = self
                .stage
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Fail);
            match step {
                Script::Respond(status, body) => Ok(Response::new(status, body)),
                Script::Fail => Err(TransportError::Request("connection reset".to_string())),
                Script::Hang => std::future::pending().await,
            }
        }

        fn destroy(&self) -> Result<(), TransportError> {
            if !self.destroyed.swap(true, Ordering::SeqCst) {
                self.stage.destroyed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    pub(crate) struct ScriptedFactory {
        pub stage: Arc<Stage>,
    }

    #[async_trait]
    impl ResourceFactory for ScriptedFactory {
        type Resource = ScriptedCircuit;

        async fn create(
            &self,
            _index: usize,
            _cancel: CancellationToken,
        ) -> Result<ScriptedCircuit, FactoryError> {
            self.stage.created.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedCircuit {
                stage: Arc::clone(&self.stage),
                destroyed: Default::default(),
            })
        }

        fn destroy(&self, circuit: &ScriptedCircuit) -> Result<(), FactoryError> {
            Ok(circuit.destroy()?)
        }
    }

    fn config(max_attempts: u32) -> FetchConfig {
        FetchConfig {
            max_attempts,
            attempt_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
        }
    }

    pub(crate) fn fetcher(
        stage: &Arc<Stage>,
        capacity: usize,
        max_attempts: u32,
    ) -> Fetcher<ScriptedFactory> {
        let pool = Pool::new(
            "circuits",
            capacity,
            ScriptedFactory {
                stage: Arc::clone(stage),
            },
        );
        Fetcher::new(pool, config(max_attempts))
    }

    #[test]
    fn config_defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff_base, Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_exactly() {
        let config = FetchConfig {
            backoff_base: Duration::from_millis(250),
            ..Default::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(250));
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(5), Duration::from_secs(8));
        // Saturates rather than overflowing.
        assert!(config.backoff(40) >= config.backoff(31));
    }

    #[tokio::test]
    async fn success_returns_body_and_discards_circuit() {
        let stage = Stage::scripted([Script::Respond(200, "hello")]);
        let fetcher = fetcher(&stage, 2, 3);

        let body = fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, "hello");
        assert_eq!(stage.requests(), 1);
        assert_eq!(stage.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.pool().size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn application_error_is_not_retried() {
        let stage = Stage::scripted([Script::Respond(404, "missing")]);
        let fetcher = fetcher(&stage, 1, 3);
        let started = Instant::now();

        let err = fetcher
            .fetch("http://example.onion/nope", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::Application {
                status: 404,
                body: "missing".to_string()
            }
        );
        assert_eq!(stage.requests(), 1);
        assert_eq!(stage.destroyed.load(Ordering::SeqCst), 1);
        // No backoff sleep happened.
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    /// Counts `WARN` events seen while installed as the thread's default subscriber.
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl WarnCounter {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            use tracing_subscriber::layer::SubscriberExt;
            tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn application_error_logs_no_warning() {
        let warnings = WarnCounter::default();
        let _guard = warnings.install();

        let stage = Stage::scripted([Script::Respond(404, "missing")]);
        let fetcher = fetcher(&stage, 1, 3);
        let err = fetcher
            .fetch("http://example.onion/nope", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Application { status: 404, .. }));
        assert_eq!(warnings.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_logs_warning() {
        let warnings = WarnCounter::default();
        let _guard = warnings.install();

        let stage = Stage::scripted([Script::Fail, Script::Respond(200, "ok")]);
        let fetcher = fetcher(&stage, 1, 2);
        let body = fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, "ok");
        assert!(warnings.count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_exhausts_attempts_with_exact_backoff() {
        for attempts in 1..=4u32 {
            let stage = Stage::scripted([]);
            let fetcher = fetcher(&stage, 2, attempts);
            let started = Instant::now();

            let err = fetcher
                .fetch("http://example.onion/", &CancellationToken::new())
                .await
                .unwrap_err();

            assert_eq!(
                err,
                FetchError::TooManyRetries {
                    attempts,
                    last_error: TransportError::Request("connection reset".to_string()),
                }
            );
            assert_eq!(stage.requests(), attempts as usize);
            assert_eq!(stage.destroyed.load(Ordering::SeqCst), attempts as usize);

            let expected: Vec<Duration> = (0..attempts - 1)
                .map(|i| Duration::from_secs(1 << i))
                .collect();
            assert_eq!(stage.gaps(), expected);
            assert_eq!(started.elapsed(), expected.iter().sum::<Duration>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transport_failures() {
        let stage = Stage::scripted([Script::Fail, Script::Fail, Script::Respond(200, "third time")]);
        let fetcher = fetcher(&stage, 3, 3);

        let body = fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, "third time");
        assert_eq!(stage.requests(), 3);
        assert_eq!(stage.created.load(Ordering::SeqCst), 3);
        assert_eq!(stage.destroyed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_retryable() {
        let stage = Stage::scripted([Script::Hang, Script::Respond(200, "late")]);
        let fetcher = fetcher(&stage, 1, 2);
        let started = Instant::now();

        let body = fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, "late");
        // 5s attempt timeout plus a 1s backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(stage.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhaustion_reports_timeout() {
        let stage = Stage::scripted([Script::Hang]);
        let fetcher = fetcher(&stage, 1, 1);

        let err = fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::TooManyRetries {
                attempts: 1,
                last_error: TransportError::Timeout(Duration::from_secs(5)),
            }
        );
    }

    #[tokio::test]
    async fn cancelled_before_leasing_touches_nothing() {
        let stage = Stage::scripted([Script::Respond(200, "unused")]);
        let fetcher = fetcher(&stage, 2, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher.fetch("http://example.onion/", &cancel).await.unwrap_err();

        assert_eq!(err, FetchError::Aborted);
        assert_eq!(stage.created.load(Ordering::SeqCst), 0);
        assert_eq!(stage.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_mid_request_does_not_retry() {
        let stage = Stage::scripted([Script::Hang, Script::Respond(200, "never")]);
        let fetcher = fetcher(&stage, 2, 3);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = fetcher.fetch("http://example.onion/", &cancel).await.unwrap_err();

        assert_eq!(err, FetchError::Aborted);
        assert_eq!(stage.requests(), 1);
        assert_eq!(stage.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_backoff_aborts() {
        let stage = Stage::scripted([Script::Fail, Script::Respond(200, "never")]);
        let fetcher = fetcher(&stage, 2, 3);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fetcher.fetch("http://example.onion/", &cancel).await.unwrap_err();

        assert_eq!(err, FetchError::Aborted);
        assert_eq!(stage.requests(), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn capacity_one_serves_concurrent_fetches() {
        let stage = Stage::scripted([Script::Respond(200, "a"), Script::Respond(200, "b")]);
        let fetcher = fetcher(&stage, 1, 1);
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            fetcher.fetch("http://example.onion/a", &cancel),
            fetcher.fetch("http://example.onion/b", &cancel)
        );

        let mut bodies = vec![a.unwrap(), b.unwrap()];
        bodies.sort();
        assert_eq!(bodies, vec!["a", "b"]);
        assert_eq!(stage.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replenish_rebuilds_vacated_slot() {
        let stage = Stage::scripted([Script::Respond(200, "ok")]);
        let fetcher = fetcher(&stage, 1, 1).with_replenish(true);
        let mut status = fetcher.pool().watch_status();

        fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap();

        status.wait_for(|s| s.is_full()).await.unwrap();
        assert_eq!(fetcher.pool().size(), 1);
        assert_eq!(stage.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pool_failure_surfaces_untouched() {
        let pool = Pool::new(
            "circuits",
            1,
            crate::pool::factory_fn(|_, _| async {
                Err::<ScriptedCircuit, _>(FactoryError::Transient("no relays".to_string()))
            }),
        );
        let fetcher = Fetcher::new(pool, config(3));

        let err = fetcher
            .fetch("http://example.onion/", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::Pool(PoolError::Exhausted {
                index: 0,
                cause: "no relays".to_string()
            })
        );
    }
}
