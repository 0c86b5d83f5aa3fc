//! Bounded fan-out of outbound fetches for a single inbound request.
//!
//! [`FetchEngine::run`] fetches every address of a request with at most
//! `max_concurrency` fetches in flight. The first failed (or empty) fetch
//! cancels the whole batch: tasks still waiting on I/O are abandoned and
//! addresses that have not started yet are never fetched. Bodies that were
//! stored before the cancellation are returned to the caller.
//!
//! Every task checks the shared [`CancellationToken`] before it starts I/O
//! and again, under the result lock, before it stores a body. The engine
//! joins every task before returning, so nothing can write to the result
//! after `run` has handed it back.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup::create_fetch_span,
};

/// Errors surfaced by [`FetchEngine::run`] itself.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// The join step did not finish within the outer deadline. Whatever had
    /// been collected is carried along.
    #[error("fetch batch did not complete within {timeout:?}")]
    BatchTimeout {
        timeout: Duration,
        partial: FetchResult,
    },
}

/// How a batch ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BatchOutcome {
    /// Every address was fetched.
    #[default]
    Complete,
    /// A fetch failed and the rest of the batch was cancelled.
    Aborted { failed_url: String },
    /// The request deadline elapsed before the batch finished.
    DeadlineExceeded,
}

/// Bodies keyed by the address they were fetched from.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    data: HashMap<String, String>,
    outcome: BatchOutcome,
}

impl FetchResult {
    pub fn get(&self, url: &str) -> Option<&str> {
        self.data.get(url).map(String::as_str)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.data.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn outcome(&self) -> &BatchOutcome {
        &self.outcome
    }

    pub fn into_data(self) -> HashMap<String, String> {
        self.data
    }
}

/// Limits applied to every batch.
#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub max_concurrency: usize,
    pub fetch_timeout: Duration,
    pub join_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            fetch_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// What a single fetch task did.
#[derive(Debug)]
enum TaskOutcome {
    Stored,
    Failed { url: String, error: HttpClientError },
    Cancelled,
}

/// Runs the per-request fan-out.
pub struct FetchEngine {
    http_client: Arc<dyn HttpClient>,
    limits: FetchLimits,
}

impl FetchEngine {
    pub fn new(http_client: Arc<dyn HttpClient>, limits: FetchLimits) -> Self {
        Self {
            http_client,
            limits,
        }
    }

    /// Fetch every address in `urls`, giving the whole batch `deadline`.
    ///
    /// Never fails because of an individual fetch. A failed fetch or an
    /// expired deadline yields a partial result; only a join that overruns
    /// the outer `join_timeout` returns [`FetchError::BatchTimeout`].
    pub async fn run(&self, urls: &[String], deadline: Duration) -> Result<FetchResult, FetchError> {
        if urls.is_empty() {
            return Ok(FetchResult::default());
        }

        let token = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.limits.max_concurrency));
        let results: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();

        let expiry = sleep(deadline);
        tokio::pin!(expiry);
        let mut deadline_hit = false;

        tracing::debug!(
            urls = urls.len(),
            max_concurrency = self.limits.max_concurrency,
            deadline = ?deadline,
            "Starting fetch batch"
        );

        for url in urls {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = &mut expiry => {
                    deadline_hit = true;
                    token.cancel();
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = FetchTask {
                url: url.clone(),
                http_client: self.http_client.clone(),
                token: token.clone(),
                results: results.clone(),
                fetch_timeout: self.limits.fetch_timeout,
                max_body_bytes: self.limits.max_body_bytes,
            };
            let span = create_fetch_span(url);

            tasks.spawn(
                async move {
                    let _permit = permit;
                    task.run().await
                }
                .instrument(span),
            );
        }

        let mut failed_url = None;
        let join = async {
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        None => break,
                        Some(Ok(TaskOutcome::Failed { url, error })) => {
                            tracing::warn!(url = %url, error = %error, "Fetch failed, batch cancelled");
                            failed_url.get_or_insert(url);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!("Fetch task did not complete: {}", e);
                            token.cancel();
                        }
                    },
                    _ = &mut expiry, if !token.is_cancelled() => {
                        tracing::warn!(deadline = ?deadline, "Request deadline exceeded, cancelling batch");
                        deadline_hit = true;
                        token.cancel();
                    }
                }
            }
        };

        let joined = timeout(self.limits.join_timeout, join).await;

        // After this point no task can store a body, so the snapshot is final.
        token.cancel();
        tasks.abort_all();
        let data = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));

        let outcome = match failed_url {
            Some(failed_url) => BatchOutcome::Aborted { failed_url },
            None if deadline_hit => BatchOutcome::DeadlineExceeded,
            None => BatchOutcome::Complete,
        };
        let result = FetchResult { data, outcome };

        if joined.is_err() {
            tracing::error!(
                timeout = ?self.limits.join_timeout,
                collected = result.len(),
                "Fetch batch join timed out"
            );
            return Err(FetchError::BatchTimeout {
                timeout: self.limits.join_timeout,
                partial: result,
            });
        }

        tracing::debug!(
            requested = urls.len(),
            collected = result.len(),
            outcome = ?result.outcome,
            "Fetch batch finished"
        );

        Ok(result)
    }
}

/// One outbound attempt for one address.
struct FetchTask {
    url: String,
    http_client: Arc<dyn HttpClient>,
    token: CancellationToken,
    results: Arc<Mutex<HashMap<String, String>>>,
    fetch_timeout: Duration,
    max_body_bytes: usize,
}

impl FetchTask {
    async fn run(self) -> TaskOutcome {
        if self.token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        let fetched = tokio::select! {
            biased;
            _ = self.token.cancelled() => return TaskOutcome::Cancelled,
            fetched = timeout(
                self.fetch_timeout,
                self.http_client.get_text(&self.url, self.max_body_bytes),
            ) => fetched,
        };

        let body = match fetched {
            Ok(Ok(body)) if !body.is_empty() => body,
            Ok(Ok(_)) => {
                let error = HttpClientError::Body {
                    url: self.url.clone(),
                    reason: "empty body".to_string(),
                };
                return self.fail(error);
            }
            Ok(Err(error)) => return self.fail(error),
            Err(_) => {
                let millis = u64::try_from(self.fetch_timeout.as_millis()).unwrap_or(u64::MAX);
                return self.fail(HttpClientError::Timeout(millis));
            }
        };

        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        if self.token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }
        results.insert(self.url, body);
        TaskOutcome::Stored
    }

    fn fail(self, error: HttpClientError) -> TaskOutcome {
        // A task that lost the race to an earlier failure is just cancelled.
        if self.token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }
        self.token.cancel();
        TaskOutcome::Failed {
            url: self.url,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use hyper::{Request, Response};

    use super::*;
    use crate::ports::http_client::HttpClientResult;

    /// Scripted upstream behaviour for one address.
    #[derive(Clone)]
    enum Script {
        Body(&'static str, Duration),
        Fail(Duration),
    }

    #[derive(Default)]
    struct ScriptedClient {
        scripts: HashMap<String, Script>,
        fallback: Option<Script>,
        started: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedClient {
        fn with(mut self, url: &str, script: Script) -> Self {
            self.scripts.insert(url.to_string(), script);
            self
        }

        fn otherwise(mut self, script: Script) -> Self {
            self.fallback = Some(script);
            self
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send_request(&self, _req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::InvalidRequest("not scripted".to_string()))
        }

        async fn get_text(&self, url: &str, _max_body_bytes: usize) -> HttpClientResult<String> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let script = self
                .scripts
                .get(url)
                .cloned()
                .or_else(|| self.fallback.clone())
                .expect("unscripted url");

            match script {
                Script::Body(body, delay) => {
                    sleep(delay).await;
                    Ok(body.to_string())
                }
                Script::Fail(delay) => {
                    sleep(delay).await;
                    Err(HttpClientError::ConnectionError(format!("{url} refused")))
                }
            }
        }
    }

    fn engine(client: Arc<ScriptedClient>) -> FetchEngine {
        FetchEngine::new(client, FetchLimits::default())
    }

    fn urls(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_empty_input_spawns_nothing() {
        let client = Arc::new(ScriptedClient::default());
        let result = engine(client.clone()).run(&[], LONG).await.unwrap();

        assert!(result.is_empty());
        assert_eq!(result.outcome(), &BatchOutcome::Complete);
        assert_eq!(client.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let client = Arc::new(
            ScriptedClient::default()
                .with("http://ok1", Script::Body("r1", Duration::from_millis(10)))
                .with("http://ok2", Script::Body("r2", Duration::from_millis(20))),
        );
        let result = engine(client)
            .run(&urls(&["http://ok1", "http://ok2"]), LONG)
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.get("http://ok1"), Some("r1"));
        assert_eq!(result.get("http://ok2"), Some("r2"));
        assert_eq!(result.outcome(), &BatchOutcome::Complete);
    }

    #[tokio::test]
    async fn test_first_failure_cancels_in_flight() {
        let client = Arc::new(
            ScriptedClient::default()
                .with("A", Script::Body("a", Duration::from_millis(300)))
                .with("B", Script::Fail(Duration::ZERO))
                .with("C", Script::Body("c", Duration::from_millis(300))),
        );
        let started = Instant::now();
        let result = engine(client).run(&urls(&["A", "B", "C"]), LONG).await.unwrap();

        assert!(result.is_empty());
        assert!(!result.contains("A"));
        assert!(!result.contains("C"));
        assert_eq!(
            result.outcome(),
            &BatchOutcome::Aborted {
                failed_url: "B".to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_failure_keeps_earlier_results_and_skips_rest() {
        // One slot: "fast" completes, "bad" fails, "never" must not start.
        let client = Arc::new(
            ScriptedClient::default()
                .with("fast", Script::Body("done", Duration::ZERO))
                .with("bad", Script::Fail(Duration::ZERO))
                .with("never", Script::Body("x", Duration::ZERO)),
        );
        let limits = FetchLimits {
            max_concurrency: 1,
            ..FetchLimits::default()
        };
        let result = FetchEngine::new(client.clone(), limits)
            .run(&urls(&["fast", "bad", "never"]), LONG)
            .await
            .unwrap();

        assert_eq!(result.get("fast"), Some("done"));
        assert!(!result.contains("bad"));
        assert!(!result.contains("never"));
        assert_eq!(client.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_body_counts_as_failure() {
        let client = Arc::new(
            ScriptedClient::default()
                .with("empty", Script::Body("", Duration::ZERO))
                .with("slow", Script::Body("late", Duration::from_millis(300))),
        );
        let result = engine(client).run(&urls(&["slow", "empty"]), LONG).await.unwrap();

        assert!(result.is_empty());
        assert!(matches!(result.outcome(), BatchOutcome::Aborted { failed_url } if failed_url == "empty"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let delay = Duration::from_millis(50);
        let client = Arc::new(ScriptedClient::default().otherwise(Script::Body("ok", delay)));
        let addresses: Vec<String> = (0..20).map(|i| format!("http://host{i}")).collect();

        let started = Instant::now();
        let result = engine(client.clone()).run(&addresses, LONG).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.len(), 20);
        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 4);
        // ceil(20 / 4) rounds of `delay`
        assert!(elapsed >= delay * 5, "finished too fast: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_per_fetch_timeout_fails_batch() {
        let client = Arc::new(
            ScriptedClient::default().with("hang", Script::Body("never", Duration::from_secs(5))),
        );
        let limits = FetchLimits {
            fetch_timeout: Duration::from_millis(50),
            ..FetchLimits::default()
        };
        let result = FetchEngine::new(client, limits)
            .run(&urls(&["hang"]), LONG)
            .await
            .unwrap();

        assert!(result.is_empty());
        assert!(matches!(result.outcome(), BatchOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_result() {
        let client = Arc::new(
            ScriptedClient::default()
                .with("quick", Script::Body("q", Duration::ZERO))
                .with("slow", Script::Body("s", Duration::from_millis(800))),
        );
        let result = engine(client)
            .run(&urls(&["quick", "slow"]), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(result.get("quick"), Some("q"));
        assert!(!result.contains("slow"));
        assert_eq!(result.outcome(), &BatchOutcome::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_join_timeout_is_distinct_error() {
        let client = Arc::new(
            ScriptedClient::default()
                .with("quick", Script::Body("q", Duration::ZERO))
                .with("slow", Script::Body("s", Duration::from_millis(500))),
        );
        let limits = FetchLimits {
            join_timeout: Duration::from_millis(100),
            ..FetchLimits::default()
        };
        let err = FetchEngine::new(client, limits)
            .run(&urls(&["quick", "slow"]), LONG)
            .await
            .unwrap_err();

        let FetchError::BatchTimeout { partial, .. } = err;
        assert_eq!(partial.get("quick"), Some("q"));
        assert!(!partial.contains("slow"));
    }

    #[tokio::test]
    async fn test_duplicate_addresses_collapse() {
        let client = Arc::new(ScriptedClient::default().otherwise(Script::Body("same", Duration::ZERO)));
        let result = engine(client.clone())
            .run(&urls(&["dup", "dup", "dup"]), LONG)
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result.get("dup"), Some("same"));
        assert_eq!(client.started.load(Ordering::SeqCst), 3);
    }
}
