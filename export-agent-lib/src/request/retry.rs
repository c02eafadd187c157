//! Rate-limited, retrying execution of outbound calls.
//!
//! A [`RetryClient`] stacks three protections around every call of one integration
//! instance:
//!
//! 1. A [`Throttler`] bounding the number of simultaneous in-flight calls.
//! 2. A quota probe run every N calls. When the remaining share of the quota drops to
//!    the configured buffer, every caller pauses until the provider's reset time.
//! 3. Reactive handling of each attempt's [`ApiResult`]: throttling pauses and retries
//!    up to one cap, transient failures back off linearly and retry up to another, and
//!    everything else fails at once.
//!
//! Every pause is announced to the agent through the [`AgentDelegate`].

use super::throttler::Throttler;
use crate::Result;
use crate::plugin::AgentDelegate;
use chrono::{DateTime, Utc};
use core::fmt;
use core::future::Future;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use futures::future::BoxFuture;
use ohno::{AppError, EnrichableExt, app_err, bail};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LOG_TARGET: &str = "     retry";

/// Outcome of a single attempt of an outbound call.
#[derive(Debug)]
pub enum ApiResult<T> {
    /// The call succeeded.
    Success(T),

    /// The provider asked us to slow down.
    Throttled(ThrottleHint),

    /// The call failed in a way that may succeed if repeated (network error, 502).
    Transient(AppError),

    /// The call failed permanently (authentication, other 4xx, malformed payload).
    Failed(AppError),
}

/// How long the provider wants us to back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleHint {
    /// Quota resets at the given time.
    ResetAt(DateTime<Utc>),

    /// Secondary limit triggered by request bursts; wait the configured abuse delay.
    Abuse,

    /// No hint available; wait the configured fallback delay.
    Unknown,
}

/// Snapshot of a provider's request quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Retry and pacing settings for one integration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum simultaneous in-flight calls.
    pub request_concurrency: usize,

    /// Probe the quota every this many calls. Zero disables probing.
    pub check_rate_limit_every: u64,

    /// Fraction of the quota left untouched. Zero disables proactive pausing.
    pub request_buffer: f64,

    #[serde(with = "humantime_serde")]
    pub min_pause: Duration,

    #[serde(with = "humantime_serde")]
    pub max_pause: Duration,

    /// Pause used when a throttling response carries no reset hint.
    #[serde(with = "humantime_serde")]
    pub throttle_fallback_wait: Duration,

    /// Pause used when the provider's abuse detection triggers.
    #[serde(with = "humantime_serde")]
    pub abuse_wait: Duration,

    pub max_general_retries: u32,

    pub max_throttled_retries: u32,

    /// Attempt `n` (zero based) of a transient failure waits `(1 + n) * base`.
    #[serde(with = "humantime_serde")]
    pub general_retry_base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_concurrency: 10,
            check_rate_limit_every: 100,
            request_buffer: 0.2,
            min_pause: Duration::from_mins(5),
            max_pause: Duration::from_mins(30),
            throttle_fallback_wait: Duration::from_mins(30),
            abuse_wait: Duration::from_mins(5),
            max_general_retries: 2,
            max_throttled_retries: 3,
            general_retry_base_delay: Duration::from_mins(1),
        }
    }
}

impl RetryPolicy {
    /// Clamp a requested pause to `[min_pause, max_pause]`.
    #[must_use]
    pub fn clamp_pause(&self, wait: Duration) -> Duration {
        wait.max(self.min_pause).min(self.max_pause)
    }
}

type QuotaProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<QuotaStatus>> + Send + Sync>;

/// Outcome of running a call under the throttling cap only.
enum Attempt<T> {
    Done(T),
    Retryable(AppError),
    Fatal(AppError),
}

/// Runs outbound calls of one integration instance under the [`RetryPolicy`].
pub struct RetryClient {
    policy: RetryPolicy,
    throttler: Arc<Throttler>,
    agent: Arc<dyn AgentDelegate>,
    quota_probe: Option<QuotaProbe>,
    requests_made: AtomicU64,
}

impl fmt::Debug for RetryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryClient")
            .field("policy", &self.policy)
            .field("throttler", &self.throttler)
            .field("has_quota_probe", &self.quota_probe.is_some())
            .field("requests_made", &self.requests_made)
            .finish_non_exhaustive()
    }
}

impl RetryClient {
    #[must_use]
    pub fn new(policy: RetryPolicy, agent: Arc<dyn AgentDelegate>) -> Self {
        Self {
            throttler: Throttler::new(policy.request_concurrency),
            policy,
            agent,
            quota_probe: None,
            requests_made: AtomicU64::new(0),
        }
    }

    /// Install the probe used for proactive quota checks.
    #[must_use]
    pub fn with_quota_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<QuotaStatus>> + Send + Sync + 'static,
    {
        self.quota_probe = Some(Arc::new(probe));
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    /// Run `op` with throttling, quota checks, and both retry caps.
    ///
    /// `op` is invoked once per attempt.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        self.check_quota_if_due().await;

        let mut general_retries = 0;
        loop {
            match self.call_throttled(&mut op).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) => {
                    if general_retries >= self.policy.max_general_retries {
                        return Err(e.enrich_with(|| format!("giving up after {general_retries} retries")));
                    }

                    let delay = self.policy.general_retry_base_delay * (1 + general_retries);
                    log::debug!(target: LOG_TARGET, "Transient failure, retrying in {delay:?}: {e:#}");
                    tokio::time::sleep(delay).await;
                    general_retries += 1;
                }
            }
        }
    }

    /// Run `op` exactly once, under the concurrency limit but with no retries.
    ///
    /// Used for calls that must not be repeated, such as mutations.
    pub async fn call_once<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T>
    where
        Fut: Future<Output = ApiResult<T>>,
    {
        let result = {
            let _permit = self.throttler.acquire().await;
            op().await
        };

        match result {
            ApiResult::Success(value) => Ok(value),
            ApiResult::Throttled(hint) => bail!("request throttled by provider ({hint:?})"),
            ApiResult::Transient(e) | ApiResult::Failed(e) => Err(e),
        }
    }

    async fn call_throttled<T, F, Fut>(&self, op: &mut F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut throttled_retries = 0;
        loop {
            // The permit is released before any sleep below.
            let result = {
                let _permit = self.throttler.acquire().await;
                op().await
            };

            let hint = match result {
                ApiResult::Success(value) => return Attempt::Done(value),
                ApiResult::Transient(e) => return Attempt::Retryable(e),
                ApiResult::Failed(e) => return Attempt::Fatal(e),
                ApiResult::Throttled(hint) => hint,
            };

            if throttled_retries >= self.policy.max_throttled_retries {
                return Attempt::Fatal(app_err!("request still throttled after {throttled_retries} retries"));
            }

            let wait = match hint {
                ThrottleHint::ResetAt(reset_at) => until(reset_at),
                ThrottleHint::Abuse => self.policy.abuse_wait,
                ThrottleHint::Unknown => self.policy.throttle_fallback_wait,
            };

            log::warn!(
                target: LOG_TARGET,
                "Request throttled by provider ({hint:?}), pausing before retry {} of {}",
                throttled_retries + 1,
                self.policy.max_throttled_retries
            );

            self.pause(wait).await;
            throttled_retries += 1;
        }
    }

    /// Probe the quota every `check_rate_limit_every` calls; failures never block the call.
    async fn check_quota_if_due(&self) {
        let every = self.policy.check_rate_limit_every;
        if every == 0 || self.quota_probe.is_none() {
            return;
        }

        let made = self.requests_made.fetch_add(1, Ordering::Relaxed) + 1;
        if made % every != 0 {
            return;
        }

        if let Err(e) = self.check_quota().await {
            log::error!(target: LOG_TARGET, "Could not check available quota, issuing request as normal: {e:#}");
        }
    }

    /// Pause when the remaining quota is at or below the configured buffer.
    pub async fn check_quota(&self) -> Result<()> {
        let Some(probe) = &self.quota_probe else {
            return Ok(());
        };

        if self.policy.request_buffer <= 0.0 {
            return Ok(());
        }

        log::info!(target: LOG_TARGET, "Checking request quota");
        let quota = probe().await?;
        if quota.limit == 0 {
            bail!("invalid rate limit object: limit is 0");
        }

        #[expect(clippy::cast_precision_loss, reason = "quota counts are far below 2^52")]
        let left = quota.remaining as f64 / quota.limit as f64;
        if left > self.policy.request_buffer {
            return Ok(());
        }

        log::warn!(
            target: LOG_TARGET,
            "Pausing to keep part of the request quota unused: {} of {} remaining, resets at {}",
            quota.remaining,
            quota.limit,
            quota.reset_at
        );

        self.pause(until(quota.reset_at)).await;
        Ok(())
    }

    /// Hold back every call of this instance for `wait` (clamped) and sleep it out.
    ///
    /// The caller that starts a pause announces it to the agent. Callers that join an
    /// active pause stay quiet and wake when it ends.
    async fn pause(&self, wait: Duration) {
        let pause = self.throttler.pause_for(self.policy.clamp_pause(wait));
        if !pause.started {
            log::debug!(target: LOG_TARGET, "Joining an active pause");
            pause.wait().await;
            return;
        }

        let remaining = pause.ends_at.saturating_duration_since(tokio::time::Instant::now());
        let resume_at = chrono::Duration::from_std(remaining)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if let Err(e) = self.agent.send_pause_event(String::new(), resume_at).await {
            log::error!(target: LOG_TARGET, "Could not send pause event: {e:#}");
        }

        pause.wait().await;

        if let Err(e) = self.agent.send_resume_event(String::new()).await {
            log::error!(target: LOG_TARGET, "Could not send resume event: {e:#}");
        }
    }
}

/// Time remaining until `at`, zero if it has passed.
fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::GitRepoFetch;
    use core::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingDelegate {
        events: Mutex<Vec<&'static str>>,
    }

    impl AgentDelegate for RecordingDelegate {
        fn export_git_repo(&self, _fetch: GitRepoFetch) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send_pause_event(&self, _id: String, _resume_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
            self.events.lock().unwrap().push("pause");
            Box::pin(async { Ok(()) })
        }

        fn send_resume_event(&self, _id: String) -> BoxFuture<'_, Result<()>> {
            self.events.lock().unwrap().push("resume");
            Box::pin(async { Err(app_err!("bus is down")) })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            request_concurrency: 2,
            check_rate_limit_every: 1,
            request_buffer: 0.2,
            min_pause: Duration::from_millis(5),
            max_pause: Duration::from_millis(20),
            throttle_fallback_wait: Duration::from_millis(10),
            abuse_wait: Duration::from_millis(10),
            max_general_retries: 2,
            max_throttled_retries: 3,
            general_retry_base_delay: Duration::from_millis(1),
        }
    }

    fn client() -> (RetryClient, Arc<RecordingDelegate>) {
        let delegate = Arc::new(RecordingDelegate::default());
        let agent: Arc<dyn AgentDelegate> = Arc::clone(&delegate) as Arc<dyn AgentDelegate>;
        (RetryClient::new(fast_policy(), agent), delegate)
    }

    #[tokio::test]
    async fn test_success_is_returned() {
        let (client, _) = client();
        let value = client.call(|| async { ApiResult::Success(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_throttled_retries_are_bounded() {
        let (client, delegate) = client();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = client
            .call(|| {
                let _ = attempts.fetch_add(1, Ordering::SeqCst);
                async { ApiResult::Throttled(ThrottleHint::Unknown) }
            })
            .await;

        let _ = result.unwrap_err();
        // one initial attempt plus exactly max_throttled_retries retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let events = delegate.events.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| **e == "pause").count(), 3);
        assert_eq!(events.iter().filter(|e| **e == "resume").count(), 3);
    }

    #[tokio::test]
    async fn test_throttle_then_success() {
        let (client, _) = client();
        let attempts = AtomicU32::new(0);

        let value = client
            .call(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        ApiResult::Throttled(ThrottleHint::Abuse)
                    } else {
                        ApiResult::Success("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_retries_are_bounded() {
        let (client, _) = client();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = client
            .call(|| {
                let _ = attempts.fetch_add(1, Ordering::SeqCst);
                async { ApiResult::Transient(app_err!("502")) }
            })
            .await;

        let _ = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_is_not_retried() {
        let (client, _) = client();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = client
            .call(|| {
                let _ = attempts.fetch_add(1, Ordering::SeqCst);
                async { ApiResult::Failed(app_err!("401: bad credentials")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("bad credentials"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_once_does_not_retry() {
        let (client, _) = client();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = client
            .call_once(|| {
                let _ = attempts.fetch_add(1, Ordering::SeqCst);
                async { ApiResult::Throttled(ThrottleHint::Unknown) }
            })
            .await;

        let _ = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_quota_pauses() {
        let (client, delegate) = client();
        let client = client.with_quota_probe(|| {
            Box::pin(async {
                Ok(QuotaStatus {
                    limit: 100,
                    remaining: 5,
                    reset_at: Utc::now(),
                })
            })
        });

        let value = client.call(|| async { ApiResult::Success(1) }).await.unwrap();
        assert_eq!(value, 1);
        assert_eq!(*delegate.events.lock().unwrap(), vec!["pause", "resume"]);
    }

    #[tokio::test]
    async fn test_ample_quota_does_not_pause() {
        let (client, delegate) = client();
        let client = client.with_quota_probe(|| {
            Box::pin(async {
                Ok(QuotaStatus {
                    limit: 100,
                    remaining: 90,
                    reset_at: Utc::now(),
                })
            })
        });

        let _ = client.call(|| async { ApiResult::Success(1) }).await.unwrap();
        assert!(delegate.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_is_an_error() {
        let (client, _) = client();
        let client = client.with_quota_probe(|| {
            Box::pin(async {
                Ok(QuotaStatus {
                    limit: 0,
                    remaining: 0,
                    reset_at: Utc::now(),
                })
            })
        });

        let err = client.check_quota().await.unwrap_err();
        assert!(err.to_string().contains("limit is 0"));

        // The call itself still proceeds.
        assert_eq!(client.call(|| async { ApiResult::Success(2) }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_block_call() {
        let (client, _) = client();
        let client = client.with_quota_probe(|| Box::pin(async { Err(app_err!("probe down")) }));
        assert_eq!(client.call(|| async { ApiResult::Success(3) }).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joining_a_pause_is_silent_and_ends_with_it() {
        let (client, delegate) = client();
        let active = client.throttler().pause_for(Duration::from_millis(18));

        let start = tokio::time::Instant::now();
        client.pause(Duration::from_millis(10)).await;

        assert_eq!(tokio::time::Instant::now(), active.ends_at);
        assert_eq!(start.elapsed(), Duration::from_millis(18));
        assert!(delegate.events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_throttles_announce_one_pause() {
        let (client, delegate) = client();
        let both_in_flight = tokio::sync::Barrier::new(2);

        let call = |value: u32| {
            let attempts = AtomicU32::new(0);
            let both_in_flight = &both_in_flight;
            let client = &client;
            async move {
                client
                    .call(|| {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n == 0 {
                                let _ = both_in_flight.wait().await;
                                ApiResult::Throttled(ThrottleHint::Unknown)
                            } else {
                                ApiResult::Success(value)
                            }
                        }
                    })
                    .await
            }
        };

        let (a, b) = tokio::join!(call(1), call(2));
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(*delegate.events.lock().unwrap(), vec!["pause", "resume"]);
    }

    #[test]
    fn test_clamp_pause() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.clamp_pause(Duration::from_secs(1)), Duration::from_mins(5));
        assert_eq!(policy.clamp_pause(Duration::from_hours(2)), Duration::from_mins(30));
        assert_eq!(policy.clamp_pause(Duration::from_mins(10)), Duration::from_mins(10));
    }

    #[test]
    fn test_policy_from_toml_durations() {
        let policy: RetryPolicy = toml::from_str("min_pause = \"1s\"\nmax_general_retries = 5").unwrap();
        assert_eq!(policy.min_pause, Duration::from_secs(1));
        assert_eq!(policy.max_general_retries, 5);
        assert_eq!(policy.max_pause, Duration::from_mins(30));
    }
}
