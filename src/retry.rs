//! Retry manager: repeat a flaky async operation under a [`RetryPolicy`].
//!
//! Vision APIs fail transiently all the time under concurrent load (429, 503,
//! dropped connections, an occasional empty reply). The manager re-runs the
//! operation while the error is classified [`ErrorClass::Retryable`], sleeping
//! between attempts, and gives up immediately on [`ErrorClass::Fatal`].
//!
//! ## Delay schedule
//!
//! For the delay that follows failed attempt `n` (1-indexed):
//!
//! | Strategy      | Delay               |
//! |---------------|---------------------|
//! | `Constant`    | `base`              |
//! | `Linear`      | `base × n`          |
//! | `Exponential` | `base × 2^(n−1)`    |
//!
//! Every value is clamped to `max_delay`. With the default policy
//! (exponential, 1 s base, 30 s cap, 3 attempts) the waits are 1 s → 2 s.
//!
//! A server-suggested wait (`Retry-After`) replaces the computed delay for
//! that attempt, still clamped to `max_delay`.
//!
//! ## Observers
//!
//! Each attempt is reported to a [`RetryObserver`]. The default
//! [`TracingRetryObserver`] logs through `tracing`. A panicking observer is
//! caught and ignored so it can never break the loop.

use crate::error::{Classify, ErrorClass, VisionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ── Policy ───────────────────────────────────────────────────────────────

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// `base × 2^(n−1)` (default).
    #[default]
    Exponential,
    /// `base × n`.
    Linear,
    /// `base` every time.
    Constant,
}

impl FromStr for RetryStrategy {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" | "exp" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "constant" | "fixed" => Ok(Self::Constant),
            other => Err(VisionError::InvalidConfig(format!(
                "Unknown retry strategy '{other}' (expected exponential, linear or constant)"
            ))),
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Constant => "constant",
        })
    }
}

/// Parameters of the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    /// Total attempts including the first one. Always ≥ 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for every computed or server-suggested delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Check the invariants: at least one attempt and `max_delay ≥ base_delay`.
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.max_attempts == 0 {
            return Err(VisionError::InvalidConfig(
                "Retry max_attempts must be ≥ 1".into(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(VisionError::InvalidConfig(format!(
                "Retry max_delay ({:?}) must be ≥ base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-indexed), clamped to `max_delay`.
    ///
    /// Overflow saturates to `max_delay`. `attempt = 0` is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let raw = match self.strategy {
            RetryStrategy::Constant => Some(self.base_delay),
            RetryStrategy::Linear => self.base_delay.checked_mul(n),
            RetryStrategy::Exponential => 2u32
                .checked_pow(n - 1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
        };
        raw.map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

// ── Observation ──────────────────────────────────────────────────────────

/// What happened on one attempt. Reported to the observer, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// `None` when the attempt succeeded.
    pub error_kind: Option<&'static str>,
    /// Display form of the error, when there was one.
    pub error_message: Option<String>,
    pub will_retry: bool,
    /// Sleep before the next attempt, when one follows.
    pub delay_before_next: Option<Duration>,
}

impl AttemptOutcome {
    fn succeeded(attempt: u32) -> Self {
        Self {
            attempt,
            error_kind: None,
            error_message: None,
            will_retry: false,
            delay_before_next: None,
        }
    }
}

/// Receives one [`AttemptOutcome`] per attempt.
///
/// Called synchronously from inside the retry loop; implementations must be
/// quick and must not block.
pub trait RetryObserver: Send + Sync {
    fn on_attempt(&self, outcome: &AttemptOutcome);
}

/// Default observer: logs each attempt through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingRetryObserver {
    label: String,
}

impl TracingRetryObserver {
    /// `label` prefixes every log line (usually the backend name).
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for TracingRetryObserver {
    fn default() -> Self {
        Self::new("retry")
    }
}

impl RetryObserver for TracingRetryObserver {
    fn on_attempt(&self, outcome: &AttemptOutcome) {
        let kind = outcome.error_kind.unwrap_or("none");
        let message = outcome.error_message.as_deref().unwrap_or("");
        match (outcome.error_kind, outcome.delay_before_next) {
            (None, _) => debug!("{}: attempt {} succeeded", self.label, outcome.attempt),
            (Some(_), Some(delay)) => warn!(
                "{}: attempt {} failed ({}): {}, retrying in {}ms",
                self.label,
                outcome.attempt,
                kind,
                message,
                delay.as_millis()
            ),
            (Some(_), None) => warn!(
                "{}: attempt {} failed ({}): {}, giving up",
                self.label, outcome.attempt, kind, message
            ),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Why [`RetryManager::execute`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// The operation failed with a fatal error; it was attempted once.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying error, whichever way the loop ended.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted { last: e, .. } => e,
        }
    }

    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal(_) => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Fatal(e) => write!(f, "{e}"),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Runs operations under a fixed [`RetryPolicy`].
///
/// Cheap to clone; the observer is shared.
#[derive(Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
    observer: Arc<dyn RetryObserver>,
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("policy", &self.policy)
            .field("observer", &"<dyn RetryObserver>")
            .finish()
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryManager {
    /// A manager that logs attempts with [`TracingRetryObserver`].
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: Arc::new(TracingRetryObserver::default()),
        }
    }

    /// Replace the observer.
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// Attempt 1 runs immediately. After a retryable failure the manager
    /// sleeps (server-suggested wait or strategy delay, clamped) and tries
    /// again, up to `max_attempts` in total.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => {
                    self.report(&AttemptOutcome::succeeded(attempt));
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            let delay = (class == ErrorClass::Retryable && attempt < max_attempts)
                .then(|| self.next_delay(attempt, &err));

            self.report(&AttemptOutcome {
                attempt,
                error_kind: Some(err.kind()),
                error_message: Some(err.to_string()),
                will_retry: delay.is_some(),
                delay_before_next: delay,
            });

            if class == ErrorClass::Fatal {
                return Err(RetryError::Fatal(err));
            }
            match delay {
                Some(d) => tokio::time::sleep(d).await,
                None => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
            }
        }
    }

    fn next_delay<E: Classify>(&self, attempt: u32, err: &E) -> Duration {
        match err.retry_after() {
            Some(suggested) => suggested.min(self.policy.max_delay),
            None => self.policy.delay_for(attempt),
        }
    }

    fn report(&self, outcome: &AttemptOutcome) {
        let observer = &self.observer;
        if catch_unwind(AssertUnwindSafe(|| observer.on_attempt(outcome))).is_err() {
            warn!(
                "retry observer panicked on attempt {}; ignoring",
                outcome.attempt
            );
        }
    }
}

/// One-off helper: run `operation` under `policy` with the default observer.
pub async fn execute<T, E, F, Fut>(policy: RetryPolicy, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    RetryManager::new(policy).execute(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        outcomes: Mutex<Vec<AttemptOutcome>>,
    }

    impl RecordingObserver {
        fn delays(&self) -> Vec<Duration> {
            self.outcomes
                .lock()
                .unwrap()
                .iter()
                .filter_map(|o| o.delay_before_next)
                .collect()
        }
    }

    impl RetryObserver for RecordingObserver {
        fn on_attempt(&self, outcome: &AttemptOutcome) {
            self.outcomes.lock().unwrap().push(outcome.clone());
        }
    }

    struct PanickingObserver;

    impl RetryObserver for PanickingObserver {
        fn on_attempt(&self, _outcome: &AttemptOutcome) {
            panic!("observer exploded");
        }
    }

    fn server_error() -> BackendError {
        BackendError::ServerError {
            provider: "stub".into(),
            status: 503,
            message: "unavailable".into(),
        }
    }

    fn auth_error() -> BackendError {
        BackendError::Authentication {
            provider: "stub".into(),
            message: "bad key".into(),
        }
    }

    fn policy(strategy: RetryStrategy, attempts: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            strategy,
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn exponential_delay_formula() {
        let p = policy(RetryStrategy::Exponential, 10, 100, 5_000);
        for n in 1..=10u32 {
            let expected = Duration::from_millis((100u64 << (n - 1)).min(5_000));
            assert_eq!(p.delay_for(n), expected, "attempt {n}");
        }
    }

    #[test]
    fn linear_and_constant_delays() {
        let lin = policy(RetryStrategy::Linear, 5, 250, 600);
        assert_eq!(lin.delay_for(1), Duration::from_millis(250));
        assert_eq!(lin.delay_for(2), Duration::from_millis(500));
        assert_eq!(lin.delay_for(3), Duration::from_millis(600));

        let constant = policy(RetryStrategy::Constant, 5, 1_000, 30_000);
        assert_eq!(constant.delay_for(1), Duration::from_secs(1));
        assert_eq!(constant.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_saturates_to_max_delay() {
        let p = policy(RetryStrategy::Exponential, 3, 1_000, 30_000);
        assert_eq!(p.delay_for(64), Duration::from_secs(30));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(30));
        let lin = policy(RetryStrategy::Linear, 3, u64::MAX / 2, u64::MAX);
        assert_eq!(lin.delay_for(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());
        let inverted = policy(RetryStrategy::Linear, 3, 2_000, 1_000);
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Linear".parse::<RetryStrategy>().unwrap(), RetryStrategy::Linear);
        assert_eq!(
            " exponential ".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Exponential
        );
        assert!("random".parse::<RetryStrategy>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_attempted_once() {
        let calls = AtomicU32::new(0);
        let manager = RetryManager::new(policy(RetryStrategy::Exponential, 5, 10, 100));
        let result: Result<(), _> = manager
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(auth_error()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Fatal(BackendError::Authentication { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn always_retryable_exhausts_after_k_attempts() {
        for k in 1..=4u32 {
            let calls = AtomicU32::new(0);
            let manager = RetryManager::new(policy(RetryStrategy::Linear, k, 5, 50));
            let result: Result<(), _> = manager
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(server_error()) }
                })
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), k);
            match result {
                Err(RetryError::Exhausted { attempts, last }) => {
                    assert_eq!(attempts, k);
                    assert_eq!(last, server_error());
                }
                other => panic!("expected exhaustion, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn constant_strategy_two_failures_then_success() {
        let calls = AtomicU32::new(0);
        let observer = Arc::new(RecordingObserver::default());
        let manager = RetryManager::new(policy(RetryStrategy::Constant, 3, 1_000, 30_000))
            .with_observer(observer.clone());

        let started = tokio::time::Instant::now();
        let value = manager
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(server_error())
                    } else {
                        Ok("described")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "described");
        assert_eq!(
            observer.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(1)]
        );
        assert!(started.elapsed() >= Duration::from_secs(2));

        let outcomes = observer.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].will_retry);
        assert_eq!(outcomes[0].error_kind, Some("server_error"));
        assert_eq!(outcomes[2].error_kind, None);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_strategy_but_is_clamped() {
        let observer = Arc::new(RecordingObserver::default());
        let manager = RetryManager::new(policy(RetryStrategy::Constant, 3, 100, 5_000))
            .with_observer(observer.clone());
        let calls = AtomicU32::new(0);

        let _ = manager
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let wait = if n == 0 { 2 } else { 60 };
                    Err::<(), _>(BackendError::RateLimited {
                        provider: "stub".into(),
                        message: "429".into(),
                        retry_after: Some(Duration::from_secs(wait)),
                    })
                }
            })
            .await;

        assert_eq!(
            observer.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(5)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_observer_does_not_break_loop() {
        let calls = AtomicU32::new(0);
        let manager = RetryManager::new(policy(RetryStrategy::Constant, 3, 10, 10))
            .with_observer(Arc::new(PanickingObserver));
        let value = manager
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(server_error())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn free_function_uses_policy() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = execute(RetryPolicy::no_retry(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(server_error()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }
}
