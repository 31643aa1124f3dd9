//! Retrying remote calls with exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value; [`call_with_retry`] is the async
//! higher-order wrapper and [`call_with_retry_blocking`] its counterpart for
//! synchronous hosts. Both share the same [`RetryState`] step logic:
//!
//! - [`ErrorKind::Recoverable`] / [`ErrorKind::RateLimited`] → wait, then retry
//! - wait = `Retry-After + 1s` when the server sent a hint, otherwise
//!   `min(base_delay * backoff_factor^attempt, max_delay)`, never below 3s
//! - any other kind → returned on first occurrence
//! - after `max_retries` retries the last error is returned wrapped in
//!   [`RemoteError::RetriesExhausted`]
//!
//! The full wait is always slept; waits go through a [`Sleeper`] so tests can
//! substitute a fake clock.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ErrorKind, RemoteError};

/// Lower bound on any backoff wait.
pub const MIN_WAIT: Duration = Duration::from_secs(3);

/// Added on top of a server-supplied `Retry-After`.
pub const RETRY_AFTER_PADDING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before the retry that follows failed attempt number `attempt` (0-based).
    pub fn wait_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let wait = match retry_after {
            Some(hint) => hint.saturating_add(RETRY_AFTER_PADDING),
            None => {
                let exp = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
                let secs = self.base_delay.as_secs_f64() * exp;
                let capped = secs.min(self.max_delay.as_secs_f64());
                Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
            }
        };
        wait.max(MIN_WAIT)
    }
}

/// Progress of one retried call. `attempt` only ever grows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub delay: Duration,
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum RetryStep {
    /// Sleep this long, then try again.
    Wait(Duration),
    /// Stop and surface this error.
    GiveUp(RemoteError),
}

impl RetryState {
    /// Record a failed attempt and decide the next step.
    pub fn on_failure(&mut self, policy: &RetryPolicy, err: RemoteError) -> RetryStep {
        let kind = err.kind();
        if !kind.is_retryable() {
            return RetryStep::GiveUp(err);
        }
        let wait = policy.wait_for(self.attempt, err.retry_after());
        if self.attempt >= policy.max_retries {
            return RetryStep::GiveUp(RemoteError::RetriesExhausted {
                kind,
                attempts: self.attempt + 1,
                retry_hint: Some(wait),
                source: Box::new(err),
            });
        }
        self.delay = wait;
        self.attempt += 1;
        RetryStep::Wait(wait)
    }
}

/// Suspends the current worker for a backoff or inter-batch delay.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real async sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fake clock: records every requested wait and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.waits().iter().sum()
    }

    fn record(&self, duration: Duration) {
        self.waits.lock().push(duration);
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.record(duration);
        tokio::task::yield_now().await;
    }
}

/// Run `op` until it succeeds, fails fatally, or exhausts the policy.
///
/// `label` names the call in log lines.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut state = RetryState::default();
    loop {
        match op().await {
            Ok(value) => {
                if state.attempt > 0 {
                    debug!(call = label, attempts = state.attempt + 1, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => match step(&mut state, policy, label, err) {
                RetryStep::Wait(wait) => sleeper.sleep(wait).await,
                RetryStep::GiveUp(err) => return Err(err),
            },
        }
    }
}

/// Blocking form of [`call_with_retry`] for synchronous callers.
pub fn call_with_retry_blocking<T, F>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Result<T, RemoteError>,
{
    let mut state = RetryState::default();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => match step(&mut state, policy, label, err) {
                RetryStep::Wait(wait) => std::thread::sleep(wait),
                RetryStep::GiveUp(err) => return Err(err),
            },
        }
    }
}

fn step(state: &mut RetryState, policy: &RetryPolicy, label: &str, err: RemoteError) -> RetryStep {
    let kind = err.kind();
    let message = err.to_string();
    let next = state.on_failure(policy, err);
    match &next {
        RetryStep::Wait(wait) => warn!(
            call = label,
            kind = %kind,
            attempt = state.attempt,
            max_retries = policy.max_retries,
            wait_secs = wait.as_secs_f64(),
            error = %message,
            "remote call failed, backing off"
        ),
        RetryStep::GiveUp(_) if kind == ErrorKind::AuthFailure => {
            warn!(call = label, error = %message, "authentication failure, not retrying")
        }
        RetryStep::GiveUp(_) => {
            debug!(call = label, kind = %kind, error = %message, "giving up on remote call")
        }
    }
    next
}
