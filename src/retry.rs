//! Bounded polling for eventually-consistent external conditions.
//!
//! Every wait in the bootstrap path goes through [`poll_until`]: a probe is run up
//! to `max_attempts` times with a delay between attempts. The delay is fixed by
//! default and can grow geometrically via `backoff_multiplier`. An optional
//! deadline bounds the total wall-clock wait, and a [`CancelToken`] aborts early.
//!
//! ```
//! use std::time::Duration;
//! use k3sctl::retry::{poll_until, CancelToken, ManualClock, RetryPolicy};
//!
//! let clock = ManualClock::new();
//! let policy = RetryPolicy::fixed(5, Duration::from_secs(10));
//! let outcome = poll_until(&policy, &clock, &CancelToken::new(), "api server", |attempt| {
//!     Ok(attempt == 3)
//! })?;
//! assert_eq!(outcome.attempts, 3);
//! assert_eq!(outcome.waited, Duration::from_secs(20));
//! # Ok::<(), k3sctl::Error>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// How often and how long to retry a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of probe attempts (at least 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "duration_millis", rename = "delay_ms")]
    pub delay: Duration,
    /// Multiplier applied to the delay after every failed attempt (1.0 = fixed)
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    #[serde(with = "duration_millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Upper bound for the total time spent waiting
    #[serde(with = "option_duration_millis", rename = "deadline_ms")]
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(30, Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            deadline: None,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::Config("backoff_multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Delay to sleep after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff_multiplier == 1.0 {
            return self.delay;
        }
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.delay.as_secs_f64() * factor;
        let cap = self.max_delay.max(self.delay);
        Duration::from_secs_f64(secs.min(cap.as_secs_f64()))
    }
}

/// Result of a poll that reached readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Number of probe calls, including the successful one
    pub attempts: u32,
    /// Cumulative delay slept between attempts
    pub waited: Duration,
}

/// Source of time for polling loops
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock, sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that advances only when slept on. Used for dry runs and tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Total time slept so far
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    /// Every individual sleep, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
        self.sleeps.lock().push(duration);
    }
}

/// Shared flag to abort long-running operations
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Error::Cancelled` if the token was tripped
    pub fn check(&self, during: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled(during.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Poll `probe` until it reports ready.
///
/// `probe` receives the 1-based attempt number. `Ok(true)` is ready; `Ok(false)`
/// and `Err(_)` are "not yet", the latter kept as the last error for diagnostics.
/// Returns `Error::ReadinessTimeout` after `max_attempts` unsuccessful probes, or
/// as soon as the next sleep would overrun the deadline.
pub fn poll_until<F>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
    what: &str,
    mut probe: F,
) -> Result<PollOutcome>
where
    F: FnMut(u32) -> Result<bool>,
{
    let max_attempts = policy.max_attempts.max(1);
    let start = clock.now();
    let mut waited = Duration::ZERO;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        cancel.check(&format!("waiting for {}", what))?;

        match probe(attempt) {
            Ok(true) => {
                debug!(what = %what, attempt, waited_ms = waited.as_millis() as u64, "Ready");
                return Ok(PollOutcome { attempts: attempt, waited });
            }
            Ok(false) => {
                debug!(what = %what, attempt, "Not ready yet");
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(what = %what, attempt, error = %e, "Probe failed");
                last_error = Some(e.to_string());
            }
        }

        if attempt == max_attempts {
            break;
        }

        let delay = policy.delay_after(attempt);
        if let Some(deadline) = policy.deadline {
            if clock.now().duration_since(start) + delay > deadline {
                warn!(what = %what, attempt, "Deadline reached before readiness");
                return Err(Error::ReadinessTimeout {
                    what: what.to_string(),
                    attempts: attempt,
                    last_error,
                });
            }
        }
        clock.sleep(delay);
        waited += delay;
    }

    warn!(what = %what, attempts = max_attempts, "Gave up waiting");
    Err(Error::ReadinessTimeout {
        what: what.to_string(),
        attempts: max_attempts,
        last_error,
    })
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
