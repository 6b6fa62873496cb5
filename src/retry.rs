use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{PipelineError, PipelineResult};

/// How long and how hard to retry an operation that reports it is busy.
#[derive(Debug, Clone)]
pub struct BusyPolicy {
    /// Attempts made back to back before the first sleep.
    pub spin_retries: u32,
    pub initial_sleep: Duration,
    pub max_sleep: Duration,
    /// Continuous busy time after which the stage is considered deadlocked.
    pub timeout: Duration,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self {
            spin_retries: 32,
            initial_sleep: Duration::from_millis(1),
            max_sleep: Duration::from_millis(16),
            timeout: Duration::from_secs(30),
        }
    }
}

impl BusyPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub trait Retryable {
    fn is_busy(&self) -> bool;
}

impl<T> Retryable for Option<T> {
    fn is_busy(&self) -> bool {
        self.is_none()
    }
}

#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub busy_retries: u32,
}

/// Repeats `attempt` until it returns something other than busy.
///
/// The first `spin_retries` repeats only yield the thread; after that the
/// sleep doubles from `initial_sleep` up to `max_sleep`. Exceeding
/// `timeout` of uninterrupted busy results is fatal.
pub fn retry_while_busy<T: Retryable>(
    policy: &BusyPolicy,
    label: &str,
    mut attempt: impl FnMut() -> T,
) -> PipelineResult<Retried<T>> {
    let started = Instant::now();
    let mut retries = 0u32;
    let mut sleep = policy.initial_sleep;
    loop {
        let value = attempt();
        if !value.is_busy() {
            return Ok(Retried {
                value,
                busy_retries: retries,
            });
        }
        let waited = started.elapsed();
        if waited >= policy.timeout {
            warn!(stage = label, retries, ?waited, "Busy retry budget exhausted");
            return Err(PipelineError::BusyTimeout {
                stage: label.to_string(),
                waited,
            });
        }
        retries = retries.saturating_add(1);
        if retries <= policy.spin_retries {
            thread::yield_now();
        } else {
            thread::sleep(sleep.min(policy.timeout.saturating_sub(waited)));
            sleep = (sleep * 2).min(policy.max_sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Attempt(bool);

    impl Retryable for Attempt {
        fn is_busy(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn returns_after_transient_busy() {
        let mut remaining = 40;
        let result = retry_while_busy(&BusyPolicy::default(), "stage", || {
            remaining -= 1;
            Attempt(remaining > 0)
        })
        .unwrap();
        assert_eq!(result.busy_retries, 39);
        assert!(!result.value.0);
    }

    #[test]
    fn continuous_busy_times_out() {
        let policy = BusyPolicy::default().with_timeout(Duration::from_millis(20));
        let err = retry_while_busy(&policy, "stuck", || Attempt(true)).unwrap_err();
        assert!(matches!(err, PipelineError::BusyTimeout { ref stage, .. } if stage == "stuck"));
    }
}
