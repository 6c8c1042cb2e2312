//! Bounded retry with exponential backoff. The sleeper is injectable so lock
//! contention can be simulated without real delays.

use std::io;
use std::path::Path;
use std::time::Duration;

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            multiplier: 2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, `retryable` rejects the error, or attempts run out.
pub fn retry_with_backoff<T, E, F, R>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts.max(1) && retryable(&e) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                sleeper.sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Errors that usually mean another process holds the file open.
pub fn is_lock_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    match e.raw_os_error() {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(32) | Some(33) => true,
        // EBUSY, ETXTBSY
        #[cfg(unix)]
        Some(16) | Some(26) => true,
        _ => false,
    }
}

/// Delete a file, retrying while it looks locked. A missing file counts as deleted.
pub fn remove_file_with_retry(path: &Path, policy: &RetryPolicy, sleeper: &dyn Sleeper) -> io::Result<()> {
    retry_with_backoff(policy, sleeper, is_lock_error, |_| match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<Duration>>);

    impl Sleeper for Recorder {
        fn sleep(&self, d: Duration) {
            self.0.borrow_mut().push(d);
        }
    }

    fn locked() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "locked")
    }

    #[test]
    fn succeeds_after_transient_lock() {
        let rec = Recorder::default();
        let policy = RetryPolicy::default();
        let out: io::Result<u32> = retry_with_backoff(&policy, &rec, is_lock_error, |attempt| {
            if attempt < 3 {
                Err(locked())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(out.unwrap(), 3);
        assert_eq!(
            *rec.0.borrow(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let rec = Recorder::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let mut calls = 0;
        let out: io::Result<()> = retry_with_backoff(&policy, &rec, is_lock_error, |_| {
            calls += 1;
            Err(locked())
        });
        assert!(out.is_err());
        assert_eq!(calls, 3);
        assert_eq!(rec.0.borrow().len(), 2);
    }

    #[test]
    fn non_retryable_error_returns_immediately() {
        let rec = Recorder::default();
        let out: io::Result<()> = retry_with_backoff(&RetryPolicy::default(), &rec, is_lock_error, |_| {
            Err(io::Error::new(io::ErrorKind::InvalidData, "nope"))
        });
        assert!(out.is_err());
        assert!(rec.0.borrow().is_empty());
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            multiplier: 4,
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(5), Duration::from_secs(1));
    }

    #[test]
    fn removing_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::default();
        remove_file_with_retry(&dir.path().join("gone"), &RetryPolicy::default(), &rec).unwrap();
        assert!(rec.0.borrow().is_empty());
    }
}
