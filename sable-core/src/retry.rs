//! Bounded retry with linear backoff, applied at call sites that hit
//! transient collaborator failures (checkpoint downloads, preview sinks).

use std::time::Duration;

use crate::Result;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, backoff: Duration::from_millis(250) }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    /// Run `op`, retrying transient failures up to the attempt budget.
    /// Non-transient errors surface immediately.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        "{what}: attempt {attempt}/{} failed: {err}, retrying",
                        self.max_attempts
                    );
                    std::thread::sleep(self.backoff * attempt as u32);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn transient_errors_are_retried_until_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut attempts = 0;
        let result: Result<()> = policy.run("load", || {
            attempts += 1;
            Err(Error::transient("checkpoint busy"))
        });
        assert!(matches!(result, Err(Error::TransientIo(_))));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn recovery_stops_retrying() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut attempts = 0;
        let result = policy.run("load", || {
            attempts += 1;
            if attempts < 3 {
                Err(Error::transient("not yet"))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut attempts = 0;
        let result: Result<()> = policy.run("load", || {
            attempts += 1;
            Err(Error::config("bad model name"))
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(attempts, 1);
    }
}
