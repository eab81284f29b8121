use core::{fmt::Display, future::Future, time::Duration};

/// Bounded retry with linearly increasing delay: the wait after failed attempt
/// `n` is `n * step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt)
    }

    /// Runs `op` until it succeeds or `attempts` tries have failed, returning
    /// the last error in that case. At least one attempt is always made.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => {
                    tracing::error!("{what} failed after {attempt} attempts: {err}");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "{what} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                        self.attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
