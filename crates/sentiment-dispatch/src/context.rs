//! Per-call deadline and cancellation.

use core::{future::Future, time::Duration};
use sentiment_core::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Bounds one dispatch call.
///
/// `timeout` applies to each remote round-trip the call makes (one unary RPC,
/// one stream pass, or one publish) and is forwarded to the engine as the gRPC
/// deadline. Cancelling `cancel` aborts whatever is in flight and the call
/// returns [`Error::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drives `fut` to completion unless the deadline passes or the context is
    /// cancelled first. Cancellation wins ties.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            res = bounded => res,
        }
    }
}
