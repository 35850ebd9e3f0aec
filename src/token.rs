//! Completion handles ("tokens"): single-shot futures returned from every
//! async operation the client exposes.
//!
//! Built directly on a `tokio::sync::oneshot` pair: the operation is
//! handed off to a background logic loop, which resolves the token once
//! it reaches a terminal state, rather than blocking the caller inline.
//! Completion happening "exactly once" falls out of `oneshot::Sender`
//! being consumed by its single `send` call.

use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::error::MqttError;

/// The producer half, held by the logic loop until the operation reaches
/// a terminal state (ack, error, or client shutdown).
#[derive(Debug)]
pub struct TokenSource<T> {
    tx: oneshot::Sender<Result<T, MqttError>>,
}

/// The consumer half, returned to the application from `publish`,
/// `subscribe`, `unsubscribe`, and `connect`.
#[derive(Debug)]
pub struct Token<T> {
    rx: oneshot::Receiver<Result<T, MqttError>>,
}

/// Creates a fresh completion pair for one operation.
pub fn token<T>() -> (TokenSource<T>, Token<T>) {
    let (tx, rx) = oneshot::channel();
    (TokenSource { tx }, Token { rx })
}

impl<T> TokenSource<T> {
    /// Resolves the token. A `TokenSource` is consumed by this call, so
    /// "subsequent completions are no-ops" holds by construction — there
    /// is no second `TokenSource` left to call it again.
    pub fn complete(self, result: Result<T, MqttError>) {
        let _ = self.tx.send(result);
    }
}

impl<T> Token<T> {
    /// Waits for completion with no bound beyond the operation itself
    /// reaching a terminal state.
    pub async fn wait(self) -> Result<T, MqttError> {
        self.rx.await.unwrap_or(Err(MqttError::ClientDisconnected))
    }

    /// Waits for completion, bounded by `timeout`. A timeout does not
    /// cancel the operation already on the wire — the `TokenSource` may
    /// still complete later against a `Token` nobody is watching anymore.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, MqttError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MqttError::ClientDisconnected),
            Err(_) => Err(MqttError::TimedOut),
        }
    }

    /// Waits for completion, unblocked early by a shutdown signal.
    /// Cancellation this way never touches the operation already on the
    /// wire — it only stops this particular waiter from waiting.
    pub async fn wait_cancellable(
        self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<T, MqttError> {
        tokio::select! {
            result = self.rx => result.unwrap_or(Err(MqttError::ClientDisconnected)),
            _ = shutdown.changed() => Err(MqttError::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_successfully() {
        let (src, tok) = token::<u32>();
        src.complete(Ok(7));
        assert_eq!(tok.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_source_fails_the_token() {
        let (src, tok) = token::<u32>();
        drop(src);
        assert!(matches!(tok.wait().await, Err(MqttError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn wait_timeout_elapses_without_completion() {
        let (_src, tok) = token::<u32>();
        let err = tok.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MqttError::TimedOut));
    }

    #[tokio::test]
    async fn wait_cancellable_unblocks_on_shutdown() {
        let (_src, tok) = token::<u32>();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let waiter = tokio::spawn(tok.wait_cancellable(rx));
        tx.send(true).unwrap();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MqttError::Canceled)));
    }
}
