//! Per-request cancellation and deadlines.

use crate::error::{StorageError, StorageResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Carries a request's cancellation token and optional deadline.
///
/// Every backend call made by the store runs under a context. Dropping the
/// future returned by the store also abandons the call.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A child context that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// A child context that can be cancelled independently of its parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> StorageError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => StorageError::Cancelled("context canceled".into()),
                _ = tokio::time::sleep_until(deadline) => {
                    StorageError::Cancelled("context deadline exceeded".into())
                }
            },
            None => {
                self.token.cancelled().await;
                StorageError::Cancelled("context canceled".into())
            }
        }
    }

    /// Runs `fut` until it completes or the context ends.
    pub async fn run<F, T>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> StorageResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let ctx = Context::background();
        let child = ctx.child();
        ctx.cancel();
        assert!(child.is_cancelled());

        let err = child.run(std::future::pending::<()>()).await.unwrap_err();
        assert_eq!(err, StorageError::Cancelled("context canceled".into()));
    }

    #[tokio::test]
    async fn test_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = ctx.run(std::future::pending::<()>()).await.unwrap_err();
        assert_eq!(err, StorageError::Cancelled("context deadline exceeded".into()));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
