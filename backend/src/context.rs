use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

/// Cancellation and deadline carried through every store and gateway call of
/// an orchestrator chain.
#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Context that is never cancelled. Tests only need this.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Child context: cancelled with the parent, bounded by the earlier deadline
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(match self.deadline {
                Some(existing) if existing < deadline => existing,
                _ => deadline,
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one suspension point under this context
    pub async fn run<T, F>(&self, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(AppError::Cancelled),
                res = tokio::time::timeout_at(deadline, fut) => {
                    res.map_err(|_| AppError::DeadlineExceeded)?
                }
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(AppError::Cancelled),
                res = fut => res,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_passes_through() {
        let ctx = OpContext::background();
        let value = ctx.run(async { Ok::<_, AppError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let token = CancellationToken::new();
        let ctx = OpContext::new(token.clone()).with_timeout(Duration::from_secs(60));
        token.cancel();

        let res = ctx.run(async { Ok::<_, AppError>(()) }).await;
        assert!(matches!(res, Err(AppError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = OpContext::background().with_timeout(Duration::from_millis(50));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, AppError>(())
            })
            .await;
        assert!(matches!(res, Err(AppError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_deadline() {
        let parent = OpContext::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline, parent.deadline);
    }
}
