//! Cooperative cancellation
//!
//! Every operation that crosses a process boundary takes a
//! [`CancellationToken`] and races its I/O against it.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Run `fut` unless `cancel` fires first.
pub async fn run<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Canceled),
        result = fut => result,
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep(cancel: &CancellationToken, duration: std::time::Duration) -> Result<()> {
    run(cancel, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let value = tokio_test::assert_ok!(run(&token, async { Ok(7) }).await);
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = run(&token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, AppError::Canceled));
    }

    #[tokio::test]
    async fn child_token_follows_parent() {
        let root = CancellationToken::new();
        let child = root.child_token();
        root.cancel();
        assert!(matches!(
            sleep(&child, Duration::from_secs(5)).await,
            Err(AppError::Canceled)
        ));
    }
}
