//! Cancellation-aware future racing.
//!
//! Every transport call and every sleep in the run controller must abort
//! promptly when the process-level `CancellationToken` fires. `OrCancelExt`
//! races an arbitrary future against the token.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The raced token fired before the future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Resolve to `Ok(output)` if the future completes first, or
    /// `Err(Cancelled)` once the token is cancelled.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            _ = token.cancelled() => Err(Cancelled),
            out = self => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn completes_when_token_stays_quiet() {
        let token = CancellationToken::new();
        let result = async { 7 }.or_cancel(&token).await;
        assert_eq!(Ok(7), result);
    }

    #[tokio::test]
    async fn aborts_when_token_fires_first() {
        let token = CancellationToken::new();
        let fired = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            fired.cancel();
        });

        let result = async {
            sleep(Duration::from_secs(5)).await;
            1
        }
        .or_cancel(&token)
        .await;

        assert_eq!(Err(Cancelled), result);
    }

    #[tokio::test]
    async fn aborts_immediately_on_pre_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();

        let result = async {
            sleep(Duration::from_secs(5)).await;
            1
        }
        .or_cancel(&token)
        .await;

        assert_eq!(Err(Cancelled), result);
    }
}
