//! Cancellation helpers for gRPC calls.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tonic::Status;

pub use crate::tunnel::error::is_canceled;

/// Message carried by statuses produced from a fired token.
pub const CANCELED_MESSAGE: &str = "context canceled";

/// Await `call` unless `token` fires first, in which case the call is dropped
/// and `Cancelled` is returned.
pub async fn with_cancellation<T, F>(token: &CancellationToken, call: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Status::cancelled(CANCELED_MESSAGE)),
        result = call => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fired_token_cancels() {
        let token = CancellationToken::new();
        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceler.cancel();
        });

        let sleep = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        };
        let err = with_cancellation(&token, sleep).await.unwrap_err();
        assert!(is_canceled(&err));
        assert_eq!(err.message(), CANCELED_MESSAGE);
    }

    #[tokio::test]
    async fn completed_call_passes_through() {
        let token = CancellationToken::new();
        let value = with_cancellation(&token, async { Ok::<_, Status>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
