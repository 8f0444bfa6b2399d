//! Bounded remote operations.
//!
//! Every remote call runs under both a per-operation timeout and the
//! backend's root lifecycle token, so a close tears down whatever is still
//! in flight.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::BlobError;

pub(crate) async fn bounded<F, T>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
) -> Result<T, BlobError>
where
    F: Future<Output = Result<T, BlobError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(BlobError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Err(_) => Err(BlobError::Timeout(limit)),
            Ok(inner) => inner,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_through_result() {
        let cancel = CancellationToken::new();
        let out = bounded(&cancel, Duration::from_secs(1), async { Ok(5u8) }).await;
        assert_eq!(out.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_times_out() {
        let cancel = CancellationToken::new();
        let out: Result<(), _> = bounded(&cancel, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(BlobError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out: Result<(), _> = bounded(&cancel, Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(BlobError::Cancelled)));
    }
}
