//! Cancellation plumbing shared by the public operations: every suspending call
//! optionally races a caller-supplied token.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::core::types::{WebSocketError, WebSocketResult};

/// Run `fut`, bailing out with [`WebSocketError::Cancelled`] if the caller's token
/// fires first.
pub(crate) async fn with_cancel<T>(
    cancellation: Option<&CancellationToken>,
    fut: impl Future<Output = WebSocketResult<T>>,
) -> WebSocketResult<T> {
    match cancellation {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(WebSocketError::Cancelled),
                result = fut => result,
            }
        }
    }
}

/// Tie a caller-supplied token into an owned root: when the caller cancels, the
/// root (and every child under it) unwinds too.
pub(crate) fn link_into(root: &CancellationToken, caller: Option<CancellationToken>) {
    if let Some(caller) = caller {
        let root = root.clone();
        tokio::spawn(async move {
            caller.cancelled().await;
            root.cancel();
        });
    }
}
