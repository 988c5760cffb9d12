//! Cooperative stop signal shared by the producer and consumer loops.

/// Resolves once a stop is requested on `shutdown`.
///
/// A channel whose senders are all gone never resolves: losing the signal
/// source is not a request to stop.
pub async fn requested(shutdown: &mut tokio::sync::broadcast::Receiver<()>) {
    use tokio::sync::broadcast::error::RecvError;

    match shutdown.recv().await {
        Ok(()) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => std::future::pending().await,
    }
}
