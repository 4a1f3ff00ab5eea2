pub mod bus;
pub mod connection;
pub mod fanout;
pub mod peer_bus;
pub mod presence;
pub mod registry;
pub mod router;

use tandem_types::error::ChatError;

/// Run blocking database work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T, ChatError>
where
    F: FnOnce() -> Result<T, ChatError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Storage(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
}
