use anyhow::{Context as _, Result};
use tokio::net::TcpListener;

/// Binds an ephemeral loopback port and returns the listener with its base URL.
pub async fn bind_loopback() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind loopback listener")?;
    let addr = listener.local_addr().context("listener address")?;
    Ok((listener, format!("http://{addr}")))
}
