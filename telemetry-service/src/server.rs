use std::net::SocketAddr;

use axum::Router;

/// Bind `bind_addr` and serve `app` on a background task.
///
/// Binding happens before returning so address errors reach the caller; the
/// returned address carries the real port when `:0` was requested.
pub async fn spawn(name: &'static str, bind_addr: &str, app: Router) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {name} bind addr '{bind_addr}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {name} listener on {addr}: {e}"))?;
    let local = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(error = %e, server = name, "server error");
        }
    });

    tracing::info!(server = name, addr = %local, "listening");
    Ok(local)
}
