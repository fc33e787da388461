//! WebSocket endpoint feeding a `BroadcastHub`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{BroadcastHub, BroadcastSendError, FrameSink};

/// Accepts upgrades on `/` and `/ws`.
pub fn router(hub: Arc<BroadcastHub>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(hub)
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<BroadcastHub>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

struct WsFrameSink {
    tx: SplitSink<WebSocket, Message>,
    evicted: CancellationToken,
}

#[async_trait::async_trait]
impl FrameSink for WsFrameSink {
    async fn send_text(&mut self, frame: Arc<str>) -> Result<(), BroadcastSendError> {
        self.tx
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| BroadcastSendError::Transport(e.to_string()))
    }
}

impl Drop for WsFrameSink {
    // The hub dropped us; end the read loop so the socket gets closed.
    fn drop(&mut self) {
        self.evicted.cancel();
    }
}

async fn serve_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (tx, mut rx) = socket.split();
    let evicted = CancellationToken::new();
    let handle = hub.subscribe(Box::new(WsFrameSink {
        tx,
        evicted: evicted.clone(),
    }));
    metrics::counter!("broadcast_connections_total").increment(1);

    // Inbound frames carry nothing; read only to notice the close.
    loop {
        tokio::select! {
            _ = evicted.cancelled() => break,
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(subscriber = handle.id(), error = %e, "subscriber socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(handle);
    tracing::debug!(subscriber = handle.id(), "subscriber disconnected");
}
