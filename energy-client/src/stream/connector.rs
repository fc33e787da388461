use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use super::ClientConnectionError;

/// Text frames from one live connection. The stream ending means the peer closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ClientConnectionError>> + Send>>;

/// Opens a transport to the broadcast endpoint.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<FrameStream, ClientConnectionError>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<FrameStream, ClientConnectionError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientConnectionError::Connect(format!("{}: {e}", self.url)))?;

        // Control frames are handled by tungstenite; only text carries readings.
        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(ClientConnectionError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(ClientConnectionError::Transport(e.to_string()))),
            }
        });

        Ok(Box::pin(frames))
    }
}
