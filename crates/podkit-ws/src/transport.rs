//! tokio-tungstenite socket connector.

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use podkit_core::{Connector, FrameSink, FrameStream, TransportError};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Opens a fresh WebSocket on every `connect()`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (socket, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::NetworkUnavailable(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| TransportError::NetworkUnavailable(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(e) => {
                        warn!(error = %e, "dropping non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(_)) => Some(Err(TransportError::ConnectionLost)),
                // Pings are answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::NetworkUnavailable(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }

    fn url(&self) -> &str {
        &self.url
    }
}
