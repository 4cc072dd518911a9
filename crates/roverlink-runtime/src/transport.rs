//! Transport seam between the connection manager and the network.
//!
//! The connection manager only ever sees a [`FrameSink`] of outbound text
//! frames and a [`FrameStream`] of inbound ones.  [`WsConnector`] produces
//! them from a real WebSocket; tests swap in an in-memory connector.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::future;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{BoxStream, StreamExt};
use roverlink_types::BridgeError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Outbound half of an open connection.  Items are JSON text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = BridgeError> + Send>>;

/// Inbound half of an open connection.
///
/// Yields `Ok(text)` per frame, `Err(BridgeError::Decode)` for a frame that
/// is not text, `Err(BridgeError::Transport)` on a socket error, and ends when
/// the peer closes.
pub type FrameStream = BoxStream<'static, Result<String, BridgeError>>;

/// Opens connections to the coordination server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), BridgeError>;
}

/// [`Connector`] over `tokio-tungstenite` (`ws://` and `wss://`).
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), BridgeError> {
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Transport(format!("connect to {url}: {e}")))?;
        debug!(url = %url, status = %response.status(), "websocket handshake complete");

        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text.into()))))
            .sink_map_err(|e| BridgeError::Transport(e.to_string()));

        let stream = ws_rx
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| BridgeError::Decode(format!("binary frame: {e}"))),
                    ),
                    // Ping/pong are answered by tungstenite; close ends the stream.
                    Ok(_) => None,
                    Err(e) => Some(Err(BridgeError::Transport(e.to_string()))),
                })
            })
            .boxed();

        Ok((Box::pin(sink), stream))
    }
}
