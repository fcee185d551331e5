//! The WebSocket capability seam: [`WebSocketTransport`] and
//! [`WebSocketConnection`], parallel in spirit to [`crate::http::Transport`].
//!
//! Generalizing the socket itself into a trait (rather than having the
//! Engine hold a `tokio_tungstenite::WebSocketStream` directly) is what
//! lets the Engine's protocol logic — handshake sequencing, multiplexed
//! dispatch, ping/pong — be exercised by a scripted in-process test
//! double instead of a real network socket.

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Opens one WebSocket connection against a URL, advertising the given
/// sub-protocol.
#[async_trait]
pub trait WebSocketTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> Result<Box<dyn WebSocketConnection>, String>;
}

/// One open WebSocket connection, reduced to the text-frame send/receive
/// surface the [`Engine`](super::Engine) needs.
#[async_trait]
pub trait WebSocketConnection: Send + Sync {
    async fn send_text(&mut self, text: String) -> Result<(), String>;

    /// Returns the next text frame, `None` when the connection is
    /// closed, or `Some(Err(_))` on a transport-level read failure.
    /// Non-text frames (ping/pong/binary at the WebSocket layer, as
    /// opposed to the `graphql-transport-ws` `ping`/`pong` JSON frames)
    /// are swallowed transparently by the implementation.
    async fn recv_text(&mut self) -> Option<Result<String, String>>;
}

/// Production transport backed by `tokio-tungstenite`.
pub struct TungsteniteTransport;

#[async_trait]
impl WebSocketTransport for TungsteniteTransport {
    async fn connect(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> Result<Box<dyn WebSocketConnection>, String> {
        let mut request = url
            .into_client_request()
            .map_err(|e| format!("invalid websocket url: {e}"))?;
        let header_value = subprotocol
            .parse()
            .map_err(|_| format!("invalid sub-protocol: {subprotocol}"))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", header_value);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| format!("websocket connect failed: {e}"))?;

        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl WebSocketConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<(), String> {
        use futures_util::SinkExt;
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn recv_text(&mut self) -> Option<Result<String, String>> {
        use futures_util::StreamExt;
        loop {
            return match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => Some(Ok(text.to_string())),
                Some(Ok(WsMessage::Close(_))) | None => None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => Some(Err(e.to_string())),
            };
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    /// An in-process scripted pair: `ServerHandle` stands in for "the
    /// server side" in a test, letting it push frames to the engine and
    /// observe frames the engine sends, without a real socket.
    pub struct MockWsTransport {
        to_engine: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
        from_engine: mpsc::UnboundedSender<String>,
    }

    pub struct ServerHandle {
        to_engine_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
        from_engine_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    }

    impl MockWsTransport {
        pub fn pair() -> (Arc<MockWsTransport>, ServerHandle) {
            let (to_engine_tx, to_engine_rx) = mpsc::unbounded_channel();
            let (from_engine_tx, from_engine_rx) = mpsc::unbounded_channel();
            (
                Arc::new(MockWsTransport {
                    to_engine: Mutex::new(Some(to_engine_rx)),
                    from_engine: from_engine_tx,
                }),
                ServerHandle {
                    to_engine_tx: Mutex::new(Some(to_engine_tx)),
                    from_engine_rx: Mutex::new(from_engine_rx),
                },
            )
        }
    }

    #[async_trait]
    impl WebSocketTransport for MockWsTransport {
        async fn connect(
            &self,
            _url: &str,
            _subprotocol: &str,
        ) -> Result<Box<dyn WebSocketConnection>, String> {
            let rx = self
                .to_engine
                .lock()
                .await
                .take()
                .ok_or_else(|| "mock transport only supports one connection".to_string())?;
            Ok(Box::new(MockWsConnection {
                rx,
                tx: self.from_engine.clone(),
            }))
        }
    }

    struct MockWsConnection {
        rx: mpsc::UnboundedReceiver<String>,
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl WebSocketConnection for MockWsConnection {
        async fn send_text(&mut self, text: String) -> Result<(), String> {
            self.tx.send(text).map_err(|_| "server side dropped".to_string())
        }

        async fn recv_text(&mut self) -> Option<Result<String, String>> {
            self.rx.recv().await.map(Ok)
        }
    }

    impl ServerHandle {
        /// Push a frame "from the server" to the engine.
        pub async fn send(&self, text: impl Into<String>) {
            if let Some(tx) = self.to_engine_tx.lock().await.as_ref() {
                let _ = tx.send(text.into());
            }
        }

        /// Wait for the next frame the engine sent.
        pub async fn recv_sent(&self) -> String {
            self.from_engine_rx
                .lock()
                .await
                .recv()
                .await
                .expect("engine closed its send side without a frame")
        }

        /// Simulate the server closing the connection.
        pub async fn close(&self) {
            self.to_engine_tx.lock().await.take();
        }
    }
}
