//! WebSocket transport: one text frame per update.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use mirror_core::Update;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportError, TransportKind};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket transport: one text frame per update.
///
/// Inbound frames are read and discarded; the reader only notices when the
/// peer goes away.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: CancellationToken,
}

impl WsTransport {
    pub fn connect(socket: WebSocket) -> Self {
        let (sink, mut stream) = socket.split();
        let closed = CancellationToken::new();

        let token = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("websocket read failed: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
            token.cancel();
        });

        Self {
            sink: Mutex::new(sink),
            closed,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&self, update: &Update, timeout: Duration) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let text = update.encode()?;
        let write = async { self.sink.lock().await.send(Message::Text(text)).await };
        match tokio::time::timeout(timeout, write).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn wait(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Ok(mut sink) = tokio::time::timeout(CLOSE_TIMEOUT, self.sink.lock()).await {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
    }
}
