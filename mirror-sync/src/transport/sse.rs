//! Event-stream transport: one `text/event-stream` event per update, id = version.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::VARY;
use axum::http::HeaderValue;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use mirror_core::Update;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportError, TransportKind};

/// Event-stream transport: one `data:` event per update, with the version
/// as the event id.
///
/// Updates go through a one-slot channel into the response body, so a send
/// completes only once the body has taken the previous event.
pub struct SseTransport {
    tx: mpsc::Sender<Event>,
    closed: CancellationToken,
}

impl SseTransport {
    /// Create the transport and the streaming response that carries it.
    pub fn connect() -> (Self, Response) {
        let (tx, rx) = mpsc::channel(1);
        let closed = CancellationToken::new();

        let stream = ReceiverStream::new(rx)
            .map(Ok::<Event, Infallible>)
            .take_until(closed.clone().cancelled_owned());
        let mut response = Sse::new(stream).into_response();
        response.headers_mut().insert(VARY, HeaderValue::from_static("Accept"));

        (Self { tx, closed }, response)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn send(&self, update: &Update, timeout: Duration) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut event = Event::default().data(update.encode()?);
        if update.version > 0 {
            event = event.id(update.version.to_string());
        }
        match tokio::time::timeout(timeout, self.tx.send(event)).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn wait(&self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = self.closed.cancelled() => {}
        }
        self.closed.cancel();
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
