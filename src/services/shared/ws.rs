// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! WebSocket plumbing shared by every provider session.
//!
//! [`WsConnection::connect`] bounds the handshake by a timeout, then splits
//! the socket into a writer task (outbound queue plus ping keepalive) and a
//! reader task (inbound text/binary forwarded on a channel). A missing pong
//! within the pong window force-closes the socket, and the reader reports
//! the close as [`WsIncoming::Closed`] so the owner can treat it as a
//! provider disconnect.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::services::{ProviderEvent, ProviderEvents, ServiceError};

/// Handshake deadline in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Ping cadence and pong deadline.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Inbound traffic surfaced to the provider client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsIncoming {
    Text(String),
    Binary(Vec<u8>),
    /// The socket is gone; no further messages follow.
    Closed(String),
}

/// Sending half of a provider WebSocket.
///
/// Cloning shares the same connection. [`close`](Self::close) is idempotent.
#[derive(Clone)]
pub struct WsConnection {
    label: &'static str,
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WsConnection {
    /// Open `url` with extra request `headers`.
    pub async fn connect(
        label: &'static str,
        url: &str,
        headers: &[(&'static str, String)],
        keepalive: Keepalive,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WsIncoming>), ServiceError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ServiceError::Connection(format!("invalid WebSocket request: {e}")))?;
        for (name, value) in headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ServiceError::Connection(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ServiceError::Connection(format!("invalid {name} header: {e}")))?;
            request.headers_mut().insert(header, value);
        }

        tracing::debug!("{}: connecting", label);
        let ws_stream = match tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                return Err(ServiceError::Connection(format!(
                    "{label}: WebSocket connection failed: {e}"
                )));
            }
            Err(_) => return Err(ServiceError::Timeout(CONNECT_TIMEOUT_SECS)),
        };
        tracing::debug!("{}: WebSocket connection established", label);

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        // Writer: outbound queue, periodic ping, pong deadline.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ping = tokio::time::interval_at(
                Instant::now() + keepalive.interval,
                keepalive.interval,
            );
            let mut pong_deadline: Option<Instant> = None;
            loop {
                let deadline = pong_deadline;
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = sink.send(msg).await {
                            tracing::warn!("{}: WebSocket send failed: {}", label, e);
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if pong_deadline.is_none() {
                            pong_deadline = Some(Instant::now() + keepalive.pong_timeout);
                        }
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            tracing::warn!("{}: ping failed: {}", label, e);
                            break;
                        }
                    }
                    Some(()) = pong_rx.recv() => {
                        pong_deadline = None;
                    }
                    _ = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        tracing::warn!("{}: no pong within {:?}, forcing disconnect", label, keepalive.pong_timeout);
                        break;
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            writer_cancel.cancel();
        });

        // Reader: forward payloads until the socket or the token ends.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break "connection closed".to_string(),
                    msg = stream.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = in_tx.send(WsIncoming::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = in_tx.send(WsIncoming::Binary(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        let _ = pong_tx.send(());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                }
            };
            tracing::debug!("{}: reader loop ended ({})", label, reason);
            reader_cancel.cancel();
            let _ = in_tx.send(WsIncoming::Closed(reason));
        });

        Ok((
            Self {
                label,
                outbound: out_tx,
                closed,
                cancel,
            },
            in_rx,
        ))
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Whether [`close`](Self::close) was called locally.
    pub fn closed_locally(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send(&self, msg: Message) -> Result<(), ServiceError> {
        if !self.is_open() {
            return Err(ServiceError::Disconnected(format!(
                "{}: connection closed",
                self.label
            )));
        }
        self.outbound
            .send(msg)
            .map_err(|_| ServiceError::Disconnected(format!("{}: writer gone", self.label)))
    }

    pub fn send_text(&self, text: String) -> Result<(), ServiceError> {
        self.send(Message::Text(text))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> Result<(), ServiceError> {
        self.send_text(value.to_string())
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), ServiceError> {
        self.send(Message::Binary(data))
    }

    /// Queue a final text message and close. Repeat calls do nothing.
    pub fn close_with(&self, last: Option<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(last) = last {
            let _ = self.outbound.send(Message::Text(last));
        }
        let _ = self.outbound.send(Message::Close(None));
        tracing::debug!("{}: closing", self.label);
        // Let the writer flush what is queued before cancelling.
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            cancel.cancel();
        });
    }

    pub fn close(&self) {
        self.close_with(None);
    }
}

/// Translate raw socket traffic into provider events on a dedicated task.
///
/// `parse` maps each text or binary message to zero or more events. When the
/// socket ends without a local [`WsConnection::close`], a
/// [`ProviderEvent::Disconnected`] is emitted last.
pub fn spawn_event_pump<F>(
    conn: WsConnection,
    mut incoming: mpsc::UnboundedReceiver<WsIncoming>,
    mut parse: F,
) -> ProviderEvents
where
    F: FnMut(WsIncoming) -> Vec<ProviderEvent> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(msg) = incoming.recv().await {
            if let WsIncoming::Closed(reason) = msg {
                if !conn.closed_locally() {
                    tracing::error!("{}: provider disconnected: {}", conn.label, reason);
                    let _ = tx.send(ProviderEvent::Disconnected { reason });
                }
                break;
            }
            for event in parse(msg) {
                if tx.send(event).is_err() {
                    conn.close();
                    return;
                }
            }
        }
    });
    rx
}
