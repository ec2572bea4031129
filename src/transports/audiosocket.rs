// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! AudioSocket TCP server.
//!
//! Each accepted connection gets a reader loop, which decodes frames and
//! drives its [`CallSession`], and one writer task, which is the only thing
//! that ever writes to the socket. Everything bound for the channel driver
//! (paced audio, keepalive silence, the final hangup) goes through the
//! writer's queue in order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::serializers::audiosocket::{AudioSocketMessage, FrameDecoder};
use crate::session::{BridgeContext, CallSession};

const READ_BUFFER_SIZE: usize = 4096;

/// Accepts AudioSocket connections until shut down.
pub struct AudioSocketServer {
    listener: TcpListener,
    ctx: Arc<BridgeContext>,
}

impl std::fmt::Debug for AudioSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSocketServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

impl AudioSocketServer {
    pub async fn bind(addr: SocketAddr, ctx: Arc<BridgeContext>) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("AudioSocket: listening on {}", listener.local_addr()?);
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until `shutdown` fires. Live connections are
    /// cancelled along with it.
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("AudioSocket: server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&self.ctx);
                        let cancel = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx, cancel).await {
                                tracing::warn!("AudioSocket: connection {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("AudioSocket: accept error: {}", e);
                    }
                },
            }
        }
    }
}

async fn run_writer(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("AudioSocket: write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Serve one AudioSocket connection until hangup, EOF, session close or
/// shutdown.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<BridgeContext>,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    tracing::debug!("AudioSocket: connection from {}", peer);
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let (out, frames) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(run_writer(writer, frames));

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut session: Option<Arc<CallSession>> = None;
    // Replaced by the session's own token once it exists.
    let mut session_closed = CancellationToken::new();

    let result = 'conn: loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break 'conn Ok("server shutdown"),
            _ = session_closed.cancelled() => break 'conn Ok("session closed"),
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break 'conn Ok("transport EOF"),
            Ok(n) => n,
            Err(e) => break 'conn Err(BridgeError::from(e)),
        };

        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame() {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("AudioSocket: {}: discarding frame: {}", peer, e);
                    continue;
                }
            };
            match frame {
                AudioSocketMessage::Identifier(id) => {
                    if let Some(existing) = &session {
                        tracing::warn!(session_id = %existing.id(), "AudioSocket: repeated identifier frame ignored");
                        continue;
                    }
                    match CallSession::open(Arc::clone(&ctx), id, out.clone()) {
                        Ok(opened) => {
                            session_closed = opened.cancellation();
                            session = Some(opened);
                        }
                        Err(e) => break 'conn Err(e),
                    }
                }
                AudioSocketMessage::Audio(slin) => match &session {
                    Some(session) => session.handle_audio(&slin).await,
                    None => tracing::trace!("AudioSocket: audio before identifier dropped"),
                },
                AudioSocketMessage::Dtmf(key) => match &session {
                    Some(session) => session.handle_dtmf(key),
                    None => tracing::debug!("AudioSocket: DTMF before identifier dropped"),
                },
                AudioSocketMessage::Hangup => break 'conn Ok("caller hangup"),
                AudioSocketMessage::Error(cause) => {
                    tracing::warn!("AudioSocket: {}: channel reported error {:?}", peer, cause);
                    break 'conn Ok("channel error");
                }
            }
        }
    };

    let reason = match &result {
        Ok(reason) => (*reason).to_string(),
        Err(e) => e.to_string(),
    };
    match session.take() {
        Some(session) => session.close(&reason).await,
        None => {
            if let Ok(frame) = AudioSocketMessage::Hangup.encode() {
                let _ = out.send(frame);
            }
        }
    }
    drop(out);
    let _ = writer_task.await;
    tracing::debug!("AudioSocket: connection from {} closed ({})", peer, reason);
    result.map(|_| ())
}
