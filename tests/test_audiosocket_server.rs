// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! AudioSocket server tests over real loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voicebridge::audio::dtmf::KeypadEntry;
use voicebridge::config::{AgentConfig, RealtimeSettings};
use voicebridge::serializers::audiosocket::encode_audio;
use voicebridge::serializers::{AudioSocketMessage, FrameDecoder};
use voicebridge::services::ProviderEvent;
use voicebridge::session::{BridgeContext, SessionMode};
use voicebridge::transports::AudioSocketServer;

use common::{context, within, wait_for, wait_until, FakeConnector, RealtimeCall, SPEECH_BYTE};

async fn start_server(ctx: Arc<BridgeContext>) -> (TcpStream, CancellationToken) {
    let server = AudioSocketServer::bind("127.0.0.1:0".parse().unwrap(), ctx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    (TcpStream::connect(addr).await.unwrap(), shutdown)
}

/// Read frames until the server sends hangup and closes the socket.
async fn read_until_closed(stream: &mut TcpStream) -> Vec<AudioSocketMessage> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let n = within(stream.read(&mut buf)).await.unwrap();
        if n == 0 {
            return frames;
        }
        frames.extend(decoder.decode(&buf[..n]));
    }
}

fn identifier(id: Uuid) -> Vec<u8> {
    AudioSocketMessage::Identifier(id).encode().unwrap()
}

#[tokio::test]
async fn test_fragmented_frames_open_pending_session() {
    let ctx = context(FakeConnector::new());
    let (mut client, _shutdown) = start_server(Arc::clone(&ctx)).await;
    let id = Uuid::new_v4();

    // Identifier, audio and DTMF split at awkward offsets.
    let mut bytes = identifier(id);
    bytes.extend(encode_audio(&[0u8; 320]));
    bytes.extend(AudioSocketMessage::Dtmf(KeypadEntry::Five).encode().unwrap());
    for chunk in [&bytes[..2], &bytes[2..7], &bytes[7..25], &bytes[25..]] {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let session = wait_for(|| ctx.sessions.get(&id.to_string())).await;
    assert_eq!(session.mode(), SessionMode::Pending);
    assert!(!session.is_closed());

    client
        .write_all(&AudioSocketMessage::Hangup.encode().unwrap())
        .await
        .unwrap();
    let frames = read_until_closed(&mut client).await;
    assert_eq!(frames.last(), Some(&AudioSocketMessage::Hangup));
    // Pending calls get no keepalive.
    assert!(!frames
        .iter()
        .any(|f| matches!(f, AudioSocketMessage::Audio(_))));
    wait_until(|| session.is_closed()).await;
    assert!(ctx.sessions.is_empty());
}

#[tokio::test]
async fn test_direct_session_bridges_audio_both_ways() {
    let connector = FakeConnector::new();
    let ctx = context(Arc::clone(&connector));
    let id = Uuid::new_v4();
    let settings = RealtimeSettings {
        greeting: Some("Hello, how can I help?".into()),
        ..Default::default()
    };
    ctx.register(&id.to_string(), AgentConfig::direct("agent-1", settings))
        .unwrap();

    let (mut client, _shutdown) = start_server(Arc::clone(&ctx)).await;
    client.write_all(&identifier(id)).await.unwrap();

    let realtime = connector.realtime(0).await;
    wait_until(|| realtime.spoken() == ["Hello, how can I help?"]).await;
    assert!(ctx.pending.is_empty());

    client.write_all(&encode_audio(&[7u8; 320])).await.unwrap();
    wait_until(|| realtime.calls().contains(&RealtimeCall::Audio(320))).await;

    // The fake answers the greeting with 960 bytes of speech.
    let mut decoder = FrameDecoder::new();
    let mut speech_frames = 0;
    let mut buf = [0u8; 2048];
    while speech_frames < 3 {
        let n = within(client.read(&mut buf)).await.unwrap();
        assert!(n > 0, "server closed early");
        for frame in decoder.decode(&buf[..n]) {
            if let AudioSocketMessage::Audio(pcm) = frame {
                assert_eq!(pcm.len(), 320);
                if pcm.iter().all(|b| *b == SPEECH_BYTE) {
                    speech_frames += 1;
                }
            }
        }
    }

    client
        .write_all(&AudioSocketMessage::Hangup.encode().unwrap())
        .await
        .unwrap();
    let frames = read_until_closed(&mut client).await;
    assert_eq!(frames.last(), Some(&AudioSocketMessage::Hangup));
    wait_until(|| realtime.is_closed()).await;
    assert!(ctx.sessions.is_empty());
}

#[tokio::test]
async fn test_registered_call_sends_keepalive_over_socket() {
    let connector = FakeConnector::new();
    let ctx = context(Arc::clone(&connector));
    let id = Uuid::new_v4();
    ctx.register(
        &id.to_string(),
        AgentConfig::direct("agent-1", RealtimeSettings::default()),
    )
    .unwrap();

    let (mut client, _shutdown) = start_server(Arc::clone(&ctx)).await;
    let started = tokio::time::Instant::now();
    client.write_all(&identifier(id)).await.unwrap();

    let mut decoder = FrameDecoder::new();
    let mut silent = 0;
    let mut buf = [0u8; 2048];
    while silent < 3 {
        let n = within(client.read(&mut buf)).await.unwrap();
        assert!(n > 0, "server closed early");
        for frame in decoder.decode(&buf[..n]) {
            match frame {
                AudioSocketMessage::Audio(pcm) => {
                    assert_eq!(pcm, vec![0u8; 320]);
                    silent += 1;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }
    // One frame at once, then one every 100 ms.
    assert!(started.elapsed() >= Duration::from_millis(150));

    client
        .write_all(&AudioSocketMessage::Hangup.encode().unwrap())
        .await
        .unwrap();
    let frames = read_until_closed(&mut client).await;
    assert_eq!(frames.last(), Some(&AudioSocketMessage::Hangup));
    assert_eq!(connector.connected(), 1);
}

#[tokio::test]
async fn test_end_call_tool_hangs_up_after_goodbye() {
    let connector = FakeConnector::new();
    let ctx = context(Arc::clone(&connector));
    let id = Uuid::new_v4();
    ctx.register(
        &id.to_string(),
        AgentConfig::direct("agent-1", RealtimeSettings::default()),
    )
    .unwrap();

    let (mut client, _shutdown) = start_server(Arc::clone(&ctx)).await;
    client.write_all(&identifier(id)).await.unwrap();
    let realtime = connector.realtime(0).await;

    realtime.emit(ProviderEvent::FunctionCall {
        call_id: "call-1".into(),
        name: "end_call".into(),
        arguments: "{}".into(),
    });
    realtime.emit(ProviderEvent::Audio(vec![SPEECH_BYTE; 960]));
    realtime.emit(ProviderEvent::ResponseDone);

    let frames = read_until_closed(&mut client).await;
    assert_eq!(frames.last(), Some(&AudioSocketMessage::Hangup));
    let goodbye = frames
        .iter()
        .filter(|f| matches!(f, AudioSocketMessage::Audio(pcm) if pcm.iter().all(|b| *b == SPEECH_BYTE)))
        .count();
    assert_eq!(goodbye, 3);
    assert!(realtime.calls().contains(&RealtimeCall::FunctionResult {
        call_id: "call-1".into(),
        output: r#"{"ok":true}"#.into(),
    }));
}

#[tokio::test]
async fn test_unknown_tool_gets_error_output() {
    let connector = FakeConnector::new();
    let ctx = context(Arc::clone(&connector));
    let id = Uuid::new_v4();
    ctx.register(
        &id.to_string(),
        AgentConfig::direct("agent-1", RealtimeSettings::default()),
    )
    .unwrap();

    let (mut client, _shutdown) = start_server(Arc::clone(&ctx)).await;
    client.write_all(&identifier(id)).await.unwrap();
    let realtime = connector.realtime(0).await;
    realtime.emit(ProviderEvent::FunctionCall {
        call_id: "call-9".into(),
        name: "lookup_order".into(),
        arguments: "{}".into(),
    });

    wait_until(|| {
        realtime.calls().iter().any(|c| {
            matches!(c, RealtimeCall::FunctionResult { call_id, output }
                if call_id == "call-9" && output.contains("unknown tool"))
        })
    })
    .await;
    assert!(!ctx.sessions.is_empty());
}

#[tokio::test]
async fn test_shutdown_hangs_up_live_connections() {
    let ctx = context(FakeConnector::new());
    let (mut client, shutdown) = start_server(Arc::clone(&ctx)).await;
    let id = Uuid::new_v4();
    client.write_all(&identifier(id)).await.unwrap();
    wait_for(|| ctx.sessions.get(&id.to_string())).await;

    shutdown.cancel();
    let frames = read_until_closed(&mut client).await;
    assert_eq!(frames, vec![AudioSocketMessage::Hangup]);
    wait_until(|| ctx.sessions.is_empty()).await;
}
