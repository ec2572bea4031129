// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Playback pacing, keepalive and barge-in under a paused clock.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voicebridge::serializers::{AudioSocketMessage, FrameDecoder};
use voicebridge::session::playback::{FRAME_BYTES, FRAME_INTERVAL};
use voicebridge::session::Playback;

const SPEECH: u8 = 0x22;

fn payload(frame: &[u8]) -> Vec<u8> {
    match FrameDecoder::new().decode(frame).pop() {
        Some(AudioSocketMessage::Audio(pcm)) => pcm,
        other => panic!("expected one audio frame, got {other:?}"),
    }
}

fn is_speech(frame: &[u8]) -> bool {
    payload(frame).iter().all(|b| *b == SPEECH)
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_while_idle() {
    let (out, mut frames) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let _playback = Playback::spawn(out, cancel.clone());

    tokio::time::sleep(Duration::from_millis(250)).await;
    let mut silent = 0;
    while let Ok(frame) = frames.try_recv() {
        assert_eq!(payload(&frame), vec![0u8; FRAME_BYTES]);
        silent += 1;
    }
    assert!(silent >= 2, "only {silent} keepalive frames in 250ms");

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(500)).await;
    while frames.try_recv().is_ok() {}
    assert!(frames.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_frames_are_paced_at_twenty_ms() {
    let (out, mut frames) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let playback = Playback::spawn(out, cancel.clone());
    // Let the startup keepalive go out first.
    let first = frames.recv().await.unwrap();
    assert!(!is_speech(&first));

    playback.enqueue(&[SPEECH; FRAME_BYTES * 6]);
    let mut stamps = Vec::new();
    while stamps.len() < 6 {
        let frame = frames.recv().await.unwrap();
        if is_speech(&frame) {
            stamps.push(Instant::now());
        }
    }
    for pair in stamps.windows(2) {
        assert_eq!(pair[1] - pair[0], FRAME_INTERVAL);
    }
    playback.wait_drained().await;
    assert!(!playback.is_playing());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_short_clip_waits_for_flush() {
    let (out, mut frames) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let playback = Playback::spawn(out, cancel.clone());

    playback.enqueue(&[SPEECH; 500]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(frame) = frames.try_recv() {
        assert!(!is_speech(&frame));
    }
    assert_eq!(playback.queued_bytes(), 500);

    playback.flush();
    let mut sizes = Vec::new();
    while sizes.len() < 2 {
        let frame = frames.recv().await.unwrap();
        let pcm = payload(&frame);
        if pcm.iter().all(|b| *b == SPEECH) {
            sizes.push(pcm.len());
        }
    }
    assert_eq!(sizes, vec![FRAME_BYTES, 500 - FRAME_BYTES]);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_stops_audio_immediately() {
    let (out, mut frames) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let playback = Playback::spawn(out, cancel.clone());

    playback.enqueue(&[SPEECH; FRAME_BYTES * 10]);
    let mut played = 0;
    while played < 2 {
        if is_speech(&frames.recv().await.unwrap()) {
            played += 1;
        }
    }

    playback.clear();
    assert_eq!(playback.queued_bytes(), 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut after = 0;
    while let Ok(frame) = frames.try_recv() {
        assert!(!is_speech(&frame), "speech written after barge-in");
        after += 1;
    }
    // Keepalive resumes once playback stops.
    assert!(after >= 2);
    cancel.cancel();
}
