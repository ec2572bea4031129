// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Paced playback towards the channel driver.
//!
//! One driver task per call owns every audio write. It ticks every 20 ms:
//! once at least 60 ms of audio is queued it sends one 20 ms frame per tick
//! until the queue runs dry, flushes whatever partial frame is left, and goes
//! back to idle. While idle it writes a 20 ms silence frame every 100 ms so
//! the channel driver's inactivity timer never fires.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::serializers::audiosocket::encode_audio;

/// 20 ms of 8 kHz slin.
pub const FRAME_BYTES: usize = 320;
/// Playback starts once this much audio (60 ms) is buffered.
pub const START_THRESHOLD_BYTES: usize = FRAME_BYTES * 3;
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Encoded frames for the connection's writer task.
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Default)]
struct Queue {
    bytes: VecDeque<u8>,
    playing: bool,
    /// Start on the next tick even below the threshold.
    flush: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    drained: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a call's playback queue. Cheap to clone.
#[derive(Clone)]
pub struct Playback {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Playback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.shared.lock();
        f.debug_struct("Playback")
            .field("queued", &q.bytes.len())
            .field("playing", &q.playing)
            .finish()
    }
}

impl Playback {
    /// Create a queue without a driver. Audio accumulates but nothing is
    /// written until [`spawn_driver`](Self::spawn_driver) runs.
    pub fn new() -> Self {
        let (drained, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                drained,
            }),
        }
    }

    /// Create a queue and start its driver, which stops when `cancel` fires.
    pub fn spawn(out: FrameSender, cancel: CancellationToken) -> Self {
        let playback = Self::new();
        playback.spawn_driver(out, cancel);
        playback
    }

    pub fn spawn_driver(&self, out: FrameSender, cancel: CancellationToken) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_driver(shared, out, cancel));
    }

    /// Append 8 kHz slin for playback.
    pub fn enqueue(&self, slin: &[u8]) {
        if slin.is_empty() {
            return;
        }
        self.shared.lock().bytes.extend(slin);
        self.shared.drained.send_replace(false);
    }

    /// Start playing whatever is queued without waiting for the threshold.
    pub fn flush(&self) {
        let mut q = self.shared.lock();
        if !q.bytes.is_empty() {
            q.flush = true;
        }
    }

    /// Drop everything queued and stop playing (barge-in).
    pub fn clear(&self) {
        let dropped = {
            let mut q = self.shared.lock();
            let dropped = q.bytes.len();
            q.bytes.clear();
            q.playing = false;
            q.flush = false;
            dropped
        };
        self.shared.drained.send_replace(true);
        if dropped > 0 {
            tracing::debug!(dropped, "playback: cleared");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().playing
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.lock().bytes.len()
    }

    /// Resolve once nothing is queued or playing.
    pub async fn wait_drained(&self) {
        let mut rx = self.shared.drained.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

impl Default for Playback {
    fn default() -> Self {
        Self::new()
    }
}

/// What one tick writes.
#[derive(Debug, PartialEq, Eq)]
enum Tick {
    Audio(Vec<u8>),
    /// Underflow: the last partial frame, after which playback stops.
    Tail(Vec<u8>),
    Idle,
}

fn next_tick(q: &mut Queue) -> Tick {
    if !q.playing && (q.bytes.len() >= START_THRESHOLD_BYTES || (q.flush && !q.bytes.is_empty())) {
        q.playing = true;
        q.flush = false;
    }
    if !q.playing {
        return Tick::Idle;
    }
    if q.bytes.len() >= FRAME_BYTES {
        return Tick::Audio(q.bytes.drain(..FRAME_BYTES).collect());
    }
    q.playing = false;
    Tick::Tail(q.bytes.drain(..).collect())
}

async fn run_driver(shared: Arc<Shared>, out: FrameSender, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let silence = encode_audio(&[0u8; FRAME_BYTES]);
    let mut last_write: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick = next_tick(&mut shared.lock());
        let now = Instant::now();
        let frame = match tick {
            Tick::Audio(chunk) => encode_audio(&chunk),
            Tick::Tail(rest) => {
                shared.drained.send_replace(true);
                if rest.is_empty() {
                    continue;
                }
                tracing::trace!(bytes = rest.len(), "playback: underflow, flushing tail");
                encode_audio(&rest)
            }
            Tick::Idle => {
                if last_write.is_some_and(|t| now.duration_since(t) < KEEPALIVE_INTERVAL) {
                    continue;
                }
                silence.clone()
            }
        };
        last_write = Some(now);
        if out.send(frame).is_err() {
            tracing::debug!("playback: transport writer gone, stopping");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(bytes: usize) -> Queue {
        Queue {
            bytes: std::iter::repeat(1u8).take(bytes).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_waits_for_threshold() {
        let mut q = queue(START_THRESHOLD_BYTES - 2);
        assert_eq!(next_tick(&mut q), Tick::Idle);
        q.bytes.extend([1u8, 1u8]);
        assert!(matches!(next_tick(&mut q), Tick::Audio(c) if c.len() == FRAME_BYTES));
        assert!(q.playing);
    }

    #[test]
    fn test_underflow_flushes_tail_and_stops() {
        let mut q = queue(START_THRESHOLD_BYTES + 100);
        for _ in 0..3 {
            assert!(matches!(next_tick(&mut q), Tick::Audio(_)));
        }
        assert!(matches!(next_tick(&mut q), Tick::Tail(t) if t.len() == 100));
        assert!(!q.playing);
        assert_eq!(next_tick(&mut q), Tick::Idle);
    }

    #[test]
    fn test_flush_starts_short_clip() {
        let mut q = queue(100);
        q.flush = true;
        assert!(matches!(next_tick(&mut q), Tick::Tail(t) if t.len() == 100));
    }

    #[tokio::test]
    async fn test_clear_is_synchronous() {
        let playback = Playback::new();
        playback.enqueue(&[5u8; 4000]);
        assert_eq!(playback.queued_bytes(), 4000);
        playback.clear();
        assert_eq!(playback.queued_bytes(), 0);
        assert!(!playback.is_playing());
        playback.wait_drained().await;
    }
}
