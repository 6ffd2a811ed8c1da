//! Playback Clock and Seek Handshake
//!
//! The tick thread is the master clock: it counts ticks and audio frames
//! and derives the bias between decoded timestamps and its own timeline.
//! The decode thread publishes the timestamp of the last thing it queued.
//! Both sides meet in [`Coordination`], guarded by one mutex.
//!
//! Lock order: a queue lock may be held while taking the coordination lock,
//! never the other way round.

use crate::byte_queue::BoundedByteQueue;
use crate::config::ColorSpaceSetting;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::time::{Duration, Instant};

// ============================================================================
// Shared State
// ============================================================================

/// Timeline shared between the tick thread and the decode thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    /// Ticks presented since open (or since the last seek target)
    pub frame_count: u64,
    /// Audio frames handed to the host
    pub audio_frames: u64,
    /// Decoded timeline minus tick timeline, in seconds
    pub pts_bias: f64,
    pub decode_last_video_time: f64,
    pub decode_last_audio_time: f64,
    /// Slot in the descriptor's audio track list
    pub audio_track: usize,
    /// Slot in the descriptor's subtitle track list
    pub subtitle_track: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeekRequest {
    pub pending: bool,
    pub target_seconds: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub video_frames: u64,
    pub audio_blocks: u64,
    pub subtitle_events: u64,
    pub decode_errors: u64,
    pub seeks: u64,
    /// Times a full queue was dropped because the tick thread was parked
    pub stalls: u64,
}

#[derive(Debug, Default)]
pub struct Coordination {
    pub sync: SyncState,
    pub seek: SeekRequest,
    /// The tick thread is blocked on a queue or a seek
    pub consumer_parked: bool,
    /// The decode thread has stopped or must stop
    pub terminated: bool,
    pub color_space: ColorSpaceSetting,
    pub stats: PipelineStats,
}

/// Everything both threads touch.
pub struct PipelineShared {
    state: Mutex<Coordination>,
    seek_cond: Condvar,
    pub audio: BoundedByteQueue,
    pub video: BoundedByteQueue,
}

impl PipelineShared {
    pub fn new(audio_capacity: usize, video_capacity: usize, sync: SyncState) -> Self {
        Self {
            state: Mutex::new(Coordination {
                sync,
                ..Default::default()
            }),
            seek_cond: Condvar::new(),
            audio: BoundedByteQueue::new("audio", audio_capacity),
            video: BoundedByteQueue::new("video", video_capacity),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Coordination> {
        self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn set_consumer_parked(&self, parked: bool) {
        self.state.lock().consumer_parked = parked;
    }

    /// Park the tick thread while it waits on a queue, and kick a writer
    /// blocked on `other` so it can notice.
    ///
    /// Safe to call while holding the lock of the queue being waited on.
    pub fn park_consumer(&self, other: &BoundedByteQueue) {
        self.set_consumer_parked(true);
        other.wake_writers();
    }

    // ========================================================================
    // Seek
    // ========================================================================

    /// Ask the decode thread to seek and block until it has.
    ///
    /// Returns `false` without waiting when the decode thread is gone.
    pub fn request_seek(&self, target_seconds: f64) -> bool {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return false;
            }
            state.seek = SeekRequest {
                pending: true,
                target_seconds,
            };
            state.consumer_parked = true;
        }

        // A writer blocked on a full queue re-checks and abandons its record.
        self.audio.wake_writers();
        self.video.wake_writers();

        let mut state = self.state.lock();
        while state.seek.pending && !state.terminated {
            self.seek_cond.wait(&mut state);
        }
        state.consumer_parked = false;
        !state.terminated
    }

    /// Pending seek target, if any.
    pub fn pending_seek(&self) -> Option<f64> {
        let state = self.state.lock();
        state.seek.pending.then_some(state.seek.target_seconds)
    }

    /// Decode thread: the seek landed at `target_seconds`. Drops everything
    /// queued before it.
    pub fn complete_seek(&self, target_seconds: f64) {
        self.audio.clear();
        self.video.clear();

        let mut state = self.state.lock();
        state.sync.decode_last_video_time = target_seconds;
        state.sync.decode_last_audio_time = target_seconds;
        state.seek.pending = false;
        state.stats.seeks += 1;
        self.seek_cond.notify_all();
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the decode thread and release a tick thread waiting on a seek.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        self.seek_cond.notify_all();
    }

    /// End of stream: no more data will be queued, readers drain the rest.
    pub fn finish(&self) {
        self.terminate();
        self.audio.close();
        self.video.close();
    }

    /// Release every blocked call on both queues.
    pub fn kill(&self) {
        self.terminate();
        self.audio.kill();
        self.video.kill();
    }
}

// ============================================================================
// Tick Pacing
// ============================================================================

/// Sleeps out the remainder of each tick when driving playback in real time.
pub struct TickPacer {
    target: Duration,
    last: Instant,
    count: u64,
    start: Instant,
}

impl TickPacer {
    pub fn new(rate: f64) -> Self {
        let target = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::from_millis(16)
        };
        let now = Instant::now();
        Self {
            target,
            last: now,
            count: 0,
            start: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.target
    }

    pub fn wait(&mut self) {
        let elapsed = self.last.elapsed();
        if elapsed < self.target {
            std::thread::sleep(self.target - elapsed);
        }
        self.last = Instant::now();
        self.count += 1;
    }

    /// Ticks per second actually achieved.
    pub fn measured_rate(&self) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.count as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_seek_handshake_updates_decode_times() {
        let shared = Arc::new(PipelineShared::new(64, 64, SyncState::default()));
        shared.audio.write(&[1; 16]).unwrap();

        let decoder = {
            let shared = shared.clone();
            thread::spawn(move || loop {
                if let Some(target) = shared.pending_seek() {
                    shared.complete_seek(target);
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        assert!(shared.request_seek(12.5));
        decoder.join().unwrap();

        let state = shared.lock();
        assert!(!state.seek.pending);
        assert!(!state.consumer_parked);
        assert_eq!(state.sync.decode_last_audio_time, 12.5);
        assert_eq!(state.sync.decode_last_video_time, 12.5);
        assert_eq!(state.stats.seeks, 1);
        drop(state);
        assert_eq!(shared.audio.available_to_read(), 0);
    }

    #[test]
    fn test_seek_after_termination_returns_immediately() {
        let shared = PipelineShared::new(8, 8, SyncState::default());
        shared.terminate();
        assert!(!shared.request_seek(3.0));
        assert!(shared.pending_seek().is_none());
    }

    #[test]
    fn test_terminate_releases_waiting_seek() {
        let shared = Arc::new(PipelineShared::new(8, 8, SyncState::default()));
        let waiter = {
            let shared = shared.clone();
            thread::spawn(move || shared.request_seek(1.0))
        };
        thread::sleep(Duration::from_millis(20));
        shared.terminate();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_finish_closes_queues() {
        let shared = PipelineShared::new(8, 8, SyncState::default());
        shared.finish();
        assert!(shared.is_terminated());
        assert!(shared.audio.is_closed());
        assert!(shared.video.is_closed());
        assert!(!shared.video.is_dead());
    }

    #[test]
    fn test_pacer_interval() {
        let pacer = TickPacer::new(50.0);
        assert_eq!(pacer.interval().as_millis(), 20);
        assert_eq!(TickPacer::new(0.0).interval(), Duration::from_millis(16));
    }
}
