//! # Byte Queue - Bounded FIFO Between Decode Thread and Tick
//!
//! Fixed-capacity byte ring with blocking producer/consumer semantics.
//! Two of these carry the decoded stream: interleaved s16 audio and
//! PTS-prefixed XRGB video records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  write   ┌────────────────┐  read   ┌──────────┐
//! │ Producer │─────────►│ BoundedByteQ   │────────►│ Consumer │
//! │ Thread   │◄─ space ─│ (HeapRb<u8>)   │─ data ─►│ (tick)   │
//! └──────────┘          └────────────────┘         └──────────┘
//! ```
//!
//! Writes and reads of a record happen under one lock acquisition, so a
//! `clear()` from either side can only land between records.

use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;

// ============================================================================
// Errors / Outcomes
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("record of {len} bytes exceeds queue capacity of {capacity} bytes")]
    RecordTooLarge { len: usize, capacity: usize },
}

/// What a blocked writer should do when the queue stays full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Keep waiting for the reader to make room
    Wait,
    /// Drop everything buffered, then write
    Clear,
    /// Give up on this record
    Abandon,
}

/// Result of reserving room for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserve {
    Ready,
    /// The write was abandoned by the backpressure callback
    Abandoned,
    /// The queue is dead or closed; nothing more will be written
    Refused,
}

/// Result of a blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Abandoned,
    Refused,
}

/// Result of waiting for readable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    /// The requested amount is buffered
    Ready,
    /// Closed at end of stream; whatever is left can still be drained
    Drained,
    /// Killed; nothing should be read
    Dead,
}

// ============================================================================
// Queue
// ============================================================================

struct Ring {
    buf: HeapRb<u8>,
    /// End of stream: no more writes, readers drain what is left
    closed: bool,
    /// Shutdown: all blocked calls return immediately
    dead: bool,
}

/// Fixed-capacity byte FIFO shared by exactly one writer and one reader.
pub struct BoundedByteQueue {
    name: &'static str,
    capacity: usize,
    ring: Mutex<Ring>,
    /// Signalled after bytes are consumed or the queue is cleared
    space_cond: Condvar,
    /// Signalled after bytes are written or the queue is closed
    data_cond: Condvar,
}

impl BoundedByteQueue {
    /// Create a queue holding at most `capacity` bytes.
    ///
    /// This is the only allocation the queue ever makes.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            ring: Mutex::new(Ring {
                buf: HeapRb::new(capacity),
                closed: false,
                dead: false,
            }),
            space_cond: Condvar::new(),
            data_cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock the queue for a multi-step operation (reserve + put, wait + take).
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            queue: self,
            ring: self.ring.lock(),
        }
    }

    // ========================================================================
    // Convenience API
    // ========================================================================

    /// Write `data` as one record, blocking while the queue is full.
    pub fn write(&self, data: &[u8]) -> Result<WriteOutcome, QueueError> {
        self.write_parts(&[data], || Backpressure::Wait)
    }

    /// Write several slices as one record. `on_full` is consulted every time
    /// the writer would block.
    pub fn write_parts(
        &self,
        parts: &[&[u8]],
        on_full: impl FnMut() -> Backpressure,
    ) -> Result<WriteOutcome, QueueError> {
        let len = parts.iter().map(|p| p.len()).sum();
        let mut guard = self.lock();
        match guard.reserve(len, on_full)? {
            Reserve::Ready => {
                guard.put(parts);
                Ok(WriteOutcome::Written)
            }
            Reserve::Abandoned => Ok(WriteOutcome::Abandoned),
            Reserve::Refused => Ok(WriteOutcome::Refused),
        }
    }

    /// Fill `buf` completely, blocking until enough bytes are buffered.
    ///
    /// Returns the number of bytes read. Less than `buf.len()` only when the
    /// queue was closed or killed.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut guard = self.lock();
        match guard.wait_readable(buf.len(), || {}) {
            Readable::Dead => 0,
            Readable::Ready | Readable::Drained => guard.take(buf),
        }
    }

    pub fn available_to_read(&self) -> usize {
        self.ring.lock().buf.occupied_len()
    }

    pub fn available_to_write(&self) -> usize {
        let ring = self.ring.lock();
        if ring.dead || ring.closed {
            0
        } else {
            ring.buf.vacant_len()
        }
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drop all buffered bytes and wake a blocked writer.
    pub fn clear(&self) -> usize {
        self.lock().clear()
    }

    /// Mark end of stream. Readers may drain what is left.
    pub fn close(&self) {
        let mut ring = self.ring.lock();
        ring.closed = true;
        self.data_cond.notify_all();
        self.space_cond.notify_all();
    }

    /// Mark the queue dead. Every blocked or future call returns at once.
    pub fn kill(&self) {
        let mut ring = self.ring.lock();
        ring.dead = true;
        self.data_cond.notify_all();
        self.space_cond.notify_all();
        tracing::debug!("{} queue killed", self.name);
    }

    pub fn is_dead(&self) -> bool {
        self.ring.lock().dead
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    /// Force a blocked writer to re-evaluate its backpressure callback.
    ///
    /// Takes the queue lock so the notification cannot slip in between the
    /// writer's check and its wait.
    pub fn wake_writers(&self) {
        let _ring = self.ring.lock();
        self.space_cond.notify_all();
    }
}

// ============================================================================
// Locked View
// ============================================================================

/// Exclusive access to a queue for the duration of one record operation.
pub struct QueueGuard<'a> {
    queue: &'a BoundedByteQueue,
    ring: MutexGuard<'a, Ring>,
}

impl QueueGuard<'_> {
    pub fn available_to_read(&self) -> usize {
        self.ring.buf.occupied_len()
    }

    pub fn available_to_write(&self) -> usize {
        self.ring.buf.vacant_len()
    }

    pub fn is_dead(&self) -> bool {
        self.ring.dead
    }

    pub fn is_closed(&self) -> bool {
        self.ring.closed
    }

    /// Block until `len` bytes of free space exist.
    ///
    /// `on_full` runs under the queue lock each time the writer would sleep,
    /// so it may inspect other shared state but must not touch this queue.
    pub fn reserve(
        &mut self,
        len: usize,
        mut on_full: impl FnMut() -> Backpressure,
    ) -> Result<Reserve, QueueError> {
        if len > self.queue.capacity {
            return Err(QueueError::RecordTooLarge {
                len,
                capacity: self.queue.capacity,
            });
        }

        loop {
            if self.ring.dead || self.ring.closed {
                return Ok(Reserve::Refused);
            }
            if self.ring.buf.vacant_len() >= len {
                return Ok(Reserve::Ready);
            }
            match on_full() {
                Backpressure::Wait => self.queue.space_cond.wait(&mut self.ring),
                Backpressure::Clear => {
                    self.clear();
                }
                Backpressure::Abandon => return Ok(Reserve::Abandoned),
            }
        }
    }

    /// Copy a record into the queue. Call only after `reserve` returned `Ready`.
    pub fn put(&mut self, parts: &[&[u8]]) {
        for part in parts {
            let pushed = self.ring.buf.push_slice(part);
            debug_assert_eq!(pushed, part.len(), "put without reserve");
        }
        self.queue.data_cond.notify_all();
    }

    /// Block until `len` bytes are buffered, the queue is closed, or it dies.
    ///
    /// `on_wait` runs under the queue lock right before each sleep.
    pub fn wait_readable(&mut self, len: usize, mut on_wait: impl FnMut()) -> Readable {
        let len = len.min(self.queue.capacity);
        loop {
            if self.ring.dead {
                return Readable::Dead;
            }
            if self.ring.buf.occupied_len() >= len {
                return Readable::Ready;
            }
            if self.ring.closed {
                return Readable::Drained;
            }
            on_wait();
            self.queue.data_cond.wait(&mut self.ring);
        }
    }

    /// Move up to `buf.len()` bytes out of the queue.
    pub fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = self.ring.buf.pop_slice(buf);
        if n > 0 {
            self.queue.space_cond.notify_all();
        }
        n
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.ring.buf.clear();
        self.queue.space_cond.notify_all();
        dropped
    }
}

// ============================================================================
// Tests
// ============================================================================
