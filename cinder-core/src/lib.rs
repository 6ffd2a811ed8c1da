//! # Cinder Core
//!
//! Threaded decode-and-sync pipeline for tick-driven media playback.
//! A decode thread fills two bounded byte queues; the host's tick pulls
//! exactly one tick of audio and the video frame due at that time.

// ============================================================================
// Configuration / Description
// ============================================================================
pub mod config;
pub mod media;

// ============================================================================
// Queues and Shared Clock
// ============================================================================
pub mod byte_queue;
pub mod sync;

// ============================================================================
// Decoding
// ============================================================================
pub mod convert;
pub mod overlay;
pub mod source;

// ============================================================================
// Pipeline
// ============================================================================
pub mod consumer;
pub mod input;
pub mod producer;
pub mod session;

pub use config::{ColorSpaceSetting, PlaybackConfig, StallPolicy};
pub use consumer::{FrameRef, PlaybackSink, TickOutcome, VideoOutput};
pub use input::{InputMapper, InputState, PlaybackCommand};
pub use session::{OpenError, PlaybackSession};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
