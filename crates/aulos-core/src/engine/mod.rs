//! Playback engine - ring buffers, mixing, fill thread, position, control
//!
//! This module contains the real-time core of the player:
//! - RingBuffer: lock-free SPSC sample queues bridging fill and callback
//! - PlayRangeList: the spans of the timeline "playing" covers
//! - ModelMixer: sums the active source set over a frame span
//! - BufferFillEngine: background worker keeping the ring buffers topped up
//! - Position estimation: reconstructs the audible frame from counters
//! - PlaybackController / DeviceFeed: the control and callback facades

mod command;
mod controller;
mod fill;
mod mixer;
mod position;
mod range;
mod ring_buffer;

pub use controller::*;
pub use mixer::{MixScope, ModelMixer};
pub use position::{estimate_frame, EstimatorParams, TransportClock};
pub use range::{PlayRange, PlayRangeList};
pub use ring_buffer::RingBuffer;
