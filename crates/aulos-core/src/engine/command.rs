//! Lock-free queues crossing the device callback boundary
//!
//! Two SPSC ring buffers connect the fill thread and the device callback:
//! commands flow in (buffer set adoption, stretcher and effect
//! installation), and everything the callback relinquishes flows back out
//! on the retirement queue, so no deallocation ever happens on the
//! real-time thread. Control-thread requests are staged in the engine
//! state and forwarded by the fill thread, keeping each queue strictly
//! single-producer.

use std::sync::Arc;

use crate::effect::AuditioningEffect;
use crate::timestretch::TimeStretchEngine;

use super::ring_buffer::RingBuffer;

/// Queue depth for both callback queues; drained every fill cycle
const QUEUE_CAPACITY: usize = 64;

/// Commands delivered to the device callback at block boundaries
///
/// Large payloads are boxed so the enum stays small for cache-efficient
/// lock-free queueing.
pub enum FeedCommand {
    /// Republish the fill thread's write buffers as the read set (unify)
    AdoptBuffers(Vec<Arc<RingBuffer>>),
    /// Install (or remove, with None) the time stretcher
    SetStretcher(Option<Box<TimeStretchEngine>>),
    /// Discard stretcher history after a seek
    ResetStretcher,
    /// Install (or remove, with None) the auditioning effect
    SetEffect(Option<Box<dyn AuditioningEffect>>),
}

/// Objects the callback no longer references, awaiting reclamation on the
/// fill thread
pub enum Retired {
    Buffers(Vec<Arc<RingBuffer>>),
    Stretcher(Box<TimeStretchEngine>),
    Effect(Box<dyn AuditioningEffect>),
}

/// Create the fill -> callback command queue
pub fn feed_channel() -> (rtrb::Producer<FeedCommand>, rtrb::Consumer<FeedCommand>) {
    rtrb::RingBuffer::new(QUEUE_CAPACITY)
}

/// Create the callback -> fill retirement queue
pub fn retire_channel() -> (rtrb::Producer<Retired>, rtrb::Consumer<Retired>) {
    rtrb::RingBuffer::new(QUEUE_CAPACITY)
}
