//! Glue that wires the building blocks into running activities. Each activity is its own tokio
//!  task, and all tasks of a session share one stop signal:
//!
//! ```ascii
//! sender:   FrameSource -> acquisition loop -> RelayQueue -> send loop (Chunker, codec) -> socket
//!           control socket -> control receive loop -> ControlChannel -> acquisition loop
//!
//! receiver: socket -> receive loop (codec, Reassembler) -> RelayQueue -> consumer loop -> FrameSink
//! ```
//!
//! The only objects shared between tasks are the relay queues, the control channel and the
//!  statistics counters. The reassembler is owned by the receive loop.

pub mod receiver;
pub mod sender;

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_acquired: AtomicU64,
    pub frames_sent: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub send_failures: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub malformed_datagrams: AtomicU64,
    pub frames_reassembled: AtomicU64,
    pub messages_expired: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub consumer_failures: AtomicU64,
}

impl SessionStats {
    /// increments a counter, returning the new value
    pub(crate) fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
