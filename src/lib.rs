//! Best-effort transport for streaming sensor frames (e.g. radar traces) from a mobile sender to
//!  a ground receiver over an unreliable, MTU-limited network path that may traverse NAT and
//!  tunnel middleboxes.
//!
//! ## Design goals
//!
//! * Acquisition runs at a cadence fixed by the instrument and is never blocked by the network
//!   * a bounded relay queue with drop-oldest overflow sits between acquisition and sending
//!   * for live monitoring, the freshest frame is worth more than a backlog of stale ones
//! * Frames are split into datagrams that stay below a configured size, without relying on IP
//!   level fragmentation (which middleboxes tend to drop)
//!   * the size budget is configured since path MTU discovery does not work reliably
//! * Receivers reconstruct frames from datagrams arriving out of order, duplicated, or not at all
//!   * incomplete frames are discarded after a TTL, so sustained loss never leaks memory
//! * Explicitly *not* a reliable transport: there are no acknowledgements, no retransmission,
//!   no cross-frame ordering, no congestion control and no encryption. A lost fragment costs its
//!   frame, which keeps latency low and timing predictable.
//! * START / STOP commands travel on a separate control channel, asynchronously to the data path
//!
//! ## Wire formats
//!
//! Two interchangeable envelopes, selected by configuration (see [codec]):
//!
//! JSON, one object per datagram:
//!
//! ```ascii
//! {"type":<frame kind>,"msg_id":<hex id>,"part":<index>,"total_parts":<count>,"n_samples":<count>,"data":[<float>...],"ts":<millis>}
//! ```
//!
//! Binary, header in network byte order followed by little-endian f32 samples:
//!
//! ```ascii
//!  0: magic "ASCN"
//!  4: message id (u32)
//!  8: part index (u16)
//! 10: part count (u16)
//! 12: send timestamp millis (u64)
//! 20: samples
//! ```
//!
//! Control messages are always JSON and unfragmented:
//!
//! ```ascii
//! {"type":"CTRL","cmd":"START"|"STOP","interval_ms":<millis>,"msg_id":<id>,"ts_ms":<millis>}
//! ```
//!
//! ## Failure handling
//!
//! Nothing that happens to a single datagram or frame terminates a loop: malformed datagrams are
//!  logged and dropped, send and receive errors are logged and retried with exponential backoff,
//!  and only the stop signal ends a session.

pub mod chunker;
pub mod codec;
pub mod config;
pub mod control;
pub mod frame;
pub mod frame_source;
pub mod reassembler;
pub mod relay_queue;
pub mod session;
pub mod socket;
pub mod util;

#[cfg(test)]
pub mod test_util;
