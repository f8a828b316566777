use std::time::Duration;
use anyhow::bail;
use crate::codec::binary::BinaryCodec;

/// Selects the wire representation of fragments. Both sides of a link must agree on this, there
///  is no negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    /// self-describing JSON envelope, one object per datagram
    Json,
    /// fixed 20 byte header followed by raw little-endian f32 samples
    Binary,
}

/// What to do with a reassembled frame whose sample count differs from the count declared in
///  its envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthMismatchPolicy {
    /// deliver the frame, but mark it as length-mismatched
    Flag,
    /// drop the frame
    Discard,
}

pub struct LinkConfig {
    /// Upper bound for the serialized size of a single datagram, envelope included. This must
    ///  stay below the path MTU of *all* hops between sender and receiver, including tunnels and
    ///  NAT middleboxes that add their own headers. There is no MTU discovery, so this is the
    ///  application's responsibility.
    ///
    /// The default of 1100 bytes leaves generous headroom below a 1500 byte Ethernet MTU.
    ///
    /// NB: A single sample whose envelope does not fit is still sent as an oversized datagram
    pub max_datagram_bytes: usize,

    pub codec: CodecKind,

    /// The `type` tag written into JSON envelopes
    pub frame_kind: String,
    /// JSON envelopes with a `type` not in this list are ignored silently
    pub accepted_frame_kinds: Vec<String>,

    /// Capacity of the queue between acquisition and the network send loop. On overflow, the
    ///  oldest frame is evicted.
    pub relay_queue_capacity: usize,
    /// Capacity of the queue between the receive loop and the downstream consumer
    pub consumer_queue_capacity: usize,

    /// Incomplete messages are discarded if no fragment arrived for them for this long
    pub reassembly_ttl: Duration,
    /// Expired messages are swept at least this often...
    pub gc_sweep_interval: Duration,
    /// ... and additionally after this many fragments
    pub gc_sweep_every_n_fragments: usize,
    pub length_mismatch_policy: LengthMismatchPolicy,
    /// Reassembly buffers are pre-sized by the declared part count, so this limits the memory a
    ///  single (possibly bogus) fragment can claim
    pub max_parts_per_message: u32,

    /// Acquisition pacing if a START command does not specify an interval
    pub default_interval: Duration,
    pub idle_poll_interval: Duration,
    pub dequeue_timeout: Duration,
    /// Bounded wait for incoming datagrams. This is also the tick for expiry sweeps and for
    ///  checking the stop signal on the receive side.
    pub receive_timeout: Duration,
    pub receive_buffer_size: usize,

    pub send_backoff_initial: Duration,
    pub send_backoff_max: Duration,
    /// number of consecutive send failures after which the failure is reported as sustained
    pub sustained_failure_threshold: u32,

    pub progress_log_every: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            max_datagram_bytes: 1100,
            codec: CodecKind::Json,
            frame_kind: "ascan_s21_json".to_string(),
            accepted_frame_kinds: vec!["ascan_s21_json".to_string(), "s21_real_u_csv".to_string()],
            relay_queue_capacity: 1000,
            consumer_queue_capacity: 1000,
            reassembly_ttl: Duration::from_secs(120),
            gc_sweep_interval: Duration::from_secs(1),
            gc_sweep_every_n_fragments: 256,
            length_mismatch_policy: LengthMismatchPolicy::Flag,
            max_parts_per_message: u16::MAX as u32,
            default_interval: Duration::from_millis(50),
            idle_poll_interval: Duration::from_millis(50),
            dequeue_timeout: Duration::from_millis(200),
            receive_timeout: Duration::from_millis(500),
            receive_buffer_size: 65507,
            send_backoff_initial: Duration::from_millis(200),
            send_backoff_max: Duration::from_secs(5),
            sustained_failure_threshold: 10,
            progress_log_every: 20,
        }
    }
}

impl LinkConfig {
    pub fn with_codec(codec: CodecKind) -> LinkConfig {
        LinkConfig {
            codec,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_bytes < 64 {
            bail!("max_datagram_bytes is too small");
        }
        if self.codec == CodecKind::Binary && self.max_datagram_bytes < BinaryCodec::HEADER_LEN + size_of::<f32>() {
            bail!("max_datagram_bytes does not leave room for a single sample after the binary header");
        }
        if self.max_datagram_bytes > self.receive_buffer_size {
            bail!("receive buffer is smaller than the maximum datagram size");
        }
        if !self.accepted_frame_kinds.contains(&self.frame_kind) {
            bail!("frame kind {:?} is not among the accepted frame kinds", self.frame_kind);
        }
        if self.relay_queue_capacity == 0 || self.consumer_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        if self.reassembly_ttl.is_zero() {
            bail!("reassembly TTL must be positive");
        }
        if self.gc_sweep_every_n_fragments == 0 {
            bail!("gc_sweep_every_n_fragments must be positive");
        }
        if self.max_parts_per_message == 0 {
            bail!("max_parts_per_message must be positive");
        }
        if self.codec == CodecKind::Binary && self.max_parts_per_message > u16::MAX as u32 {
            bail!("the binary envelope supports at most {} parts per message", u16::MAX);
        }
        if self.default_interval.is_zero() {
            bail!("default acquisition interval must be positive");
        }
        if self.dequeue_timeout.is_zero() || self.receive_timeout.is_zero() || self.idle_poll_interval.is_zero() {
            bail!("timeouts must be positive, loops must never wait without a bound");
        }
        if self.send_backoff_initial > self.send_backoff_max {
            bail!("initial send backoff exceeds the maximum send backoff");
        }
        if self.progress_log_every == 0 {
            bail!("progress_log_every must be positive");
        }
        Ok(())
    }
}
