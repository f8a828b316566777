use std::collections::hash_map::Entry;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::{LengthMismatchPolicy, LinkConfig};
use crate::frame::{Fragment, Frame, FragmentHeader, MessageId, ReassembledFrame};

pub struct ReassemblerConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_every_n_fragments: usize,
    pub length_mismatch_policy: LengthMismatchPolicy,
    pub max_parts_per_message: u32,
}

impl From<&LinkConfig> for ReassemblerConfig {
    fn from(config: &LinkConfig) -> Self {
        ReassemblerConfig {
            ttl: config.reassembly_ttl,
            sweep_interval: config.gc_sweep_interval,
            sweep_every_n_fragments: config.gc_sweep_every_n_fragments,
            length_mismatch_policy: config.length_mismatch_policy,
            max_parts_per_message: config.max_parts_per_message,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub fragments_accepted: u64,
    pub duplicate_fragments: u64,
    /// fragments with an impossible part index or part count
    pub invalid_fragments: u64,
    /// fragments disagreeing with the part count of an existing buffer
    pub conflicting_fragments: u64,
    pub frames_completed: u64,
    pub length_mismatches: u64,
    pub frames_discarded: u64,
    pub messages_expired: u64,
}

struct ReassemblyBuffer {
    /// one slot per declared part
    parts: Vec<Option<Vec<f64>>>,
    num_received: usize,
    declared_sample_count: Option<u32>,
    capture_ts_ms: u64,
    last_update: Instant,
}

impl ReassemblyBuffer {
    fn new(header: &FragmentHeader, now: Instant) -> ReassemblyBuffer {
        ReassemblyBuffer {
            parts: vec![None; header.part_count as usize],
            num_received: 0,
            declared_sample_count: header.sample_count,
            capture_ts_ms: header.capture_ts_ms.or(header.send_ts_ms).unwrap_or(0),
            last_update: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.parts.len()
    }

    fn into_samples(self) -> Vec<f64> {
        self.parts.into_iter()
            .flatten()
            .flatten()
            .collect()
    }
}

/// Reconstructs frames from fragments arriving in any order, any number of times, or not at all.
///
/// Each message id goes through a simple state machine: a buffer is created on the first
///  fragment (WAITING), and removed either when all parts are present (COMPLETE) or when no
///  fragment arrived for the configured TTL (EXPIRED). Both transitions are terminal.
///
/// Ids of completed messages are remembered for one TTL so that late duplicates are recognized
///  as such instead of opening a new buffer (or, for single-part messages, delivering the frame
///  a second time).
///
/// A reassembler is owned by exactly one receive loop and is not shared, so there is no locking.
pub struct Reassembler {
    config: ReassemblerConfig,
    buffers: FxHashMap<MessageId, ReassemblyBuffer>,
    recently_completed: FxHashMap<MessageId, Instant>,
    fragments_since_sweep: usize,
    last_sweep: Instant,
    stats: ReassemblerStats,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig, now: Instant) -> Reassembler {
        Reassembler {
            config,
            buffers: FxHashMap::default(),
            recently_completed: FxHashMap::default(),
            fragments_since_sweep: 0,
            last_sweep: now,
            stats: ReassemblerStats::default(),
        }
    }

    pub fn num_live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> &ReassemblerStats {
        &self.stats
    }

    /// Stores a fragment, returning the frame if this fragment completed it
    pub fn on_fragment(&mut self, fragment: Fragment, now: Instant) -> Option<ReassembledFrame> {
        self.fragments_since_sweep += 1;

        let Fragment { header, samples } = fragment;

        if header.part_count == 0 || header.part_index >= header.part_count {
            debug!("fragment {}/{} of message {} has an invalid part index - dropping", header.part_index, header.part_count, header.msg_id);
            self.stats.invalid_fragments += 1;
            return None;
        }
        if header.part_count > self.config.max_parts_per_message {
            debug!("message {} declares {} parts, exceeding the limit of {} - dropping", header.msg_id, header.part_count, self.config.max_parts_per_message);
            self.stats.invalid_fragments += 1;
            return None;
        }
        if self.recently_completed.contains_key(&header.msg_id) {
            trace!("fragment {} of already completed message {} - dropping", header.part_index, header.msg_id);
            self.stats.duplicate_fragments += 1;
            return None;
        }

        let buffer = match self.buffers.entry(header.msg_id.clone()) {
            Entry::Occupied(e) => {
                let buffer = e.into_mut();
                if buffer.parts.len() != header.part_count as usize {
                    debug!("fragment of message {} declares {} parts, but the message was started with {} - dropping", header.msg_id, header.part_count, buffer.parts.len());
                    self.stats.conflicting_fragments += 1;
                    return None;
                }
                buffer
            }
            Entry::Vacant(e) => {
                trace!("first fragment of message {} with {} parts", header.msg_id, header.part_count);
                e.insert(ReassemblyBuffer::new(&header, now))
            }
        };

        let slot = &mut buffer.parts[header.part_index as usize];
        if slot.is_some() {
            trace!("duplicate fragment {} of message {}", header.part_index, header.msg_id);
            self.stats.duplicate_fragments += 1;
        }
        else {
            buffer.num_received += 1;
        }
        *slot = Some(samples);
        buffer.last_update = now;
        self.stats.fragments_accepted += 1;

        if !buffer.is_complete() {
            return None;
        }

        let buffer = self.buffers.remove(&header.msg_id)?;
        self.recently_completed.insert(header.msg_id.clone(), now);
        self.complete(header.msg_id, buffer)
    }

    fn complete(&mut self, msg_id: MessageId, buffer: ReassemblyBuffer) -> Option<ReassembledFrame> {
        let part_count = buffer.parts.len() as u32;
        let declared_sample_count = buffer.declared_sample_count;
        let capture_ts_ms = buffer.capture_ts_ms;
        let samples = buffer.into_samples();

        let length_mismatch = match declared_sample_count {
            Some(declared) => declared as usize != samples.len(),
            None => false,
        };
        if length_mismatch {
            self.stats.length_mismatches += 1;
            match self.config.length_mismatch_policy {
                LengthMismatchPolicy::Flag => {
                    warn!("message {}: length mismatch, declared {:?} samples but received {} - delivering flagged frame", msg_id, declared_sample_count, samples.len());
                }
                LengthMismatchPolicy::Discard => {
                    warn!("message {}: length mismatch, declared {:?} samples but received {} - discarding frame", msg_id, declared_sample_count, samples.len());
                    self.stats.frames_discarded += 1;
                    return None;
                }
            }
        }

        trace!("message {} complete: {} samples in {} parts", msg_id, samples.len(), part_count);
        self.stats.frames_completed += 1;
        Some(ReassembledFrame {
            msg_id,
            frame: Frame::new(samples, capture_ts_ms),
            part_count,
            declared_sample_count,
            length_mismatch,
        })
    }

    /// Sweeps expired buffers if enough fragments were processed or enough time passed since the
    ///  previous sweep. Returns the number of expired messages.
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        if self.fragments_since_sweep >= self.config.sweep_every_n_fragments
            || now.saturating_duration_since(self.last_sweep) >= self.config.sweep_interval
        {
            self.sweep_expired(now)
        }
        else {
            0
        }
    }

    /// Removes all buffers that did not receive a fragment for longer than the TTL
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        self.fragments_since_sweep = 0;
        self.last_sweep = now;

        let ttl = self.config.ttl;
        let num_before = self.buffers.len();
        self.buffers.retain(|msg_id, buffer| {
            if now.saturating_duration_since(buffer.last_update) > ttl {
                warn!("message {} expired with {} of {} parts - dropping", msg_id, buffer.num_received, buffer.parts.len());
                false
            }
            else {
                true
            }
        });
        self.recently_completed
            .retain(|_, completed_at| now.saturating_duration_since(*completed_at) <= ttl);

        let num_expired = num_before - self.buffers.len();
        self.stats.messages_expired += num_expired as u64;
        num_expired
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            debug!("discarding {} incomplete messages on shutdown", self.buffers.len());
        }
    }
}
