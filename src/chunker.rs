use std::cmp::min;
use std::sync::Arc;
use anyhow::bail;
use tracing::{trace, warn};
use crate::codec::WireCodec;
use crate::frame::{Fragment, FragmentHeader, Frame, MessageId};

/// Splits frames into fragments whose serialized size stays within a datagram budget.
///
/// The codec is the only authority on serialized size (JSON number widths vary per sample), so
///  the chunker probes it for candidate windows of samples:
///
/// * *probe*: starting with the window size that worked for the previous fragment, grow by an
///    increment that doubles with every successful probe until the window overflows the budget
///    or covers the rest of the frame; if even the starting window overflows, halve it instead
/// * *refine*: bisect between the largest window known to fit and the smallest window known to
///    overflow
///
/// Serialized size grows monotonically with the window, so this finds the largest fitting window
///  for each fragment in O(log n) probes, and greedily filling each fragment gives the minimum
///  number of fragments. The number of probes per fragment is additionally capped.
///
/// NB: The part count is only known after splitting, but it contributes to the serialized size of
///      every fragment. Probing is therefore done with a placeholder part count that can not be
///      exceeded by the final count (the number of samples), and the actual count is back-filled
///      afterwards. This can only make fragments smaller than their probed size.
pub struct Chunker {
    codec: Arc<dyn WireCodec>,
    max_datagram_bytes: usize,
}

impl Chunker {
    const INITIAL_WINDOW: usize = 80;
    const INITIAL_GROW_STEP: usize = 20;
    const MAX_PROBES_PER_FRAGMENT: usize = 64;

    pub fn new(codec: Arc<dyn WireCodec>, max_datagram_bytes: usize) -> Chunker {
        Chunker {
            codec,
            max_datagram_bytes,
        }
    }

    pub fn codec(&self) -> &Arc<dyn WireCodec> {
        &self.codec
    }

    pub fn chunk(&self, frame: &Frame, msg_id: MessageId, send_ts_ms: u64) -> anyhow::Result<Vec<Fragment>> {
        let sample_count: u32 = frame.sample_count().try_into()?;

        let mut header = FragmentHeader {
            msg_id,
            part_index: 0,
            part_count: sample_count.max(1),
            sample_count: Some(sample_count),
            capture_ts_ms: Some(frame.capture_ts_ms),
            send_ts_ms: Some(send_ts_ms),
        };

        let mut fragments = Vec::new();
        let mut offset = 0;
        let mut window_hint = Self::INITIAL_WINDOW;
        loop {
            let remaining = &frame.samples[offset..];
            let window = self.next_window(&header, remaining, window_hint)?;

            fragments.push(Fragment {
                header: header.clone(),
                samples: remaining[..window].to_vec(),
            });

            offset += window;
            if offset >= frame.samples.len() {
                break;
            }
            window_hint = window;
            header.part_index += 1;
        }

        let part_count: u32 = fragments.len().try_into()?;
        if part_count > self.codec.max_part_count() {
            bail!("frame with {} samples requires {} fragments, the wire format supports at most {}", sample_count, part_count, self.codec.max_part_count());
        }
        for fragment in &mut fragments {
            fragment.header.part_count = part_count;
        }

        trace!("split frame {} with {} samples into {} fragments", header.msg_id, sample_count, part_count);
        Ok(fragments)
    }

    /// Returns the number of samples from the start of `samples` to put into the next fragment.
    ///  This is always at least one sample, unless `samples` is empty.
    fn next_window(&self, header: &FragmentHeader, samples: &[f64], hint: usize) -> anyhow::Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        let mut largest_fit: Option<usize> = None;
        let mut smallest_overflow: Option<usize> = None;
        let mut window = hint.clamp(1, samples.len());
        let mut grow_step = Self::INITIAL_GROW_STEP;

        for _ in 0..Self::MAX_PROBES_PER_FRAGMENT {
            if self.fits(header, &samples[..window])? {
                largest_fit = Some(window);
                if window == samples.len() {
                    break;
                }
            }
            else {
                smallest_overflow = Some(window);
                if window == 1 {
                    break;
                }
            }

            window = match (largest_fit, smallest_overflow) {
                (Some(fit), Some(overflow)) => {
                    if overflow - fit <= 1 {
                        break;
                    }
                    fit + (overflow - fit) / 2
                }
                (Some(fit), None) => {
                    let next = min(fit + grow_step, samples.len());
                    grow_step *= 2;
                    next
                }
                (None, Some(overflow)) => overflow / 2,
                (None, None) => unreachable!("every probe records either a fit or an overflow"),
            };
        }

        match largest_fit {
            Some(fit) => Ok(fit),
            None => {
                warn!("a single sample exceeds the datagram budget of {} bytes - sending an oversized fragment", self.max_datagram_bytes);
                Ok(1)
            }
        }
    }

    fn fits(&self, header: &FragmentHeader, samples: &[f64]) -> anyhow::Result<bool> {
        Ok(self.codec.encoded_len(header, samples)? <= self.max_datagram_bytes)
    }
}
