use std::sync::atomic::{AtomicU32, Ordering};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::codec::WireCodec;
use crate::config::CodecKind;
use crate::frame::{Fragment, FragmentHeader, MessageId};

/// Compact envelope for high sample rates. All header numbers are in network byte order (BE),
///  samples are little-endian f32:
///
/// ```ascii
///  0: magic "ASCN" (4 bytes)
///  4: message id (u32)
///  8: part index (u16)
/// 10: part count (u16)
/// 12: send timestamp, millis since epoch (u64)
/// 20: samples (4 bytes each) until the end of the datagram
/// ```
///
/// NB: There is no sample count in the header, so length mismatches can not be detected for this
///      format
///
/// NB: Samples are narrowed to f32 on the wire. Frames that need double precision must use the
///      JSON envelope.
pub struct BinaryCodec {
    next_id: AtomicU32,
}

impl BinaryCodec {
    pub const MAGIC: [u8; 4] = *b"ASCN";
    pub const HEADER_LEN: usize = 20;

    pub fn new() -> BinaryCodec {
        BinaryCodec {
            next_id: AtomicU32::new(rand::random()),
        }
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec for BinaryCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Binary
    }

    fn next_message_id(&self) -> MessageId {
        // wraps around after 2^32 frames, which is far outside any TTL window
        MessageId::Numeric(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn encode(&self, header: &FragmentHeader, samples: &[f64], buf: &mut BytesMut) -> anyhow::Result<()> {
        let msg_id = match &header.msg_id {
            MessageId::Numeric(n) => *n,
            MessageId::Text(s) => bail!("binary envelope requires a numeric message id, got {:?}", s),
        };
        let part_index: u16 = header.part_index.try_into()?;
        let part_count: u16 = header.part_count.try_into()?;

        buf.reserve(Self::HEADER_LEN + samples.len() * size_of::<f32>());
        buf.put_slice(&Self::MAGIC);
        buf.put_u32(msg_id);
        buf.put_u16(part_index);
        buf.put_u16(part_count);
        buf.put_u64(header.send_ts_ms.or(header.capture_ts_ms).unwrap_or(0));
        for &s in samples {
            buf.put_f32_le(s as f32);
        }
        Ok(())
    }

    fn encoded_len(&self, _header: &FragmentHeader, samples: &[f64]) -> anyhow::Result<usize> {
        Ok(Self::HEADER_LEN + samples.len() * size_of::<f32>())
    }

    fn decode(&self, datagram: &[u8]) -> anyhow::Result<Option<Fragment>> {
        if datagram.len() < Self::MAGIC.len() || datagram[..Self::MAGIC.len()] != Self::MAGIC {
            bail!("wrong magic");
        }
        if datagram.len() < Self::HEADER_LEN {
            bail!("incomplete header: {} bytes", datagram.len());
        }
        if (datagram.len() - Self::HEADER_LEN) % size_of::<f32>() != 0 {
            bail!("payload of {} bytes is not a whole number of samples", datagram.len() - Self::HEADER_LEN);
        }

        let mut buf = &datagram[Self::MAGIC.len()..];
        let msg_id = buf.get_u32();
        let part_index = buf.get_u16();
        let part_count = buf.get_u16();
        let send_ts_ms = buf.get_u64();

        let mut samples = Vec::with_capacity(buf.remaining() / size_of::<f32>());
        while buf.has_remaining() {
            samples.push(buf.get_f32_le() as f64);
        }

        Ok(Some(Fragment {
            header: FragmentHeader {
                msg_id: MessageId::Numeric(msg_id),
                part_index: part_index as u32,
                part_count: part_count as u32,
                sample_count: None,
                capture_ts_ms: None,
                send_ts_ms: Some(send_ts_ms),
            },
            samples,
        }))
    }

    fn max_part_count(&self) -> u32 {
        u16::MAX as u32
    }
}
