//! Wire codecs turn fragments into datagrams and back. Chunking and reassembly are written against
//!  [WireCodec] only, so the two envelope formats share all of the splitting, buffering and
//!  expiry logic.

pub mod binary;
pub mod json;

use std::sync::Arc;
use bytes::BytesMut;
use crate::config::{CodecKind, LinkConfig};
use crate::frame::{Fragment, FragmentHeader, MessageId};

pub trait WireCodec: Send + Sync + 'static {
    fn kind(&self) -> CodecKind;

    /// Returns an id that is unique at least for the reassembly TTL
    fn next_message_id(&self) -> MessageId;

    /// Serializes a fragment into `buf`, appending to whatever is there already
    fn encode(&self, header: &FragmentHeader, samples: &[f64], buf: &mut BytesMut) -> anyhow::Result<()>;

    /// The exact number of bytes [WireCodec::encode] would write for this fragment
    fn encoded_len(&self, header: &FragmentHeader, samples: &[f64]) -> anyhow::Result<usize>;

    /// Parses a datagram. Returns `Ok(None)` for well-formed datagrams that are not addressed to
    ///  this receiver (e.g. an unknown frame kind), and an error for malformed datagrams.
    fn decode(&self, datagram: &[u8]) -> anyhow::Result<Option<Fragment>>;

    /// Part counts that can not be represented by the wire format
    fn max_part_count(&self) -> u32 {
        u32::MAX
    }
}

pub fn create_codec(config: &LinkConfig) -> Arc<dyn WireCodec> {
    match config.codec {
        CodecKind::Json => Arc::new(json::JsonCodec::new(config.frame_kind.clone(), config.accepted_frame_kinds.clone())),
        CodecKind::Binary => Arc::new(binary::BinaryCodec::new()),
    }
}
