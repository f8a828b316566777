use std::fmt::{Display, Formatter};
use std::time::SystemTime;

/// One complete sensor reading, e.g. a single radar trace. This is the unit that is transferred
///  as a logical whole: either all of its samples arrive or none of them are delivered.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub samples: Vec<f64>,
    /// millis since epoch
    pub capture_ts_ms: u64,
}

impl Frame {
    pub fn new(samples: Vec<f64>, capture_ts_ms: u64) -> Frame {
        Frame { samples, capture_ts_ms }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Identifies all fragments belonging to one frame. The representation depends on the wire
///  codec; receivers treat it as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    Text(String),
    Numeric(u32),
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Text(s) => write!(f, "{}", s),
            MessageId::Numeric(n) => write!(f, "{:08x}", n),
        }
    }
}

/// Per-fragment metadata. Everything that describes the frame as a whole is repeated in each
///  fragment so that any fragment can open a reassembly buffer.
///
/// The optional fields are optional because not every wire format carries them.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentHeader {
    pub msg_id: MessageId,
    pub part_index: u32,
    pub part_count: u32,
    /// number of samples in the whole frame
    pub sample_count: Option<u32>,
    pub capture_ts_ms: Option<u64>,
    pub send_ts_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub samples: Vec<f64>,
}

/// A frame as handed to the downstream consumer
#[derive(Clone, Debug, PartialEq)]
pub struct ReassembledFrame {
    pub msg_id: MessageId,
    pub frame: Frame,
    pub part_count: u32,
    pub declared_sample_count: Option<u32>,
    /// set if the frame's actual sample count differs from the declared count
    pub length_mismatch: bool,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
