use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::codec::json::JsonCodec;
use crate::codec::WireCodec;
use crate::frame::{Fragment, FragmentHeader, Frame, MessageId, ReassembledFrame};
use crate::frame_source::FrameSink;

pub fn json_codec() -> Arc<dyn WireCodec> {
    Arc::new(JsonCodec::new("ascan_s21_json".to_string(), vec!["ascan_s21_json".to_string()]))
}

/// convenience for test code: a frame with samples that are distinct, non-trivial and exactly
///  representable, so they survive encoding without rounding artifacts
pub fn ramp_frame(num_samples: usize, capture_ts_ms: u64) -> Frame {
    Frame::new(
        (0..num_samples).map(|i| i as f64 * 0.25 - 100.0).collect(),
        capture_ts_ms,
    )
}

pub fn test_msg_id(id: &str) -> MessageId {
    MessageId::Text(id.to_string())
}

/// builds a fragment by hand, bypassing the chunker
pub fn test_fragment(msg_id: &str, part_index: u32, part_count: u32, sample_count: Option<u32>, samples: Vec<f64>) -> Fragment {
    Fragment {
        header: FragmentHeader {
            msg_id: test_msg_id(msg_id),
            part_index,
            part_count,
            sample_count,
            capture_ts_ms: Some(1000),
            send_ts_ms: None,
        },
        samples,
    }
}

#[derive(Default)]
pub struct TrackingFrameSink {
    tracker: Arc<RwLock<Vec<ReassembledFrame>>>,
}
impl TrackingFrameSink {
    /// returns delivered frames, clearing the internal buffer
    pub async fn delivered_frames(&self) -> Vec<ReassembledFrame> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }
}

#[async_trait]
impl FrameSink for TrackingFrameSink {
    async fn on_frame(&self, frame: ReassembledFrame) -> anyhow::Result<()> {
        self.tracker.write().await.push(frame);
        Ok(())
    }
}
