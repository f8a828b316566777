use std::f64::consts::PI;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::frame::{now_millis, Frame, ReassembledFrame};

/// The instrument side: produces one frame per call, at a cadence that is driven by the
///  acquisition loop.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// `Ok(None)` means that the instrument had no frame this time, which is not an error
    async fn acquire(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Downstream consumer of reassembled frames (storage, display, ...)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn on_frame(&self, frame: ReassembledFrame) -> anyhow::Result<()>;
}

/// Generates radar-like traces: a decaying oscillation with a reflection whose depth drifts from
///  one trace to the next. Useful for demos and for exercising a link without an instrument.
pub struct SyntheticTraceSource {
    num_samples: usize,
    trace_number: u64,
}

impl SyntheticTraceSource {
    pub fn new(num_samples: usize) -> SyntheticTraceSource {
        SyntheticTraceSource {
            num_samples,
            trace_number: 0,
        }
    }

    fn trace(&self) -> Vec<f64> {
        let n = self.num_samples.max(1) as f64;
        let reflector = n * (0.3 + 0.2 * ((self.trace_number as f64) * 0.05).sin());

        (0..self.num_samples)
            .map(|i| {
                let t = i as f64;
                let direct = (-t / (n * 0.05)).exp() * (2.0 * PI * t / 12.0).cos();
                let d = (t - reflector) / 6.0;
                let echo = 0.4 * (-d * d).exp() * (2.0 * PI * t / 12.0).sin();
                direct + echo
            })
            .collect()
    }
}

#[async_trait]
impl FrameSource for SyntheticTraceSource {
    async fn acquire(&mut self) -> anyhow::Result<Option<Frame>> {
        let frame = Frame::new(self.trace(), now_millis());
        self.trace_number += 1;
        Ok(Some(frame))
    }
}
