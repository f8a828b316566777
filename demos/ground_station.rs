mod cli;

use clap::Parser;
use clap_derive::Parser;
use framelink::config::LinkConfig;
use framelink::control::{ControlClient, ControlCommand};
use framelink::frame::ReassembledFrame;
use framelink::frame_source::FrameSink;
use framelink::session::receiver::ReceiverSession;
use std::net::SocketAddr;
use std::sync::Arc;
use cli::{init_logging, CodecArg};
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{info, warn};

/// Receives frames from a sender, commanding it with START on startup and STOP on exit
#[derive(Parser)]
struct Args {
    /// local address to receive frames on
    data_address: String,

    /// the sender's control address
    uav_control_address: String,

    #[clap(long, value_enum, default_value_t = CodecArg::Json)]
    codec: CodecArg,

    #[clap(long)]
    interval_ms: Option<u64>,

    /// stop after this many seconds, otherwise run until Ctrl-C
    #[clap(long)]
    duration_secs: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingSink;

#[async_trait]
impl FrameSink for LoggingSink {
    async fn on_frame(&self, frame: ReassembledFrame) -> anyhow::Result<()> {
        let (min, max) = frame.frame.samples.iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));

        if frame.length_mismatch {
            warn!("frame {} declared {:?} samples but has {}", frame.msg_id, frame.declared_sample_count, frame.frame.sample_count());
        }
        info!("frame {} @{}: {} samples in [{}, {}]", frame.msg_id, frame.frame.capture_ts_ms, frame.frame.sample_count(), min, max);
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.very_verbose);

    let uav_addr: SocketAddr = args.uav_control_address.parse()?;
    let config = Arc::new(LinkConfig::with_codec(args.codec.into()));

    let data_socket = Arc::new(UdpSocket::bind(args.data_address.parse::<SocketAddr>()?).await?);
    let receiver = ReceiverSession::start(config.clone(), data_socket, Arc::new(LoggingSink))?;

    let control_socket = Arc::new(UdpSocket::bind(if uav_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?);
    let control = ControlClient::new(control_socket, uav_addr, config.max_datagram_bytes);
    control.send(&ControlCommand::Start { interval_ms: args.interval_ms }).await?;

    match args.duration_secs {
        Some(secs) => {
            select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                r = tokio::signal::ctrl_c() => r?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    // NB: STOP is fire-and-forget like every control message, the sender keeps streaming if it gets lost
    if let Err(e) = control.send(&ControlCommand::Stop).await {
        warn!("error sending STOP: {}", e);
    }
    receiver.shutdown().await;
    Ok(())
}
