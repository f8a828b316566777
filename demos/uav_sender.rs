mod cli;

use clap::Parser;
use clap_derive::Parser;
use framelink::config::LinkConfig;
use framelink::control::ControlCommand;
use framelink::frame_source::SyntheticTraceSource;
use framelink::session::sender::SenderSession;
use framelink::socket::DatagramSocket;
use std::net::SocketAddr;
use std::sync::Arc;
use cli::{init_logging, CodecArg};
use tokio::net::UdpSocket;
use tracing::info;

/// Streams synthetic radar traces to a ground station, controlled by START / STOP commands
#[derive(Parser)]
struct Args {
    /// address of the ground station's data socket
    ground_address: String,

    /// local address to listen on for control commands
    #[clap(long, default_value = "0.0.0.0:7000")]
    control_address: String,

    #[clap(long, value_enum, default_value_t = CodecArg::Json)]
    codec: CodecArg,

    #[clap(long, default_value_t = 501)]
    samples: usize,

    #[clap(long, default_value_t = 1100)]
    max_datagram_bytes: usize,

    /// start streaming without waiting for a START command
    #[clap(long, default_value_t = false)]
    autostart: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.very_verbose);

    let ground_addr: SocketAddr = args.ground_address.parse()?;
    let config = Arc::new(LinkConfig {
        max_datagram_bytes: args.max_datagram_bytes,
        ..LinkConfig::with_codec(args.codec.into())
    });

    let data_socket = Arc::new(UdpSocket::bind(if ground_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?);
    let control_socket: Arc<dyn DatagramSocket> = Arc::new(UdpSocket::bind(args.control_address.parse::<SocketAddr>()?).await?);
    info!("listening for control commands on {:?}", control_socket.local_addr()?);

    let session = SenderSession::start(
        config,
        SyntheticTraceSource::new(args.samples),
        data_socket,
        ground_addr,
        Some(control_socket),
    )?;

    if args.autostart {
        session.control().apply(&ControlCommand::Start { interval_ms: None });
    }

    tokio::signal::ctrl_c().await?;
    session.shutdown().await;
    Ok(())
}
