use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::config::LinkConfig;
use crate::frame::now_millis;
use crate::socket::DatagramSocket;
use crate::util::backoff::FailureBackoff;
use crate::util::stop_signal::StopSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingState {
    Stopped,
    Streaming,
}

/// The state driven by the control channel, as seen by the acquisition loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamControl {
    pub state: StreamingState,
    /// pacing of acquisition while streaming
    pub interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Starts streaming, or updates the pacing interval if streaming already
    Start { interval_ms: Option<u64> },
    Stop,
}

/// Control datagram:
///
/// ```json
/// {"type":"CTRL","cmd":"START","interval_ms":50,"msg_id":"1f0c2a9b3d4e","ts_ms":1700000000000}
/// ```
///
/// Control messages are small and always sent in a single datagram. Delivery is at-most-once:
///  there is no acknowledgement, a lost command has to be repeated by the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub ts_ms: u64,
}

impl ControlMessage {
    pub const KIND: &'static str = "CTRL";

    pub fn for_command(command: &ControlCommand) -> ControlMessage {
        let (cmd, interval_ms) = match command {
            ControlCommand::Start { interval_ms } => ("START", *interval_ms),
            ControlCommand::Stop => ("STOP", None),
        };

        let mut msg_id = Uuid::new_v4().simple().to_string();
        msg_id.truncate(12);

        ControlMessage {
            kind: Self::KIND.to_string(),
            cmd: cmd.to_string(),
            interval_ms,
            msg_id,
            ts_ms: now_millis(),
        }
    }

    /// Parses a control datagram. Datagrams that are not control messages, or that carry an
    ///  unknown command, are returned as `Ok(None)`.
    pub fn parse_command(datagram: &[u8]) -> anyhow::Result<Option<ControlCommand>> {
        let msg: ControlMessage = serde_json::from_slice(datagram)?;
        // older senders omit the type
        if !msg.kind.is_empty() && !msg.kind.trim().eq_ignore_ascii_case(Self::KIND) {
            return Ok(None);
        }

        match msg.cmd.trim().to_ascii_uppercase().as_str() {
            "START" | "ASCAN_START" => Ok(Some(ControlCommand::Start { interval_ms: msg.interval_ms })),
            "STOP" | "ASCAN_STOP" => Ok(Some(ControlCommand::Stop)),
            _ => {
                debug!("unknown control command {:?} in message {}", msg.cmd, msg.msg_id);
                Ok(None)
            }
        }
    }
}

/// Holds the STOPPED / STREAMING state, published to the acquisition loop through a watch
///  channel so that it can react to changes without polling.
pub struct ControlChannel {
    tx: watch::Sender<StreamControl>,
}

impl ControlChannel {
    pub fn new(default_interval: Duration) -> ControlChannel {
        let (tx, _) = watch::channel(StreamControl {
            state: StreamingState::Stopped,
            interval: default_interval,
        });
        ControlChannel { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamControl> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StreamControl {
        *self.tx.borrow()
    }

    /// Applies a command, returning `true` if it changed the state or the interval.
    ///
    /// START while streaming and STOP while stopped are no-ops, except that START may update the
    ///  interval. An interval of 0 is rejected and leaves the previous interval in place.
    pub fn apply(&self, command: &ControlCommand) -> bool {
        self.tx.send_if_modified(|control| {
            match command {
                ControlCommand::Start { interval_ms } => {
                    let interval = match interval_ms {
                        Some(0) => {
                            warn!("ignoring START with interval of 0 ms, keeping {:?}", control.interval);
                            control.interval
                        }
                        Some(millis) => Duration::from_millis(*millis),
                        None => control.interval,
                    };

                    let modified = match (control.state, interval == control.interval) {
                        (StreamingState::Stopped, _) => {
                            info!("streaming started with interval {:?}", interval);
                            true
                        }
                        (StreamingState::Streaming, false) => {
                            info!("streaming interval changed from {:?} to {:?}", control.interval, interval);
                            true
                        }
                        (StreamingState::Streaming, true) => {
                            debug!("START while streaming already - ignoring");
                            false
                        }
                    };
                    control.state = StreamingState::Streaming;
                    control.interval = interval;
                    modified
                }
                ControlCommand::Stop => {
                    if control.state == StreamingState::Stopped {
                        debug!("STOP while stopped already - ignoring");
                        false
                    }
                    else {
                        info!("streaming stopped");
                        control.state = StreamingState::Stopped;
                        true
                    }
                }
            }
        })
    }
}

/// Receives control datagrams and applies them until stopped. Malformed datagrams and socket
///  errors are logged and skipped.
pub async fn control_receive_loop(
    socket: Arc<dyn DatagramSocket>,
    channel: Arc<ControlChannel>,
    config: Arc<LinkConfig>,
    mut stop: StopSignal,
) {
    info!("starting control receive loop");

    let mut buf = vec![0u8; config.receive_buffer_size];
    let mut backoff = FailureBackoff::new(config.send_backoff_initial, config.send_backoff_max, config.sustained_failure_threshold);
    loop {
        let received = select! {
            _ = stop.triggered() => break,
            r = timeout(config.receive_timeout, socket.recv_datagram(&mut buf)) => r,
        };

        let (len, from) = match received {
            Err(_) => continue,
            Ok(Ok(x)) => {
                backoff.on_success();
                x
            }
            Ok(Err(e)) => {
                error!("control socket error: {}", e);
                let delay = backoff.on_failure();
                select! {
                    _ = stop.triggered() => break,
                    _ = sleep(delay) => continue,
                }
            }
        };

        match ControlMessage::parse_command(&buf[..len]) {
            Ok(Some(command)) => {
                debug!("received control command {:?} from {:?}", command, from);
                channel.apply(&command);
            }
            Ok(None) => debug!("received non-command datagram on control socket from {:?} - ignoring", from),
            Err(e) => debug!("received malformed control datagram from {:?}: {} - dropping", from, e),
        }
    }

    info!("control receive loop stopped");
}

/// The operator side of the control channel
pub struct ControlClient {
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    max_datagram_bytes: usize,
}

impl ControlClient {
    pub fn new(socket: Arc<dyn DatagramSocket>, peer: SocketAddr, max_datagram_bytes: usize) -> ControlClient {
        ControlClient {
            socket,
            peer,
            max_datagram_bytes,
        }
    }

    pub async fn send(&self, command: &ControlCommand) -> anyhow::Result<()> {
        let msg = ControlMessage::for_command(command);
        let datagram = serde_json::to_vec(&msg)?;
        if datagram.len() > self.max_datagram_bytes {
            bail!("control message of {} bytes exceeds the datagram budget of {} bytes", datagram.len(), self.max_datagram_bytes);
        }

        self.socket.send_datagram(self.peer, &datagram).await?;
        info!("sent {} ({}) to {:?}", msg.cmd, msg.msg_id, self.peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockDatagramSocket;
    use crate::util::stop_signal::StopTrigger;
    use rstest::rstest;
    use std::io;

    const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

    fn start(interval_ms: Option<u64>) -> ControlCommand {
        ControlCommand::Start { interval_ms }
    }

    #[rstest]
    #[case::start_from_stopped(vec![start(None)], StreamingState::Streaming, 50, vec![true])]
    #[case::start_with_interval(vec![start(Some(80))], StreamingState::Streaming, 80, vec![true])]
    #[case::scenario_e(vec![start(Some(50)), start(Some(100))], StreamingState::Streaming, 100, vec![true, true])]
    #[case::repeated_start(vec![start(Some(80)), start(Some(80))], StreamingState::Streaming, 80, vec![true, false])]
    #[case::start_without_interval_keeps_it(vec![start(Some(80)), start(None)], StreamingState::Streaming, 80, vec![true, false])]
    #[case::zero_interval(vec![start(Some(0))], StreamingState::Streaming, 50, vec![true])]
    #[case::stop_while_stopped(vec![ControlCommand::Stop], StreamingState::Stopped, 50, vec![false])]
    #[case::start_stop(vec![start(None), ControlCommand::Stop], StreamingState::Stopped, 50, vec![true, true])]
    #[case::stop_twice(vec![start(None), ControlCommand::Stop, ControlCommand::Stop], StreamingState::Stopped, 50, vec![true, true, false])]
    #[case::restart_keeps_interval(vec![start(Some(20)), ControlCommand::Stop, start(None)], StreamingState::Streaming, 20, vec![true, true, true])]
    fn test_apply(
        #[case] commands: Vec<ControlCommand>,
        #[case] expected_state: StreamingState,
        #[case] expected_interval_ms: u64,
        #[case] expected_modified: Vec<bool>,
    ) {
        let channel = ControlChannel::new(DEFAULT_INTERVAL);

        let modified = commands.iter()
            .map(|c| channel.apply(c))
            .collect::<Vec<_>>();

        assert_eq!(modified, expected_modified);
        assert_eq!(channel.current(), StreamControl {
            state: expected_state,
            interval: Duration::from_millis(expected_interval_ms),
        });
    }

    #[test]
    fn test_subscribers_see_changes() {
        let channel = ControlChannel::new(DEFAULT_INTERVAL);
        let mut rx = channel.subscribe();
        assert!(!rx.has_changed().unwrap());

        channel.apply(&ControlCommand::Stop);
        assert!(!rx.has_changed().unwrap());

        channel.apply(&start(Some(70)));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().interval, Duration::from_millis(70));
    }

    #[rstest]
    #[case::start(r#"{"type":"CTRL","cmd":"START","interval_ms":80,"msg_id":"abc","ts_ms":5}"#, Some(start(Some(80))))]
    #[case::start_without_interval(r#"{"type":"CTRL","cmd":"START","msg_id":"abc","ts_ms":5}"#, Some(start(None)))]
    #[case::stop(r#"{"type":"CTRL","cmd":"STOP","msg_id":"abc","ts_ms":5}"#, Some(ControlCommand::Stop))]
    #[case::legacy_start(r#"{"type":"CTRL","cmd":"ASCAN_START","interval_ms":30}"#, Some(start(Some(30))))]
    #[case::legacy_stop(r#"{"type":"CTRL","cmd":"ASCAN_STOP"}"#, Some(ControlCommand::Stop))]
    #[case::lowercase(r#"{"type":"CTRL","cmd":"start","interval_ms":30}"#, Some(start(Some(30))))]
    #[case::padded_legacy(r#"{"type":"CTRL","cmd":" ascan_stop\n"}"#, Some(ControlCommand::Stop))]
    #[case::without_type(r#"{"cmd":"Start","interval_ms":40}"#, Some(start(Some(40))))]
    #[case::lowercase_type(r#"{"type":"ctrl","cmd":"STOP"}"#, Some(ControlCommand::Stop))]
    #[case::unknown_command(r#"{"type":"CTRL","cmd":"REBOOT","msg_id":"abc","ts_ms":5}"#, None)]
    #[case::not_control(r#"{"type":"gps","cmd":"START"}"#, None)]
    fn test_parse_command(#[case] datagram: &str, #[case] expected: Option<ControlCommand>) {
        assert_eq!(ControlMessage::parse_command(datagram.as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case::not_json("START")]
    #[case::no_cmd(r#"{"type":"CTRL"}"#)]
    #[case::frame(r#"{"type":"ascan_s21_json","msg_id":"a","part":0}"#)]
    #[case::negative_interval(r#"{"type":"CTRL","cmd":"START","interval_ms":-5}"#)]
    fn test_parse_malformed(#[case] datagram: &str) {
        assert!(ControlMessage::parse_command(datagram.as_bytes()).is_err());
    }

    #[test]
    fn test_message_for_command() {
        let msg = ControlMessage::for_command(&start(Some(40)));
        assert_eq!(msg.kind, "CTRL");
        assert_eq!(msg.cmd, "START");
        assert_eq!(msg.interval_ms, Some(40));
        assert_eq!(msg.msg_id.len(), 12);

        let json = serde_json::to_string(&ControlMessage::for_command(&ControlCommand::Stop)).unwrap();
        assert!(json.starts_with(r#"{"type":"CTRL","cmd":"STOP","msg_id":""#));
        assert_eq!(ControlMessage::parse_command(json.as_bytes()).unwrap(), Some(ControlCommand::Stop));
    }

    #[tokio::test]
    async fn test_client_sends_single_datagram() {
        let peer = SocketAddr::from(([10, 0, 0, 1], 9000));

        let mut socket = MockDatagramSocket::new();
        socket.expect_send_datagram()
            .once()
            .withf(move |to, datagram| {
                to == &peer &&
                    ControlMessage::parse_command(datagram).unwrap() == Some(ControlCommand::Start { interval_ms: Some(25) })
            })
            .returning(|_, _| Ok(()));

        let client = ControlClient::new(Arc::new(socket), peer, 1100);
        client.send(&start(Some(25))).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_reports_send_failure() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send_datagram()
            .once()
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::Other, "network unreachable")));

        let client = ControlClient::new(Arc::new(socket), SocketAddr::from(([10, 0, 0, 1], 9000)), 1100);
        assert!(client.send(&ControlCommand::Stop).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_applies_commands() {
        let datagrams = vec![
            br#"{"type":"CTRL","cmd":"START","interval_ms":50,"msg_id":"a","ts_ms":1}"#.to_vec(),
            b"garbage".to_vec(),
            br#"{"type":"CTRL","cmd":"START","interval_ms":100,"msg_id":"b","ts_ms":2}"#.to_vec(),
        ];
        let from = SocketAddr::from(([10, 0, 0, 2], 7000));

        let mut socket = MockDatagramSocket::new();
        let mut seq = mockall::Sequence::new();
        for datagram in datagrams {
            socket.expect_recv_datagram()
                .once()
                .in_sequence(&mut seq)
                .returning(move |buf| {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok((datagram.len(), from))
                });
        }
        socket.expect_recv_datagram()
            .returning(|_| Err(io::Error::new(io::ErrorKind::Other, "socket closed")));

        let config = Arc::new(LinkConfig::default());
        let channel = Arc::new(ControlChannel::new(config.default_interval));
        let trigger = StopTrigger::new();

        let handle = tokio::spawn(control_receive_loop(Arc::new(socket), channel.clone(), config, trigger.signal()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(channel.current(), StreamControl {
            state: StreamingState::Streaming,
            interval: Duration::from_millis(100),
        });

        trigger.trigger();
        handle.await.unwrap();
    }
}
