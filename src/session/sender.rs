use std::net::SocketAddr;
use std::sync::Arc;
use bytes::BytesMut;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use crate::chunker::Chunker;
use crate::codec::create_codec;
use crate::config::LinkConfig;
use crate::control::{control_receive_loop, ControlChannel, StreamControl, StreamingState};
use crate::frame::{now_millis, Frame};
use crate::frame_source::FrameSource;
use crate::relay_queue::{Dequeued, RelayQueue};
use crate::session::SessionStats;
use crate::socket::DatagramSocket;
use crate::util::backoff::FailureBackoff;
use crate::util::stop_signal::{StopSignal, StopTrigger};

/// The sending side of a link: acquires frames while the control channel says so, and sends
///  them to a fixed peer.
///
/// Dropping the session aborts its tasks, [SenderSession::shutdown] stops them gracefully.
pub struct SenderSession {
    stop: StopTrigger,
    control: Arc<ControlChannel>,
    relay_queue: Arc<RelayQueue<Frame>>,
    stats: Arc<SessionStats>,
    handles: Vec<JoinHandle<()>>,
}

impl SenderSession {
    /// Spawns the session's tasks. Without a control socket, streaming is controlled only through
    ///  [SenderSession::control].
    pub fn start<S: FrameSource>(
        config: Arc<LinkConfig>,
        source: S,
        data_socket: Arc<dyn DatagramSocket>,
        peer: SocketAddr,
        control_socket: Option<Arc<dyn DatagramSocket>>,
    ) -> anyhow::Result<SenderSession> {
        config.validate()?;

        let stop = StopTrigger::new();
        let control = Arc::new(ControlChannel::new(config.default_interval));
        let relay_queue = Arc::new(RelayQueue::new(config.relay_queue_capacity));
        let stats = Arc::new(SessionStats::default());
        let chunker = Chunker::new(create_codec(&config), config.max_datagram_bytes);

        info!("starting sender session to {:?} with {:?} codec", peer, config.codec);

        let mut handles = vec![
            tokio::spawn(acquisition_loop(source, control.subscribe(), relay_queue.clone(), stats.clone(), config.clone(), stop.signal())),
            tokio::spawn(send_loop(relay_queue.clone(), chunker, data_socket, peer, stats.clone(), config.clone(), stop.signal())),
        ];
        if let Some(control_socket) = control_socket {
            handles.push(tokio::spawn(control_receive_loop(control_socket, control.clone(), config.clone(), stop.signal())));
        }

        Ok(SenderSession {
            stop,
            control,
            relay_queue,
            stats,
            handles,
        })
    }

    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn relay_queue(&self) -> &Arc<RelayQueue<Frame>> {
        &self.relay_queue
    }

    /// Signals all tasks to stop and waits for them to finish. Frames that are still queued are
    ///  sent before the send loop exits.
    pub async fn shutdown(mut self) {
        info!("shutting down sender session");
        self.stop.trigger();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                error!("sender task failed: {}", e);
            }
        }
        info!("sender session stopped: {:?}", self.stats);
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Acquires frames at the pacing interval while streaming, and hands them to the relay queue.
///  Enqueueing never blocks, so a slow network never slows down acquisition.
pub async fn acquisition_loop<S: FrameSource>(
    mut source: S,
    mut control: watch::Receiver<StreamControl>,
    relay_queue: Arc<RelayQueue<Frame>>,
    stats: Arc<SessionStats>,
    config: Arc<LinkConfig>,
    mut stop: StopSignal,
) {
    info!("starting acquisition loop");

    loop {
        if stop.is_triggered() {
            break;
        }

        let current = *control.borrow_and_update();
        if current.state == StreamingState::Stopped {
            select! {
                _ = stop.triggered() => break,
                _ = control.changed() => {}
                _ = sleep(config.idle_poll_interval) => {}
            }
            continue;
        }

        let next_tick = Instant::now() + current.interval;
        let acquired = select! {
            _ = stop.triggered() => break,
            r = source.acquire() => r,
        };
        match acquired {
            Ok(Some(frame)) => {
                let num_acquired = SessionStats::inc(&stats.frames_acquired);
                trace!("acquired frame #{} with {} samples", num_acquired, frame.sample_count());
                if relay_queue.enqueue(frame).is_some() {
                    SessionStats::inc(&stats.frames_dropped);
                }
            }
            Ok(None) => trace!("no frame available"),
            Err(e) => warn!("frame acquisition failed: {}", e),
        }

        select! {
            _ = stop.triggered() => break,
            _ = sleep_until(next_tick) => {}
        }
    }

    relay_queue.close();
    info!("acquisition loop stopped");
}

/// Takes frames from the relay queue, splits them into fragments and sends them. A send failure
///  skips the rest of the frame and backs off before the next attempt.
pub async fn send_loop(
    relay_queue: Arc<RelayQueue<Frame>>,
    chunker: Chunker,
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    stats: Arc<SessionStats>,
    config: Arc<LinkConfig>,
    mut stop: StopSignal,
) {
    info!("starting send loop to {:?}", peer);

    let codec = chunker.codec().clone();
    let mut backoff = FailureBackoff::new(config.send_backoff_initial, config.send_backoff_max, config.sustained_failure_threshold);
    let mut buf = BytesMut::with_capacity(config.max_datagram_bytes);

    'frames: loop {
        let entry = match relay_queue.dequeue(config.dequeue_timeout).await {
            Dequeued::Item(entry) => entry,
            Dequeued::Timeout => {
                if stop.is_triggered() {
                    break;
                }
                continue;
            }
            Dequeued::Closed => break,
        };
        trace!("frame waited {:?} in relay queue", entry.enqueued_at.elapsed());

        let msg_id = codec.next_message_id();
        let fragments = match chunker.chunk(&entry.item, msg_id.clone(), now_millis()) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("frame with {} samples can not be sent: {} - dropping", entry.item.sample_count(), e);
                SessionStats::inc(&stats.frames_dropped);
                continue;
            }
        };

        for fragment in &fragments {
            buf.clear();
            if let Err(e) = codec.encode(&fragment.header, &fragment.samples, &mut buf) {
                warn!("error encoding fragment {} of message {}: {} - dropping frame", fragment.header.part_index, msg_id, e);
                SessionStats::inc(&stats.frames_dropped);
                continue 'frames;
            }

            match socket.send_datagram(peer, &buf).await {
                Ok(()) => {
                    if backoff.is_sustained() {
                        info!("sending to {:?} recovered after {} consecutive failures", peer, backoff.consecutive_failures());
                    }
                    backoff.on_success();
                    SessionStats::inc(&stats.fragments_sent);
                }
                Err(e) => {
                    SessionStats::inc(&stats.send_failures);
                    SessionStats::inc(&stats.frames_dropped);
                    let delay = backoff.on_failure();
                    if backoff.just_became_sustained() {
                        error!("sending to {:?} failed {} times in a row, latest error: {}", peer, backoff.consecutive_failures(), e);
                    }
                    else {
                        warn!("error sending fragment {} of message {} to {:?}: {} - skipping frame, retrying in {:?}", fragment.header.part_index, msg_id, peer, e, delay);
                    }

                    select! {
                        _ = stop.triggered() => break 'frames,
                        _ = sleep(delay) => continue 'frames,
                    }
                }
            }
        }

        let num_sent = SessionStats::inc(&stats.frames_sent);
        if num_sent % config.progress_log_every == 0 {
            info!("sent frame #{}: message {} with {} samples in {} fragments, {} frames evicted from relay queue so far",
                num_sent, msg_id, entry.item.sample_count(), fragments.len(), relay_queue.num_evicted());
        }
        else {
            debug!("sent message {} with {} samples in {} fragments", msg_id, entry.item.sample_count(), fragments.len());
        }
    }

    info!("send loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::json::JsonCodec;
    use crate::codec::WireCodec;
    use crate::control::ControlCommand;
    use crate::frame_source::MockFrameSource;
    use crate::socket::MockDatagramSocket;
    use crate::test_util::{json_codec, ramp_frame};
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 9000))
    }

    fn counting_source() -> MockFrameSource {
        let mut source = MockFrameSource::new();
        let mut counter = 0u64;
        source.expect_acquire()
            .returning(move || {
                counter += 1;
                Ok(Some(ramp_frame(10, counter)))
            });
        source
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_follows_control() {
        let config = Arc::new(LinkConfig::default());
        let control = ControlChannel::new(Duration::from_millis(50));
        let relay_queue = Arc::new(RelayQueue::new(1000));
        let stats = Arc::new(SessionStats::default());
        let trigger = StopTrigger::new();

        let handle = tokio::spawn(acquisition_loop(counting_source(), control.subscribe(), relay_queue.clone(), stats.clone(), config, trigger.signal()));

        // stopped initially
        sleep(Duration::from_millis(500)).await;
        assert_eq!(relay_queue.len(), 0);

        control.apply(&ControlCommand::Start { interval_ms: Some(50) });
        sleep(Duration::from_millis(1000)).await;
        let at_50ms = relay_queue.len();
        assert!((19..=21).contains(&at_50ms), "{}", at_50ms);

        // scenario E: START again with a different interval keeps streaming at the new pace
        control.apply(&ControlCommand::Start { interval_ms: Some(100) });
        sleep(Duration::from_millis(1000)).await;
        let at_100ms = relay_queue.len() - at_50ms;
        assert!((9..=11).contains(&at_100ms), "{}", at_100ms);

        control.apply(&ControlCommand::Stop);
        sleep(Duration::from_millis(10)).await;
        let before_idle = relay_queue.len();
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(relay_queue.len(), before_idle);

        trigger.trigger();
        handle.await.unwrap();
        assert!(relay_queue.is_closed());
        assert_eq!(SessionStats::get(&stats.frames_acquired), before_idle as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_survives_source_errors() {
        let mut source = MockFrameSource::new();
        let mut counter = 0;
        source.expect_acquire()
            .returning(move || {
                counter += 1;
                match counter % 3 {
                    0 => Err(anyhow::anyhow!("instrument timeout")),
                    1 => Ok(None),
                    _ => Ok(Some(ramp_frame(3, 0))),
                }
            });

        let control = ControlChannel::new(Duration::from_millis(10));
        control.apply(&ControlCommand::Start { interval_ms: None });
        let relay_queue = Arc::new(RelayQueue::new(1000));
        let trigger = StopTrigger::new();

        let handle = tokio::spawn(acquisition_loop(source, control.subscribe(), relay_queue.clone(), Arc::new(SessionStats::default()), Arc::new(LinkConfig::default()), trigger.signal()));
        sleep(Duration::from_millis(295)).await;
        trigger.trigger();
        handle.await.unwrap();

        assert_eq!(relay_queue.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_loop_sends_all_fragments() {
        let codec = json_codec();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut socket = MockDatagramSocket::new();
        {
            let sent = sent.clone();
            socket.expect_send_datagram()
                .withf(|to, datagram| to == &peer() && datagram.len() <= 1100)
                .returning(move |_, datagram| {
                    sent.lock().unwrap().push(datagram.to_vec());
                    Ok(())
                });
        }

        let relay_queue = Arc::new(RelayQueue::new(10));
        relay_queue.enqueue(ramp_frame(501, 1));
        relay_queue.enqueue(ramp_frame(0, 2));
        relay_queue.close();

        let stats = Arc::new(SessionStats::default());
        let trigger = StopTrigger::new();
        send_loop(relay_queue, Chunker::new(codec.clone(), 1100), Arc::new(socket), peer(), stats.clone(), Arc::new(LinkConfig::default()), trigger.signal()).await;

        let sent = sent.lock().unwrap();
        let fragments = sent.iter()
            .map(|d| codec.decode(d).unwrap().unwrap())
            .collect::<Vec<_>>();

        assert!(fragments.len() >= 2);
        assert_eq!(fragments.last().unwrap().header.sample_count, Some(0));
        assert_eq!(SessionStats::get(&stats.frames_sent), 2);
        assert_eq!(SessionStats::get(&stats.fragments_sent), fragments.len() as u64);

        let samples = fragments[..fragments.len() - 1].iter()
            .flat_map(|f| f.samples.iter().cloned())
            .collect::<Vec<_>>();
        assert_eq!(samples, ramp_frame(501, 1).samples);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_skips_frame_and_backs_off() {
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let mut socket = MockDatagramSocket::new();
        let mut seq = mockall::Sequence::new();
        {
            let attempts = attempts.clone();
            socket.expect_send_datagram()
                .once()
                .in_sequence(&mut seq)
                .returning(move |_, _| {
                    attempts.lock().unwrap().push(Instant::now());
                    Err(io::Error::new(io::ErrorKind::Other, "network unreachable"))
                });
        }
        {
            let attempts = attempts.clone();
            socket.expect_send_datagram()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| {
                    attempts.lock().unwrap().push(Instant::now());
                    Ok(())
                });
        }

        let relay_queue = Arc::new(RelayQueue::new(10));
        relay_queue.enqueue(ramp_frame(1, 1));
        relay_queue.enqueue(ramp_frame(1, 2));
        relay_queue.close();

        let stats = Arc::new(SessionStats::default());
        let codec: Arc<dyn WireCodec> = Arc::new(JsonCodec::new("ascan_s21_json".to_string(), vec!["ascan_s21_json".to_string()]));
        let trigger = StopTrigger::new();
        send_loop(relay_queue, Chunker::new(codec, 1100), Arc::new(socket), peer(), stats.clone(), Arc::new(LinkConfig::default()), trigger.signal()).await;

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(200));
        assert_eq!(SessionStats::get(&stats.send_failures), 1);
        assert_eq!(SessionStats::get(&stats.frames_sent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_loop_stops_on_signal() {
        let relay_queue = Arc::new(RelayQueue::<Frame>::new(10));
        let trigger = StopTrigger::new();

        let handle = tokio::spawn(send_loop(relay_queue, Chunker::new(json_codec(), 1100), Arc::new(MockDatagramSocket::new()), peer(), Arc::new(SessionStats::default()), Arc::new(LinkConfig::default()), trigger.signal()));
        sleep(Duration::from_secs(1)).await;
        trigger.trigger();

        let start = Instant::now();
        handle.await.unwrap();
        assert!(start.elapsed() <= LinkConfig::default().dequeue_timeout);
    }
}
