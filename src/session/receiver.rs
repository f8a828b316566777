use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::codec::{create_codec, WireCodec};
use crate::config::LinkConfig;
use crate::frame::ReassembledFrame;
use crate::frame_source::FrameSink;
use crate::reassembler::{Reassembler, ReassemblerConfig};
use crate::relay_queue::{Dequeued, RelayQueue};
use crate::session::SessionStats;
use crate::socket::DatagramSocket;
use crate::util::backoff::FailureBackoff;
use crate::util::stop_signal::{StopSignal, StopTrigger};

/// The receiving side of a link: reassembles frames from datagrams on a socket and hands them to
///  a [FrameSink] through a bounded queue, so a slow sink never stalls the socket.
pub struct ReceiverSession {
    stop: StopTrigger,
    consumer_queue: Arc<RelayQueue<ReassembledFrame>>,
    stats: Arc<SessionStats>,
    handles: Vec<JoinHandle<()>>,
}

impl ReceiverSession {
    pub fn start(config: Arc<LinkConfig>, socket: Arc<dyn DatagramSocket>, sink: Arc<dyn FrameSink>) -> anyhow::Result<ReceiverSession> {
        config.validate()?;

        let stop = StopTrigger::new();
        let consumer_queue = Arc::new(RelayQueue::new(config.consumer_queue_capacity));
        let stats = Arc::new(SessionStats::default());

        info!("starting receiver session on {:?} with {:?} codec", socket.local_addr()?, config.codec);

        let handler = DatagramHandler::new(create_codec(&config), consumer_queue.clone(), stats.clone(), config.clone());
        let handles = vec![
            tokio::spawn(receive_loop(socket, handler, config.clone(), stop.signal())),
            tokio::spawn(consumer_loop(consumer_queue.clone(), sink, stats.clone(), config.clone(), stop.signal())),
        ];

        Ok(ReceiverSession {
            stop,
            consumer_queue,
            stats,
            handles,
        })
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn consumer_queue(&self) -> &Arc<RelayQueue<ReassembledFrame>> {
        &self.consumer_queue
    }

    pub async fn shutdown(mut self) {
        info!("shutting down receiver session");
        self.stop.trigger();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                error!("receiver task failed: {}", e);
            }
        }
        info!("receiver session stopped: {:?}", self.stats);
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Decodes datagrams and feeds them into the reassembler. The handler (and with it the
///  reassembler) is owned by the receive loop and never touched by any other task.
pub struct DatagramHandler {
    codec: Arc<dyn WireCodec>,
    reassembler: Reassembler,
    consumer_queue: Arc<RelayQueue<ReassembledFrame>>,
    stats: Arc<SessionStats>,
    config: Arc<LinkConfig>,
}

impl DatagramHandler {
    pub fn new(
        codec: Arc<dyn WireCodec>,
        consumer_queue: Arc<RelayQueue<ReassembledFrame>>,
        stats: Arc<SessionStats>,
        config: Arc<LinkConfig>,
    ) -> DatagramHandler {
        DatagramHandler {
            codec,
            reassembler: Reassembler::new(ReassemblerConfig::from(config.as_ref()), Instant::now()),
            consumer_queue,
            stats,
            config,
        }
    }

    pub fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received {} bytes from {:?}", datagram.len(), from);
        SessionStats::inc(&self.stats.datagrams_received);

        let fragment = match self.codec.decode(datagram) {
            Ok(Some(fragment)) => fragment,
            Ok(None) => {
                debug!("received datagram of unknown kind from {:?} - ignoring", from);
                return;
            }
            Err(e) => {
                SessionStats::inc(&self.stats.malformed_datagrams);
                debug!("received malformed datagram from {:?}: {} - dropping", from, e);
                return;
            }
        };

        if let Some(frame) = self.reassembler.on_fragment(fragment, now) {
            let num_reassembled = SessionStats::inc(&self.stats.frames_reassembled);
            if num_reassembled % self.config.progress_log_every == 0 {
                info!("received frame #{}: message {} with {} samples in {} fragments", num_reassembled, frame.msg_id, frame.frame.sample_count(), frame.part_count);
            }
            if self.consumer_queue.enqueue(frame).is_some() {
                debug!("consumer is falling behind - dropped oldest frame");
            }
        }
    }

    pub fn on_tick(&mut self, now: Instant) {
        let num_expired = self.reassembler.maybe_sweep(now);
        if num_expired > 0 {
            self.stats.messages_expired.fetch_add(num_expired as u64, Ordering::Relaxed);
        }
    }

    pub fn num_live_buffers(&self) -> usize {
        self.reassembler.num_live_buffers()
    }
}

/// Receives datagrams until stopped. The bounded receive wait doubles as the tick for expiry
///  sweeps and for checking the stop signal.
pub async fn receive_loop(
    socket: Arc<dyn DatagramSocket>,
    mut handler: DatagramHandler,
    config: Arc<LinkConfig>,
    mut stop: StopSignal,
) {
    info!("starting receive loop");

    let mut buf = vec![0u8; config.receive_buffer_size];
    let mut backoff = FailureBackoff::new(config.send_backoff_initial, config.send_backoff_max, config.sustained_failure_threshold);
    loop {
        let received = select! {
            _ = stop.triggered() => break,
            r = timeout(config.receive_timeout, socket.recv_datagram(&mut buf)) => r,
        };

        match received {
            Err(_) => trace!("no datagram within {:?}", config.receive_timeout),
            Ok(Ok((len, from))) => {
                backoff.on_success();
                handler.on_datagram(&buf[..len], from, Instant::now());
            }
            Ok(Err(e)) => {
                let delay = backoff.on_failure();
                if backoff.just_became_sustained() {
                    error!("receiving failed {} times in a row, latest error: {}", backoff.consecutive_failures(), e);
                }
                else {
                    error!("socket error: {}", e);
                }
                select! {
                    _ = stop.triggered() => break,
                    _ = sleep(delay) => {}
                }
            }
        }

        handler.on_tick(Instant::now());
    }

    handler.consumer_queue.close();
    info!("receive loop stopped: {:?}", handler.reassembler.stats());
}

/// Hands reassembled frames to the sink until the queue is closed and drained
pub async fn consumer_loop(
    consumer_queue: Arc<RelayQueue<ReassembledFrame>>,
    sink: Arc<dyn FrameSink>,
    stats: Arc<SessionStats>,
    config: Arc<LinkConfig>,
    stop: StopSignal,
) {
    info!("starting consumer loop");

    loop {
        match consumer_queue.dequeue(config.dequeue_timeout).await {
            Dequeued::Item(entry) => {
                let msg_id = entry.item.msg_id.clone();
                match sink.on_frame(entry.item).await {
                    Ok(()) => {
                        SessionStats::inc(&stats.frames_delivered);
                    }
                    Err(e) => {
                        SessionStats::inc(&stats.consumer_failures);
                        warn!("consumer failed to process message {}: {}", msg_id, e);
                    }
                }
            }
            Dequeued::Timeout => {
                if stop.is_triggered() {
                    break;
                }
            }
            Dequeued::Closed => break,
        }
    }

    info!("consumer loop stopped");
}
