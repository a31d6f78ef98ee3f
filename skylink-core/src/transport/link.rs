//! Framed, heartbeated link to one peer.
//!
//! ```text
//!   LinkSender ──push──► SendQueue ──notify──► writer task ──► FramedWrite
//!                            ▲
//!   heartbeat task ──────────┤ (Heartbeat)
//!   reader task ─────────────┘ (HeartbeatAck)
//!        │
//!        └──► inbound mpsc ──► Link::recv
//! ```
//!
//! Heartbeats and their acks are consumed inside the link; everything
//! else is handed to the owner in arrival order. A framing error closes
//! the link in the `Error` state, a peer EOF or missed heartbeats in the
//! `Disconnected` state. Both are terminal.
//!
//! Once session keys are installed every packet is sealed as it enters
//! the queue, and inbound `Sealed` frames are opened before the owner
//! sees them. After the first sealed frame from the peer, plaintext is a
//! protocol violation.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::codec::FrameCodec;
use crate::crypto::{Opener, Sealer, SessionKeys};
use crate::encoder::EncodedPacket;
use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::Packet;
use crate::protocol::{ControlMessage, InputEvent, VideoPayload};
use crate::transport::p2p::AsyncStream;
use crate::transport::queue::{DEFAULT_VIDEO_BOUND, PushOutcome, SendQueue};

/// RTT samples kept between two quality samples.
const RTT_HISTORY: usize = 64;

/// How long the reader holds a sealed frame that arrived before the
/// local keys were installed.
const KEY_INSTALL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub heartbeat_interval: Duration,
    /// Outstanding heartbeats at a tick that mark the peer as gone.
    pub max_missed_heartbeats: usize,
    pub video_queue_bound: usize,
    pub inbound_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            max_missed_heartbeats: 3,
            video_queue_bound: DEFAULT_VIDEO_BOUND,
            inbound_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Connected,
    Disconnected,
    Error,
}

// ── LinkStats ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LinkStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    video_sent: AtomicU64,
    video_dropped: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_acked: AtomicU64,
    /// Heartbeats still unanswered when the next one was due.
    heartbeats_missed: AtomicU64,
    rtt: Mutex<VecDeque<Duration>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub video_sent: u64,
    pub video_dropped: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_acked: u64,
    pub heartbeats_missed: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            video_sent: self.video_sent.load(Ordering::Relaxed),
            video_dropped: self.video_dropped.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_acked: self.heartbeats_acked.load(Ordering::Relaxed),
            heartbeats_missed: self.heartbeats_missed.load(Ordering::Relaxed),
        }
    }

    /// RTT samples measured since the previous call, oldest first.
    pub fn drain_rtt(&self) -> Vec<Duration> {
        self.rtt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn record_rtt(&self, rtt: Duration) {
        let mut samples = self.rtt.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == RTT_HISTORY {
            samples.pop_front();
        }
        samples.push_back(rtt);
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// Send queue and sealer behind one lock, so counters follow queue order.
struct Outbound {
    queue: SendQueue,
    sealer: Option<Sealer>,
}

impl Outbound {
    fn seal(&mut self, packet: Packet) -> Result<Packet, SkyError> {
        match self.sealer.as_mut() {
            Some(sealer) => sealer.seal(&packet),
            None => Ok(packet),
        }
    }
}

struct Shared {
    outbound: Mutex<Outbound>,
    wake: Notify,
    opener: Mutex<Option<Opener>>,
    keyed: watch::Sender<bool>,
    stats: Arc<LinkStats>,
    state: watch::Sender<LinkState>,
    outstanding: Mutex<BTreeSet<u64>>,
    epoch: Instant,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outstanding(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leave `Connected` at most once; terminal states stick.
    fn set_state(&self, next: LinkState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == LinkState::Connected && next != LinkState::Connected {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(state = ?next, "link state changed");
        }
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == LinkState::Connected
    }

    fn enqueue_control(&self, packet: Packet) -> Result<(), SkyError> {
        {
            let mut out = self.outbound();
            if out.queue.is_closed() || !self.is_connected() {
                return Err(SkyError::ChannelClosed);
            }
            let packet = out.seal(packet)?;
            out.queue.push_control(packet);
        }
        self.wake.notify_one();
        Ok(())
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

// ── LinkSender ───────────────────────────────────────────────────

/// Cloneable sending half. The link shuts down once every sender and the
/// [`Link`] itself are gone.
#[derive(Clone)]
pub struct LinkSender {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl LinkSender {
    /// Queue an encoded frame. A drop is not an error: it is reported in
    /// the outcome and may raise a keyframe request.
    pub fn send_video(&self, packet: &EncodedPacket) -> Result<PushOutcome, SkyError> {
        let wire = VideoPayload::from(packet).into_packet()?;
        let outcome = {
            let mut out = self.shared.outbound();
            if out.queue.is_closed() || !self.shared.is_connected() {
                return Err(SkyError::ChannelClosed);
            }
            let wire = out.seal(wire)?;
            out.queue.push_video(wire, packet.is_keyframe)
        };
        if outcome.dropped() {
            self.shared.stats.video_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = packet.sequence, ?outcome, "send queue full, frame dropped");
        }
        self.shared.wake.notify_one();
        Ok(outcome)
    }

    pub fn send_control(&self, message: ControlMessage) -> Result<(), SkyError> {
        self.shared.enqueue_control(message.into_packet()?)
    }

    pub fn send_input(&self, event: InputEvent) -> Result<(), SkyError> {
        self.shared.enqueue_control(event.into_packet()?)
    }

    /// Seal everything queued from now on and open the peer's sealed
    /// frames. `last_plain` is queued in clear just before the switch,
    /// with no packet able to slip in between.
    pub fn install_keys(
        &self,
        keys: SessionKeys,
        last_plain: Option<ControlMessage>,
    ) -> Result<(), SkyError> {
        let (sealer, opener) = keys.split();
        let last_plain = last_plain.map(ControlMessage::into_packet).transpose()?;
        {
            let mut out = self.shared.outbound();
            if out.queue.is_closed() || !self.shared.is_connected() {
                return Err(SkyError::ChannelClosed);
            }
            if let Some(packet) = last_plain {
                out.queue.push_control(packet);
            }
            out.sealer = Some(sealer);
        }
        *self
            .shared
            .opener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(opener);
        self.shared.keyed.send_replace(true);
        self.shared.wake.notify_one();
        debug!("session keys installed");
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        *self.shared.keyed.borrow()
    }

    /// `true` once after a drop that no queued keyframe covers, as soon
    /// as the video backlog is below the bound.
    pub fn take_keyframe_request(&self) -> bool {
        self.shared.outbound().queue.take_keyframe_request()
    }

    pub fn video_backlog(&self) -> usize {
        self.shared.outbound().queue.video_backlog()
    }

    /// The video backlog is at the bound; a new frame would displace one.
    pub fn video_congested(&self) -> bool {
        self.shared.outbound().queue.is_video_full()
    }

    pub fn stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Send `Goodbye`, let the writer drain the queue, then stop every
    /// link task. The writer is aborted if it does not finish in time.
    pub async fn close(&self, reason: &str, timeout: Duration) {
        if self.shared.is_connected() {
            let bye = ControlMessage::Goodbye {
                reason: reason.to_string(),
            };
            if let Err(e) = self.send_control(bye) {
                debug!(error = %e, "goodbye not queued");
            }
        }
        self.shared.outbound().queue.close();
        self.shared.wake.notify_one();

        let writer = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let abort = writer.abort_handle();
            if tokio::time::timeout(timeout, writer).await.is_err() {
                warn!(?timeout, "link writer did not drain in time, aborting");
                abort.abort();
            }
        }
        self.shared.set_state(LinkState::Disconnected);
        self.shared.cancel.cancel();
    }
}

// ── Link ─────────────────────────────────────────────────────────

pub struct Link {
    sender: LinkSender,
    inbound: mpsc::Receiver<Packet>,
}

impl Link {
    /// Take over `stream` and start the reader, writer and heartbeat tasks.
    pub fn new<S>(stream: S, config: LinkConfig) -> Self
    where
        S: AsyncStream + 'static,
    {
        let (sink, source) = Framed::new(stream, FrameCodec).split();
        let (state_tx, _) = watch::channel(LinkState::Connected);
        let (inbound_tx, inbound) = mpsc::channel(config.inbound_capacity.max(1));
        let cancel = CancellationToken::new();

        let (keyed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            outbound: Mutex::new(Outbound {
                queue: SendQueue::new(config.video_queue_bound),
                sealer: None,
            }),
            wake: Notify::new(),
            opener: Mutex::new(None),
            keyed,
            stats: Arc::new(LinkStats::default()),
            state: state_tx,
            outstanding: Mutex::new(BTreeSet::new()),
            epoch: Instant::now(),
            cancel: cancel.clone(),
            writer: Mutex::new(None),
        });

        let writer = tokio::spawn(write_loop(sink, Arc::clone(&shared)));
        *shared.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
        tokio::spawn(read_loop(source, Arc::clone(&shared), inbound_tx));
        tokio::spawn(heartbeat_loop(Arc::clone(&shared), config));

        Self {
            sender: LinkSender {
                shared,
                _guard: Arc::new(cancel.drop_guard()),
            },
            inbound,
        }
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Next non-heartbeat packet; `None` once the link has stopped.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.inbound.recv().await
    }

    pub fn state(&self) -> LinkState {
        self.sender.state()
    }

    pub fn into_split(self) -> (LinkSender, mpsc::Receiver<Packet>) {
        (self.sender, self.inbound)
    }
}

// ── Tasks ────────────────────────────────────────────────────────

type FrameSink<S> = futures::stream::SplitSink<Framed<S, FrameCodec>, Packet>;
type FrameSource<S> = futures::stream::SplitStream<Framed<S, FrameCodec>>;

async fn write_loop<S: AsyncStream>(mut sink: FrameSink<S>, shared: Arc<Shared>) {
    'outer: loop {
        loop {
            let Some((packet, is_video)) = shared.outbound().queue.pop() else {
                break;
            };
            let bytes = packet.wire_len() as u64;
            if let Err(e) = sink.send(packet).await {
                warn!(error = %e, "link write failed");
                shared.set_state(LinkState::Disconnected);
                shared.cancel.cancel();
                break 'outer;
            }
            shared.stats.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            if is_video {
                shared.stats.video_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        if shared.outbound().queue.is_closed() {
            break;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "link shutdown");
    }
}

async fn read_loop<S: AsyncStream>(
    mut source: FrameSource<S>,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<Packet>,
) {
    let mut inbound_keys = InboundKeys::new(&shared);
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = source.next() => next,
        };
        let packet = match next {
            Some(Ok(packet)) => packet,
            Some(Err(SkyError::Connection(e))) => {
                warn!(error = %e, "link read failed");
                shared.set_state(LinkState::Disconnected);
                break;
            }
            Some(Err(e)) => {
                error!(error = %e, "framing error, closing link");
                shared.set_state(LinkState::Error);
                break;
            }
            None => {
                info!("peer closed the link");
                shared.set_state(LinkState::Disconnected);
                break;
            }
        };
        shared
            .stats
            .bytes_received
            .fetch_add(packet.wire_len() as u64, Ordering::Relaxed);

        let packet = match inbound_keys.unwrap(packet).await {
            Ok(packet) => packet,
            Err(e) => {
                error!(error = %e, "rejected inbound frame, closing link");
                shared.set_state(LinkState::Error);
                break;
            }
        };

        if packet.kind() == MessageType::Control {
            match ControlMessage::from_bytes(packet.payload()) {
                Ok(ControlMessage::Heartbeat { seq, sent_at_us }) => {
                    let ack = ControlMessage::HeartbeatAck { seq, sent_at_us };
                    if let Err(e) = ack.into_packet().and_then(|p| shared.enqueue_control(p)) {
                        debug!(error = %e, "heartbeat ack not sent");
                    }
                    continue;
                }
                Ok(ControlMessage::HeartbeatAck { seq, sent_at_us }) => {
                    if shared.outstanding().remove(&seq) {
                        let rtt = Duration::from_micros(shared.now_us().saturating_sub(sent_at_us));
                        shared.stats.heartbeats_acked.fetch_add(1, Ordering::Relaxed);
                        shared.stats.record_rtt(rtt);
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "malformed control message, closing link");
                    shared.set_state(LinkState::Error);
                    break;
                }
            }
        }

        if inbound.send(packet).await.is_err() {
            // Owner stopped listening; keep answering heartbeats.
            debug!("inbound receiver dropped");
        }
    }
    shared.cancel.cancel();
}

/// Reader-side view of the session keys.
struct InboundKeys {
    shared: Arc<Shared>,
    keyed: watch::Receiver<bool>,
    opener: Option<Opener>,
    peer_sealed: bool,
}

impl InboundKeys {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::clone(shared),
            keyed: shared.keyed.subscribe(),
            opener: None,
            peer_sealed: false,
        }
    }

    fn take_installed(&mut self) -> Option<&mut Opener> {
        if self.opener.is_none() {
            self.opener = self
                .shared
                .opener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        self.opener.as_mut()
    }

    /// Open a sealed frame, or pass plaintext through while that is
    /// still allowed.
    async fn unwrap(&mut self, packet: Packet) -> Result<Packet, SkyError> {
        if packet.kind() != MessageType::Sealed {
            if self.peer_sealed {
                return Err(SkyError::ProtocolViolation(format!(
                    "plaintext {} frame on a sealed link",
                    packet.kind()
                )));
            }
            if self.take_installed().is_some() && !is_liveness(&packet) {
                return Err(SkyError::ProtocolViolation(format!(
                    "plaintext {} frame after key agreement",
                    packet.kind()
                )));
            }
            return Ok(packet);
        }

        if self.take_installed().is_none() {
            // The peer may switch before our own install has run.
            tokio::time::timeout(KEY_INSTALL_WAIT, self.keyed.wait_for(|k| *k))
                .await
                .map_err(|_| SkyError::Crypto("sealed frame before key agreement".into()))?
                .map_err(|_| SkyError::ChannelClosed)?;
        }
        let opener = self
            .take_installed()
            .ok_or_else(|| SkyError::Crypto("sealed frame before key agreement".into()))?;
        let inner = opener.open(&packet)?;
        self.peer_sealed = true;
        Ok(inner)
    }
}

fn is_liveness(packet: &Packet) -> bool {
    packet.kind() == MessageType::Control
        && ControlMessage::from_bytes(packet.payload()).is_ok_and(|m| m.is_liveness())
}

async fn heartbeat_loop(shared: Arc<Shared>, config: LinkConfig) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let missed = {
            let outstanding = shared.outstanding();
            if outstanding.contains(&seq) {
                shared.stats.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
            }
            outstanding.len()
        };
        if missed >= config.max_missed_heartbeats {
            warn!(missed, interval = ?config.heartbeat_interval, "heartbeat timeout");
            shared.set_state(LinkState::Disconnected);
            shared.cancel.cancel();
            break;
        }

        seq += 1;
        shared.outstanding().insert(seq);
        let heartbeat = ControlMessage::Heartbeat {
            seq,
            sent_at_us: shared.now_us(),
        };
        match heartbeat.into_packet().and_then(|p| shared.enqueue_control(p)) {
            Ok(()) => {
                shared.stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::CodecTag;
    use crate::protocol::{Message, MouseEvent};
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    fn fast() -> LinkConfig {
        LinkConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..LinkConfig::default()
        }
    }

    fn encoded(sequence: u64, is_keyframe: bool) -> EncodedPacket {
        EncodedPacket {
            sequence,
            pts: Duration::from_millis(sequence * 33),
            width: 1280,
            height: 720,
            codec: CodecTag::H264,
            is_keyframe,
            data: Bytes::from(vec![sequence as u8; 100]),
        }
    }

    #[tokio::test]
    async fn video_arrives_intact() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let host = Link::new(a, LinkConfig::default());
        let mut viewer = Link::new(b, LinkConfig::default());

        let packet = encoded(1, true);
        assert_eq!(host.sender().send_video(&packet).unwrap(), PushOutcome::Queued);

        let received = viewer.recv().await.unwrap();
        assert_eq!(received.kind(), MessageType::VideoPacket);
        match Message::decode(&received).unwrap() {
            Message::Video(v) => {
                assert_eq!(v.data, packet.data.to_vec());
                assert!(v.is_keyframe);
                assert_eq!(v.codec, CodecTag::H264);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_preserves_arrival_order() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let viewer = Link::new(a, LinkConfig::default());
        let mut host = Link::new(b, LinkConfig::default());

        for x in 0..20 {
            viewer
                .sender()
                .send_input(InputEvent::Mouse(MouseEvent::move_to(x, 0)))
                .unwrap();
        }
        for x in 0..20 {
            match Message::decode(&host.recv().await.unwrap()).unwrap() {
                Message::Input(InputEvent::Mouse(m)) => assert_eq!(m.x, x),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn heartbeats_are_answered() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let left = Link::new(a, fast());
        let _right = Link::new(b, fast());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = left.sender().stats().snapshot();
        assert!(stats.heartbeats_acked > 0);
        assert_eq!(left.state(), LinkState::Connected);
        assert!(!left.sender().stats().drain_rtt().is_empty());
    }

    #[tokio::test]
    async fn silent_peer_disconnects() {
        let (a, _silent) = tokio::io::duplex(1 << 16);
        let link = Link::new(a, fast());
        let mut state = link.sender().watch_state();

        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == LinkState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(link.sender().send_control(ControlMessage::RequestKeyframe).is_err());
    }

    #[tokio::test]
    async fn unknown_type_tag_is_an_error() {
        let (a, mut raw) = tokio::io::duplex(1 << 16);
        let link = Link::new(a, LinkConfig::default());
        let mut state = link.sender().watch_state();

        raw.write_all(&[0, 0, 0, 1, 0x7F, 0]).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == LinkState::Error),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn close_sends_goodbye() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let host = Link::new(a, LinkConfig::default());
        let mut viewer = Link::new(b, LinkConfig::default());

        host.sender().close("done", Duration::from_secs(1)).await;
        assert_eq!(host.state(), LinkState::Disconnected);

        match Message::decode(&viewer.recv().await.unwrap()).unwrap() {
            Message::Control(ControlMessage::Goodbye { reason }) => assert_eq!(reason, "done"),
            other => panic!("unexpected {other:?}"),
        }
        let mut state = viewer.sender().watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == LinkState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn keyed_pair() -> (SessionKeys, SessionKeys) {
        use crate::crypto::{KeyExchange, Role};
        let a = KeyExchange::new();
        let b = KeyExchange::new();
        let (a_share, b_share) = (a.key_share().to_vec(), b.key_share().to_vec());
        (
            a.agree(Role::Initiator, &b_share).unwrap(),
            b.agree(Role::Responder, &a_share).unwrap(),
        )
    }

    #[tokio::test]
    async fn sealed_links_carry_video_and_input() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let host = Link::new(a, LinkConfig::default());
        let mut viewer = Link::new(b, LinkConfig::default());
        let (host_keys, viewer_keys) = keyed_pair();
        host.sender().install_keys(host_keys, None).unwrap();
        viewer.sender().install_keys(viewer_keys, None).unwrap();
        assert!(host.sender().is_sealed());

        host.sender().send_video(&encoded(3, true)).unwrap();
        match Message::decode(&viewer.recv().await.unwrap()).unwrap() {
            Message::Video(v) => assert_eq!(v.sequence, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(host.sender().stats().snapshot().video_sent, 1);
    }

    #[tokio::test]
    async fn tampered_or_plaintext_frame_after_sealing_is_an_error() {
        use futures::SinkExt;

        for tamper in [true, false] {
            let (a, raw) = tokio::io::duplex(1 << 16);
            let link = Link::new(a, LinkConfig::default());
            let mut state = link.sender().watch_state();
            let (link_keys, peer_keys) = keyed_pair();
            link.sender().install_keys(link_keys, None).unwrap();
            let (mut sealer, _) = peer_keys.split();

            let mut wire = Framed::new(raw, FrameCodec);
            let keyframe = ControlMessage::RequestKeyframe.into_packet().unwrap();
            wire.send(sealer.seal(&keyframe).unwrap()).await.unwrap();
            if tamper {
                let mut bytes = sealer.seal(&keyframe).unwrap().payload().to_vec();
                bytes[10] ^= 0xff;
                wire.send(Packet::new(MessageType::Sealed, bytes).unwrap())
                    .await
                    .unwrap();
            } else {
                wire.send(keyframe).await.unwrap();
            }

            tokio::time::timeout(
                Duration::from_secs(2),
                state.wait_for(|s| *s == LinkState::Error),
            )
            .await
            .unwrap()
            .unwrap();
        }
    }
}
