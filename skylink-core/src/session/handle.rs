//! A running session and the supervisor that owns its tasks.
//!
//! ```text
//!                        ┌──► Pipeline::run ───────────────┐
//!  SessionHandle::spawn ─┼──► dispatch_inbound (input)     ├─► first to end ─► teardown
//!                        ├──► QualityMonitor::run          │     cancel, link.close,
//!                        └──► link state watch ────────────┘     final state
//! ```
//!
//! Teardown is bounded: tasks that do not finish within the teardown
//! timeout are aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::CaptureSource;
use crate::encoder::{CompressionBackend, EncodingConfiguration};
use crate::error::{FailureReason, SkyError};
use crate::packet::Packet;
use crate::protocol::{ControlMessage, Message, PeerIdentity};
use crate::quality::{DEFAULT_SAMPLE_INTERVAL, QualityMonitor};
use crate::session::collab::InputInjector;
use crate::session::pipeline::{Pipeline, PipelineCommand, PipelineConfig};
use crate::session::state::{SessionInfo, SessionState, SessionStatus};
use crate::transport::{LinkConfig, LinkSender, LinkState, PathKind};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub pipeline: PipelineConfig,
    pub sample_interval: Duration,
    pub teardown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            pipeline: PipelineConfig::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            teardown_timeout: Duration::from_secs(3),
        }
    }
}

/// Everything a session is built from.
pub struct SessionParts {
    pub id: Uuid,
    pub peer: PeerIdentity,
    pub remote_addr: Option<SocketAddr>,
    pub path: PathKind,
    pub link: LinkSender,
    pub inbound: mpsc::Receiver<Packet>,
    pub source: Box<dyn CaptureSource>,
    pub backend: Arc<dyn CompressionBackend>,
    pub injector: Arc<dyn InputInjector>,
}

pub struct SessionHandle {
    status: Arc<SessionStatus>,
    commands: mpsc::Sender<PipelineCommand>,
    cancel: CancellationToken,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    teardown_timeout: Duration,
}

impl SessionHandle {
    /// Build the pipeline and start every session task.
    pub fn spawn(
        parts: SessionParts,
        config: SessionConfig,
        status: Arc<SessionStatus>,
    ) -> Result<Self, SkyError> {
        status.set_peer(parts.peer.clone(), parts.remote_addr, Some(parts.path));
        let pipeline = Pipeline::new(
            parts.source,
            parts.backend,
            config.pipeline,
            parts.link.clone(),
            Arc::clone(&status),
        )?;

        let (commands, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(Supervised {
            pipeline,
            command_rx,
            commands: commands.clone(),
            link: parts.link,
            inbound: parts.inbound,
            injector: parts.injector,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            config,
        }));
        info!(
            session = %parts.id,
            peer = %parts.peer.name,
            path = %parts.path,
            "session started"
        );

        Ok(Self {
            status,
            commands,
            cancel,
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
            teardown_timeout: config.teardown_timeout,
        })
    }

    pub fn id(&self) -> Uuid {
        self.status.id()
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    pub fn info(&self) -> SessionInfo {
        self.status.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<SessionInfo> {
        self.status.watch()
    }

    pub fn is_finished(&self) -> bool {
        self.status.state().is_terminal()
    }

    /// Apply new user encoding settings between frames.
    pub async fn update_encoding(&self, config: EncodingConfiguration) -> Result<(), SkyError> {
        self.commands
            .send(PipelineCommand::UpdateEncoding(config))
            .await?;
        Ok(())
    }

    pub async fn request_keyframe(&self) -> Result<(), SkyError> {
        self.commands.send(PipelineCommand::RequestKeyframe).await?;
        Ok(())
    }

    /// Stop the session and wait for teardown. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait until the session has ended on its own or been stopped.
    pub async fn join(&self) {
        let Some(mut supervisor) = self.supervisor.lock().await.take() else {
            return;
        };
        // Capture stop, encoder shutdown and link close each get one
        // teardown timeout.
        let bound = self.teardown_timeout * 3 + Duration::from_millis(100);
        let finished = if self.cancel.is_cancelled() {
            tokio::time::timeout(bound, &mut supervisor).await.is_ok()
        } else {
            tokio::select! {
                _ = &mut supervisor => true,
                _ = self.cancel.cancelled() => {
                    tokio::time::timeout(bound, &mut supervisor).await.is_ok()
                }
            }
        };
        if !finished {
            warn!(session = %self.id(), "session teardown timed out, aborting");
            supervisor.abort();
            if !self.state().is_terminal() {
                let _ = self
                    .status
                    .transition(SessionState::Failed(FailureReason::ConnectionFailed));
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Supervisor ───────────────────────────────────────────────────

struct Supervised {
    pipeline: Pipeline,
    command_rx: mpsc::Receiver<PipelineCommand>,
    commands: mpsc::Sender<PipelineCommand>,
    link: LinkSender,
    inbound: mpsc::Receiver<Packet>,
    injector: Arc<dyn InputInjector>,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
    config: SessionConfig,
}

#[derive(Debug)]
enum DispatchEnd {
    Goodbye(String),
    LinkClosed,
    Violation(String),
}

async fn supervise(s: Supervised) {
    let Supervised {
        pipeline,
        command_rx,
        commands,
        link,
        inbound,
        injector,
        status,
        cancel,
        config,
    } = s;

    let (sample_tx, sample_rx) = mpsc::channel(8);
    let monitor = tokio::spawn(QualityMonitor::new(link.stats()).run(
        link.clone(),
        config.sample_interval,
        sample_tx,
        cancel.child_token(),
    ));
    let mut pipeline_task = tokio::spawn(pipeline.run(command_rx, sample_rx, cancel.child_token()));
    let mut dispatch_task = tokio::spawn(dispatch_inbound(
        inbound,
        injector,
        commands,
        Arc::clone(&status),
    ));
    let mut link_state = link.watch_state();

    let mut pipeline_done = false;
    let end: Result<(), FailureReason> = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = &mut pipeline_task => {
            pipeline_done = true;
            match result {
                Ok(Ok(())) => Ok(()),
                // The link went away under the pipeline.
                Ok(Err(SkyError::ChannelClosed)) => link_outcome(link.state()),
                Ok(Err(e)) => {
                    status.record_error(e.to_string());
                    Err(FailureReason::from_error(&e))
                }
                Err(e) => {
                    error!(session = %status.id(), error = %e, "pipeline task panicked");
                    status.record_error(e.to_string());
                    Err(FailureReason::Internal)
                }
            }
        }
        result = &mut dispatch_task => match result {
            Ok(DispatchEnd::Goodbye(reason)) => {
                info!(session = %status.id(), %reason, "peer said goodbye");
                Ok(())
            }
            Ok(DispatchEnd::Violation(reason)) => {
                warn!(session = %status.id(), %reason, "protocol violation");
                status.record_error(reason);
                Err(FailureReason::ProtocolViolation)
            }
            Ok(DispatchEnd::LinkClosed) | Err(_) => link_outcome(link.state()),
        },
        _ = link_state.wait_for(|s| *s != LinkState::Connected) => link_outcome(link.state()),
    };

    // Teardown.
    cancel.cancel();
    dispatch_task.abort();
    if !pipeline_done {
        let bound = config.teardown_timeout * 2;
        let abort = pipeline_task.abort_handle();
        match tokio::time::timeout(bound, pipeline_task).await {
            Ok(Ok(Err(e))) if !matches!(e, SkyError::ChannelClosed) => {
                debug!(error = %e, "pipeline error during teardown");
            }
            Ok(_) => {}
            Err(_) => {
                warn!(?bound, "pipeline teardown timed out, aborting");
                abort.abort();
            }
        }
    }
    let reason = match &end {
        Ok(()) => "session ended".to_string(),
        Err(reason) => reason.to_string(),
    };
    link.close(&reason, config.teardown_timeout).await;
    monitor.abort();

    let final_state = match end {
        Ok(()) => SessionState::Disconnected,
        Err(reason) => SessionState::Failed(reason),
    };
    if let Err(e) = status.transition(final_state) {
        debug!(error = %e, "final state not applied");
    }
}

fn link_outcome(state: LinkState) -> Result<(), FailureReason> {
    match state {
        LinkState::Error => Err(FailureReason::ProtocolViolation),
        LinkState::Connected | LinkState::Disconnected => Ok(()),
    }
}

/// Hand input to the injector in arrival order and route control
/// messages. Ends on Goodbye, a malformed payload or a closed link.
async fn dispatch_inbound(
    mut inbound: mpsc::Receiver<Packet>,
    injector: Arc<dyn InputInjector>,
    commands: mpsc::Sender<PipelineCommand>,
    status: Arc<SessionStatus>,
) -> DispatchEnd {
    while let Some(packet) = inbound.recv().await {
        status.touch();
        let message = match Message::decode(&packet) {
            Ok(m) => m,
            Err(e) => return DispatchEnd::Violation(format!("undecodable {}: {e}", packet.kind())),
        };
        match message {
            Message::Input(event) => {
                if let Err(e) = injector.inject(&event) {
                    debug!(error = %e, "input injection failed");
                }
            }
            Message::Control(ControlMessage::RequestKeyframe) => {
                if commands.send(PipelineCommand::RequestKeyframe).await.is_err() {
                    return DispatchEnd::LinkClosed;
                }
            }
            Message::Control(ControlMessage::Goodbye { reason }) => {
                return DispatchEnd::Goodbye(reason);
            }
            Message::Control(ControlMessage::Hello { .. }) => {
                return DispatchEnd::Violation("Hello after handshake".into());
            }
            Message::Control(other) => debug!(?other, "ignoring control message"),
            Message::Video(_) => debug!("ignoring inbound video"),
        }
    }
    DispatchEnd::LinkClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSettings, Resolution, SyntheticSource};
    use crate::encoder::{
        CodecProfile, CompressionBackend, CompressionSession, OutputSink, SessionParameters,
        SimulatedBackend,
    };
    use crate::processor::ProcessedBuffer;
    use crate::protocol::{InputEvent, MouseEvent};
    use crate::transport::Link;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<InputEvent>>);

    impl InputInjector for Recorder {
        fn inject(&self, event: &InputEvent) -> Result<(), SkyError> {
            self.0.lock().unwrap().push(*event);
            Ok(())
        }
    }

    fn config() -> SessionConfig {
        let mut cfg = SessionConfig::default();
        cfg.pipeline.capture = CaptureSettings {
            resolution: Resolution::new(64, 32),
            frame_rate: 30,
            region: None,
        };
        cfg.pipeline.encoding.resolution = Resolution::new(64, 32);
        cfg.sample_interval = Duration::from_millis(50);
        cfg
    }

    /// Creates sessions that panic on the first frame.
    struct PanickingBackend;

    struct PanickingSession;

    impl CompressionBackend for PanickingBackend {
        fn name(&self) -> &str {
            "panicking"
        }

        fn create_session(
            &self,
            _profile: CodecProfile,
            _params: &SessionParameters,
            _sink: OutputSink,
        ) -> Result<Box<dyn CompressionSession>, SkyError> {
            Ok(Box::new(PanickingSession))
        }
    }

    impl CompressionSession for PanickingSession {
        fn submit(
            &mut self,
            _buffer: &ProcessedBuffer,
            _pts: Duration,
            _force_keyframe: bool,
        ) -> Result<(), SkyError> {
            panic!("codec crashed");
        }

        fn set_bitrate(&mut self, _bitrate_bps: u32) -> Result<(), SkyError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), SkyError> {
            Ok(())
        }

        fn invalidate(&mut self) {}
    }

    fn spawn(
        stream: tokio::io::DuplexStream,
        injector: Arc<dyn InputInjector>,
    ) -> (SessionHandle, Arc<std::sync::atomic::AtomicUsize>) {
        spawn_with(stream, injector, Arc::new(SimulatedBackend::new()))
    }

    fn spawn_with(
        stream: tokio::io::DuplexStream,
        injector: Arc<dyn InputInjector>,
        backend: Arc<dyn CompressionBackend>,
    ) -> (SessionHandle, Arc<std::sync::atomic::AtomicUsize>) {
        let cfg = config();
        let (link, inbound) = Link::new(stream, cfg.link).into_split();
        let source = SyntheticSource::new(Resolution::new(64, 32));
        let handles = source.open_handles();
        let (events, _) = broadcast::channel(64);
        let id = Uuid::new_v4();
        let status = Arc::new(SessionStatus::new(id, events));
        let parts = SessionParts {
            id,
            peer: PeerIdentity {
                device_id: Uuid::new_v4(),
                name: "viewer".into(),
                platform: "linux".into(),
                pub_key_fp: None,
            },
            remote_addr: None,
            path: PathKind::Direct,
            link,
            inbound,
            source: Box::new(source),
            backend,
            injector,
        };
        (SessionHandle::spawn(parts, cfg, status).unwrap(), handles)
    }

    async fn wait_state(handle: &SessionHandle, want: SessionState) {
        let mut rx = handle.watch();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|i| i.state == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn input_reaches_injector_in_order_and_goodbye_ends_session() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let recorder = Arc::new(Recorder::default());
        let (handle, handles) = spawn(a, recorder.clone());
        let viewer = Link::new(b, LinkConfig::default());
        wait_state(&handle, SessionState::Connected).await;

        let tx = viewer.sender();
        for i in 0..20 {
            tx.send_input(InputEvent::Mouse(MouseEvent::move_to(i, i)))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen: Vec<i32> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                InputEvent::Mouse(m) => m.x,
                InputEvent::Key(_) => -1,
            })
            .collect();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());

        tx.close("done", Duration::from_secs(1)).await;
        wait_state(&handle, SessionState::Disconnected).await;
        handle.join().await;
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_capture() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (handle, handles) = spawn(a, Arc::new(crate::session::LoggingInjector::new()));
        let _viewer = Link::new(b, LinkConfig::default());
        wait_state(&handle, SessionState::Connected).await;

        handle.stop().await;
        handle.stop().await;
        assert_eq!(handle.state(), SessionState::Disconnected);
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn garbage_from_peer_fails_the_session() {
        use tokio::io::AsyncWriteExt;

        let (a, b) = tokio::io::duplex(1 << 20);
        let (handle, _) = spawn(a, Arc::new(crate::session::LoggingInjector::new()));
        let (mut rd, mut wr) = tokio::io::split(b);
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut rd, &mut tokio::io::sink()).await;
        });
        wait_state(&handle, SessionState::Connected).await;

        // Length 1, unknown type tag 0x7f.
        wr.write_all(&[0, 0, 0, 1, 0x7f, 0]).await.unwrap();
        wait_state(
            &handle,
            SessionState::Failed(FailureReason::ProtocolViolation),
        )
        .await;
    }

    #[tokio::test]
    async fn panicked_pipeline_is_an_internal_failure() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (handle, _) = spawn_with(
            a,
            Arc::new(crate::session::LoggingInjector::new()),
            Arc::new(PanickingBackend),
        );
        let _viewer = Link::new(b, LinkConfig::default());

        wait_state(&handle, SessionState::Failed(FailureReason::Internal)).await;
    }
}
