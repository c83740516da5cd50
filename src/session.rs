//! # Session Lifecycle Manager
//!
//! Owns the call: creates the remote session, publishes its id, opens the
//! transport, starts the scheduler and capture, and takes it all down again
//! in reverse order.
//!
//! ## Start Order:
//! 1. `POST /sessions` for a new id
//! 2. Publish the id to the shared slot and to the poller
//! 3. Load the script and preload agent clips
//! 4. Open the transport; its open instant becomes the session start
//! 5. Start the turn scheduler (first tick sets the gate)
//! 6. Start capture; frames flow capture -> gate -> transport
//!
//! ## End Order (user request, transport loss, or remote end):
//! 1. Stop capture, then the scheduler
//! 2. Close the transport
//! 3. Clear the shared slot
//! 4. Clear the local id, which returns the poller to `Idle`
//!
//! Every per-call resource is created fresh in `start()` and dropped in
//! `end()`; nothing is reused across calls.

use crate::api::SessionApi;
use crate::audio::{AgentPlayer, AudioFrame, AudioInput, PcmCapture};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::Session;
use crate::poller::{spawn_poller, PollerHandle, PollerState, StopReason};
use crate::scheduler::{ClipCache, SchedulerHandle, TurnScheduler, TurnState};
use crate::slot::SlotWriter;
use crate::transport::{Gate, Transport, TransportEvent, TransportState};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Builds a fresh microphone input for each call.
pub type InputFactory = Arc<dyn Fn() -> Box<dyn AudioInput> + Send + Sync>;

/// Why a call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// The user hung up
    UserRequested,
    /// The socket closed or failed without being asked to
    TransportLost(String),
    /// The poller found the session gone or inactive
    Remote(StopReason),
}

impl EndReason {
    /// The error to report for this ending, if it was not a normal hang-up.
    pub fn into_error(self) -> Option<AppError> {
        match self {
            EndReason::UserRequested | EndReason::Remote(StopReason::Ended) => None,
            EndReason::TransportLost(msg) => Some(AppError::Transport(msg)),
            EndReason::Remote(StopReason::NotFound) => {
                Some(AppError::SessionNotFound("session no longer exists".to_string()))
            }
            EndReason::Remote(StopReason::RiskFetchFailed(msg)) => Some(AppError::RiskFetchFailed(msg)),
            EndReason::Remote(StopReason::StatusFailed(msg)) => Some(AppError::Api(msg)),
        }
    }
}

/// Everything that exists only while a call is live.
struct ActiveCall {
    session: Session,
    capture: PcmCapture,
    transport: Arc<Transport>,
    scheduler: Option<SchedulerHandle>,
    forwarder: JoinHandle<()>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub struct SessionManager {
    config: AppConfig,
    api: Arc<dyn SessionApi>,
    player: Arc<dyn AgentPlayer>,
    input_factory: InputFactory,
    slot: SlotWriter,
    session_tx: watch::Sender<Option<String>>,
    poller: PollerHandle,
    active: Option<ActiveCall>,
}

impl SessionManager {
    pub fn new(
        config: AppConfig,
        api: Arc<dyn SessionApi>,
        player: Arc<dyn AgentPlayer>,
        input_factory: InputFactory,
        slot: SlotWriter,
    ) -> Self {
        let (session_tx, session_rx) = watch::channel(None);
        let poller = spawn_poller(api.clone(), config.risk_poll_interval(), session_rx);

        Self {
            config,
            api,
            player,
            input_factory,
            slot,
            session_tx,
            poller,
            active: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|call| &call.session)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_tx.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn transport_state(&self) -> Option<TransportState> {
        self.active.as_ref().map(|call| call.transport.state())
    }

    pub fn turn_state(&self) -> Option<TurnState> {
        self.active
            .as_ref()
            .and_then(|call| call.scheduler.as_ref())
            .map(|scheduler| scheduler.state())
    }

    pub fn agent_text(&self) -> Option<String> {
        self.active
            .as_ref()
            .and_then(|call| call.scheduler.as_ref())
            .and_then(|scheduler| scheduler.current_text())
    }

    pub fn poller_state(&self) -> watch::Receiver<PollerState> {
        self.poller.subscribe()
    }

    /// Start a call. Returns the new session id; a no-op returning the
    /// current id if a call is already running.
    pub async fn start(&mut self) -> AppResult<String> {
        if let Some(call) = &self.active {
            warn!("Call already active ({}), ignoring start", call.session.id);
            return Ok(call.session.id.clone());
        }

        let created = self.api.create_session(&self.config.api.user_id).await?;
        let session_id = created.session_id;
        info!("Starting call for session {}", session_id);

        if let Err(e) = self.slot.publish(&session_id).await {
            warn!("Could not publish session {} to shared slot: {}", session_id, e);
        }
        self.session_tx.send_replace(Some(session_id.clone()));

        match self.bring_up(&session_id).await {
            Ok(call) => {
                info!("Call live for session {}", session_id);
                self.active = Some(call);
                Ok(session_id)
            }
            Err(e) => {
                error!("Failed to start call {}: {}", session_id, e);
                self.release_identity().await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, session_id: &str) -> AppResult<ActiveCall> {
        let gate = Gate::new(true);
        let scheduler = self.load_scheduler(gate.clone()).await;

        let (events_tx, transport_events) = mpsc::unbounded_channel();
        let url = self.config.ws_audio_url(session_id);
        let transport = Arc::new(Transport::open(&url, session_id, gate, events_tx).await?);

        let mut session = Session::new(session_id.to_string());
        let start_time = Instant::now();
        session.start_time = Some(start_time);
        session.active = true;

        let scheduler = scheduler
            .map(|s| SchedulerHandle::spawn(s, start_time, self.config.scheduler_tick()));

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let mut capture = PcmCapture::streaming((self.input_factory)(), &self.config.audio, frame_tx);
        if let Err(e) = capture.start().await {
            let mut scheduler = scheduler;
            if let Some(s) = scheduler.as_mut() {
                s.stop();
            }
            transport.close().await;
            return Err(e);
        }

        let forwarder = tokio::spawn(forward_frames(frame_rx, transport.clone()));

        Ok(ActiveCall {
            session,
            capture,
            transport,
            scheduler,
            forwarder,
            transport_events,
        })
    }

    /// Script + clips, or `None` to run unscripted with the gate open.
    async fn load_scheduler(&self, gate: Gate) -> Option<TurnScheduler> {
        let script = match self.api.agent_script().await {
            Ok(script) => script,
            Err(e) => {
                warn!("No agent script, caller audio flows for the whole call: {}", e);
                return None;
            }
        };

        let clips = ClipCache::preload(
            self.api.as_ref(),
            &script.windows,
            &self.config.audio.agent_audio_format,
        )
        .await;

        match TurnScheduler::new(script, clips, self.player.clone(), gate) {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                warn!("Rejected agent script: {}", e);
                None
            }
        }
    }

    /// Wait until something other than the user ends the call.
    ///
    /// Pending forever when no call is active.
    pub async fn wait_for_end(&mut self) -> EndReason {
        let mut poller_rx = self.poller.subscribe();
        let Some(call) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        let session_id = call.session.id.clone();
        let mut events_open = true;

        loop {
            // The poller may already have stopped before we started waiting
            let stopped = {
                let state = poller_rx.borrow_and_update();
                if state.session_id.as_deref() == Some(session_id.as_str()) {
                    state.stop_reason.clone().filter(StopReason::ends_session)
                } else {
                    None
                }
            };
            if let Some(reason) = stopped {
                info!("Session {} ended remotely ({:?})", session_id, reason);
                return EndReason::Remote(reason);
            }

            tokio::select! {
                event = call.transport_events.recv(), if events_open => match event {
                    Some(event) => {
                        let error = event.into_error();
                        if error.is_session_terminal() {
                            warn!("Transport lost for session {}: {}", session_id, error);
                            return EndReason::TransportLost(error.to_string());
                        }
                        debug!("Transport reported {} for session {}, call continues", error, session_id);
                    }
                    None => events_open = false,
                },
                changed = poller_rx.changed() => {
                    if changed.is_err() {
                        return std::future::pending().await;
                    }
                }
            }
        }
    }

    /// End the current call. A no-op when idle.
    pub async fn end(&mut self, reason: EndReason) {
        let Some(mut call) = self.active.take() else {
            return;
        };
        info!("Ending call {} ({:?})", call.session.id, reason);

        if let Err(e) = call.capture.stop().await {
            warn!("Capture did not stop cleanly: {}", e);
        }
        if let Some(mut scheduler) = call.scheduler.take() {
            scheduler.stop();
        }
        call.forwarder.abort();
        call.transport.close().await;
        call.session.active = false;

        self.release_identity().await;
        info!("Call {} ended", call.session.id);
    }

    /// Clear the shared slot and the local id (the poller goes idle).
    async fn release_identity(&mut self) {
        if let Err(e) = self.slot.clear().await {
            warn!("Could not clear shared slot: {}", e);
        }
        self.session_tx.send_replace(None);
    }
}

async fn forward_frames(mut frames: mpsc::UnboundedReceiver<AudioFrame>, transport: Arc<Transport>) {
    while let Some(frame) = frames.recv().await {
        transport.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{inactive_status, FakeApi};
    use crate::audio::capture::testing::FakeInput;
    use crate::audio::playback::testing::RecordingPlayer;
    use crate::audio::processor::InputFormat;
    use crate::poller::PollerPhase;
    use crate::slot::SharedSlot;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    struct Harness {
        manager: SessionManager,
        api: Arc<FakeApi>,
        input: FakeInput,
        slot: SharedSlot,
        received: mpsc::UnboundedReceiver<Vec<u8>>,
        _dir: tempfile::TempDir,
    }

    /// WebSocket server accepting one connection; `close_after` closes it
    /// from the server side after that long.
    async fn spawn_ws(close_after: Option<Duration>) -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(delay) = close_after {
                tokio::time::sleep(delay).await;
                let _ = ws.close(None).await;
            }
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(bytes) => {
                        let _ = tx.send(bytes);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        (format!("ws://{}", addr), rx)
    }

    async fn harness(ws_url: String, received: mpsc::UnboundedReceiver<Vec<u8>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.api.ws_url = Some(ws_url);
        config.audio.frame_size = 4;
        config.timing.risk_poll_ms = 20;
        config.timing.scheduler_tick_ms = 50;

        let api = Arc::new(FakeApi::new());
        let input = FakeInput::new(InputFormat::new(16000, 1));
        let factory_input = input.clone();
        let factory: InputFactory = Arc::new(move || Box::new(factory_input.clone()) as Box<dyn AudioInput>);

        let slot = SharedSlot::open(dir.path(), "active_session_id").await.unwrap();
        let writer = slot.claim_writer().unwrap();
        let manager = SessionManager::new(
            config,
            api.clone(),
            Arc::new(RecordingPlayer::new()),
            factory,
            writer,
        );

        Harness {
            manager,
            api,
            input,
            slot,
            received,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_start_publishes_and_streams() {
        let (url, received) = spawn_ws(None).await;
        let mut h = harness(url, received).await;

        let id = h.manager.start().await.unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(h.slot.read().await.unwrap(), Some("abc123".to_string()));
        assert_eq!(h.manager.transport_state(), Some(TransportState::Open));
        assert!(h.manager.session().unwrap().start_time.is_some());
        assert!(h.input.is_open());
        assert_eq!(h.api.requests()[0], "create_session demo_user");

        // No script: the gate stays open and frames reach the server
        assert!(h.input.deliver(&[0.5, 0.5, 0.5, 0.5]));
        let bytes = tokio::time::timeout(Duration::from_secs(5), h.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.len(), 8);

        // Starting again is a no-op
        assert_eq!(h.manager.start().await.unwrap(), "abc123");
        assert_eq!(h.api.count("create_session"), 1);
    }

    #[tokio::test]
    async fn test_end_releases_everything_in_order() {
        let (url, received) = spawn_ws(None).await;
        let mut h = harness(url, received).await;
        h.manager.start().await.unwrap();

        h.manager.end(EndReason::UserRequested).await;
        assert!(!h.manager.is_active());
        assert!(!h.input.is_open());
        assert_eq!(h.slot.read().await.unwrap(), None);
        assert_eq!(h.manager.session_id(), None);

        let mut poller = h.manager.poller_state();
        poller
            .wait_for(|state| state.phase == PollerPhase::Idle)
            .await
            .unwrap();

        // Ending twice is harmless
        h.manager.end(EndReason::UserRequested).await;
    }

    #[tokio::test]
    async fn test_transport_failure_never_starts_capture() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_tx, received) = mpsc::unbounded_channel();
        let mut h = harness(format!("ws://{}", addr), received).await;

        let err = h.manager.start().await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
        assert_eq!(*h.input.opened.lock().unwrap(), 0);
        assert_eq!(h.slot.read().await.unwrap(), None);
        assert!(!h.manager.is_active());
    }

    #[tokio::test]
    async fn test_device_denied_tears_down_transport() {
        let (url, received) = spawn_ws(None).await;
        let mut h = harness(url, received).await;
        h.input.set_denied(true);

        let err = h.manager.start().await.unwrap_err();
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
        assert!(!h.manager.is_active());
        assert_eq!(h.slot.read().await.unwrap(), None);

        // The user can retry once the device is back
        h.input.set_denied(false);
        let (url, received) = spawn_ws(None).await;
        h.manager.config.api.ws_url = Some(url);
        h.received = received;
        assert!(h.manager.start().await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_end_is_detected() {
        let (url, received) = spawn_ws(None).await;
        let mut h = harness(url, received).await;
        h.api.push_status(Ok(inactive_status("abc123")));

        h.manager.start().await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), h.manager.wait_for_end())
            .await
            .unwrap();
        assert_eq!(reason, EndReason::Remote(StopReason::Ended));

        h.manager.end(reason).await;
        assert_eq!(h.slot.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_close_ends_call() {
        let (url, received) = spawn_ws(Some(Duration::from_millis(50))).await;
        let mut h = harness(url, received).await;

        h.manager.start().await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), h.manager.wait_for_end())
            .await
            .unwrap();
        assert!(matches!(reason, EndReason::TransportLost(_)));
        assert!(reason.into_error().is_some_and(|e| e.is_session_terminal()));
    }

    #[tokio::test]
    async fn test_scripted_call_gates_agent_turns() {
        let (url, received) = spawn_ws(None).await;
        let mut h = harness(url, received).await;
        *h.api.script.lock().unwrap() = Some(crate::api::testing::demo_script());
        h.api.clips.lock().unwrap().insert(0, vec![1, 2, 3]);

        h.manager.start().await.unwrap();
        let turn = h.manager.turn_state().unwrap();
        assert!(turn.agent_speaking);
        assert_eq!(turn.segment_index, Some(0));
        assert_eq!(h.manager.agent_text().as_deref(), Some("Hello, this is SecureBank."));

        // Agent window at t=0: caller audio is dropped
        h.input.deliver(&[0.5; 4]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.received.try_recv().is_err());
    }
}
