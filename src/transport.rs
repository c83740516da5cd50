//! # Duplex Audio Transport
//!
//! One WebSocket per call session, carrying caller PCM to the risk service.
//! Nothing useful ever comes back on this socket; risk data is polled over
//! HTTP instead.
//!
//! ## Connection States:
//! ```text
//! Connecting ──> Open ──> Closed
//!      │           │
//!      └──> Error <┘
//! ```
//!
//! ## Sending Policy:
//! - Frames are only accepted while `Open` and while the `Gate` is open
//! - A frame refused by the gate is dropped, never queued
//! - At most `OUTBOUND_QUEUE_FRAMES` frames wait for the socket writer; a
//!   frame arriving at a full queue is dropped and counted
//! - `close()` is idempotent and always ends in `Closed`
//! - A close or error the client did not ask for is reported once on the
//!   event channel; the transport never reconnects on its own

use crate::audio::AudioFrame;
use crate::error::{AppError, AppResult};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection state of the duplex socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
    Error,
}

/// Unsolicited end of the connection, reported to the lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server closed the socket
    Closed(String),
    /// The socket failed
    Failed(String),
}

impl TransportEvent {
    pub fn into_error(self) -> AppError {
        match self {
            TransportEvent::Closed(reason) => AppError::Transport(format!("closed by server: {}", reason)),
            TransportEvent::Failed(reason) => AppError::Transport(reason),
        }
    }
}

/// Shared boolean deciding whether caller audio may be forwarded.
///
/// Written by the turn scheduler, read by the transport on every send.
#[derive(Debug, Clone)]
pub struct Gate(Arc<AtomicBool>);

impl Gate {
    pub fn new(open: bool) -> Self {
        Self(Arc::new(AtomicBool::new(open)))
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Frames allowed to wait for a stalled socket before new ones are dropped.
pub const OUTBOUND_QUEUE_FRAMES: usize = 32;

/// The client side of `/ws/audio?session_id=...`.
pub struct Transport {
    session_id: String,
    state: Arc<Mutex<TransportState>>,
    gate: Gate,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Transport {
    /// Connect to `url` for `session_id`.
    ///
    /// Resolves once the socket is `Open`. A failed handshake ends in
    /// `Error` and is returned as `AppError::Transport`. After opening, an
    /// unsolicited close or socket error is sent once on `events`.
    pub async fn open(
        url: &str,
        session_id: &str,
        gate: Gate,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> AppResult<Self> {
        let state = Arc::new(Mutex::new(TransportState::Connecting));
        info!("Transport connecting for session {}", session_id);

        let (ws_stream, _response) = match connect_async(url).await {
            Ok(pair) => pair,
            Err(e) => {
                set_state(&state, TransportState::Error);
                error!("Transport failed to connect for session {}: {}", session_id, e);
                return Err(AppError::Transport(format!("Failed to connect to {}: {}", url, e)));
            }
        };

        set_state(&state, TransportState::Open);
        info!("Transport open for session {}", session_id);

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
        let task = tokio::spawn(run_socket(ws_stream, rx, state.clone(), events, session_id.to_string()));

        Ok(Self {
            session_id: session_id.to_string(),
            state,
            gate,
            outbound: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Hand a frame to the socket.
    ///
    /// ## Returns:
    /// `true` if the frame was queued for the socket, `false` if it was
    /// dropped because the socket is not open, the gate is closed or the
    /// outbound queue is full. The frame is consumed either way.
    pub fn send(&self, frame: AudioFrame) -> bool {
        if self.state() != TransportState::Open {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if !self.gate.is_open() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Gate closed, dropping {} samples at {}Hz",
                frame.len(),
                frame.sample_rate()
            );
            return false;
        }

        let forwarded = match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => match tx.try_send(frame.into_bytes()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Outbound queue full for session {}, dropping frame", self.session_id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        };

        if forwarded {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        forwarded
    }

    /// Close the socket. Safe to call any number of times, in any state.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = *state;
            *state = TransportState::Closed;
            previous
        };

        // Dropping the sender lets the writer flush what is queued, then close
        self.outbound.lock().unwrap().take();

        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            // Give the close handshake a moment, then drop the socket regardless
            if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                warn!("Transport close handshake timed out for session {}", self.session_id);
                task.abort();
            }
        }

        if previous != TransportState::Closed {
            info!(
                "Transport closed for session {} ({} frames sent, {} dropped)",
                self.session_id,
                self.frames_sent(),
                self.frames_dropped()
            );
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn set_state(state: &Mutex<TransportState>, next: TransportState) {
    *state.lock().unwrap() = next;
}

/// Move `next` in unless the client already closed; returns whether it did.
fn transition_unsolicited(state: &Mutex<TransportState>, next: TransportState) -> bool {
    let mut state = state.lock().unwrap();
    if *state == TransportState::Closed {
        return false;
    }
    *state = next;
    true
}

/// Socket pump: writes outbound frames and watches the inbound side for
/// the connection ending.
async fn run_socket<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    state: Arc<Mutex<TransportState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    session_id: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(bytes) => {
                    if let Err(e) = ws_tx.send(Message::Binary(bytes)).await {
                        if transition_unsolicited(&state, TransportState::Error) {
                            warn!("Transport send failed for session {}: {}", session_id, e);
                            let _ = events.send(TransportEvent::Failed(e.to_string()));
                        }
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.close().await;
                    // Drain until the server acknowledges the close
                    while let Some(Ok(msg)) = ws_rx.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no reason".to_string());
                    if transition_unsolicited(&state, TransportState::Closed) {
                        info!("Transport closed by server for session {}: {}", session_id, reason);
                        let _ = events.send(TransportEvent::Closed(reason));
                    }
                    break;
                }
                Some(Ok(other)) => {
                    debug!("Ignoring inbound {} byte message", other.len());
                }
                Some(Err(e)) => {
                    if transition_unsolicited(&state, TransportState::Error) {
                        warn!("Transport error for session {}: {}", session_id, e);
                        let _ = events.send(TransportEvent::Failed(e.to_string()));
                    }
                    break;
                }
                None => {
                    if transition_unsolicited(&state, TransportState::Closed) {
                        info!("Transport stream ended for session {}", session_id);
                        let _ = events.send(TransportEvent::Closed("stream ended".to_string()));
                    }
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    enum ServerMode {
        Collect,
        CloseImmediately,
    }

    /// Local server that reports every binary message it receives.
    async fn spawn_server(mode: ServerMode) -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            match mode {
                ServerMode::CloseImmediately => {
                    let _ = ws.close(None).await;
                    while ws.next().await.is_some() {}
                }
                ServerMode::Collect => {
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(bytes) => {
                                let _ = tx.send(bytes);
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
        });

        (format!("ws://{}/ws/audio?session_id=abc123", addr), rx)
    }

    #[tokio::test]
    async fn test_gate_decides_what_is_forwarded() {
        let (url, mut received) = spawn_server(ServerMode::Collect).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let gate = Gate::new(false);
        let transport = Transport::open(&url, "abc123", gate.clone(), events_tx).await.unwrap();
        assert_eq!(transport.state(), TransportState::Open);

        assert!(!transport.send(AudioFrame::new(vec![7; 4], 16000)));
        gate.open();
        assert!(transport.send(AudioFrame::new(vec![1, -2], 16000)));

        let bytes = received.recv().await.unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(transport.frames_sent(), 1);
        assert_eq!(transport.frames_dropped(), 1);

        transport.close().await;
        assert!(received.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_outbound_queue_drops_instead_of_buffering() {
        let (url, mut received) = spawn_server(ServerMode::Collect).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = Transport::open(&url, "abc123", Gate::new(true), events_tx).await.unwrap();

        // Nothing yields in between, so the socket writer cannot drain
        let extra = 5;
        let accepted = (0..OUTBOUND_QUEUE_FRAMES + extra)
            .filter(|_| transport.send(AudioFrame::new(vec![3; 8], 16000)))
            .count();

        assert_eq!(accepted, OUTBOUND_QUEUE_FRAMES);
        assert_eq!(transport.frames_sent(), OUTBOUND_QUEUE_FRAMES as u64);
        assert_eq!(transport.frames_dropped(), extra as u64);

        // Queued frames still reach the server before the close
        transport.close().await;
        let mut delivered = 0;
        while received.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, OUTBOUND_QUEUE_FRAMES);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let (url, _received) = spawn_server(ServerMode::Collect).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = Transport::open(&url, "abc123", Gate::new(true), events_tx).await.unwrap();

        transport.close().await;
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send(AudioFrame::new(vec![1], 16000)));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_close_is_reported_once() {
        let (url, _received) = spawn_server(ServerMode::CloseImmediately).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = Transport::open(&url, "abc123", Gate::new(true), events_tx).await.unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Closed(_)));
        assert!(event.into_error().is_session_terminal());
        assert_eq!(transport.state(), TransportState::Closed);

        transport.close().await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result = Transport::open(
            &format!("ws://{}/ws/audio?session_id=x", addr),
            "x",
            Gate::new(true),
            events_tx,
        )
        .await;
        assert!(matches!(result, Err(AppError::Transport(_))));
    }
}
