//! # Risk / Session Poller
//!
//! Follows one session id at a time and keeps a fresh view of its remote
//! status and risk. Consumers read the result through a `watch` channel.
//!
//! ## State Machine:
//! ```text
//! Idle ──(id set)──> Polling ──(404 | inactive | fetch error)──> Stopped
//!  ^                    │                                          │
//!  └────(id cleared)────┴──────────────(id cleared)────────────────┘
//! ```
//! A different id moves straight to `Polling` for the new session with
//! both snapshots cleared.
//!
//! ## Each Tick (immediately, then every `risk_poll_ms`):
//! 1. Fetch the session status; 404 stops and clears both snapshots
//! 2. `active == false` stops (the call ended remotely)
//! 3. Fetch the risk snapshot and replace the previous one; failure stops
//!
//! Once stopped no further request is issued until the id changes.

use crate::api::SessionApi;
use crate::error::AppError;
use crate::models::{RiskSnapshot, SessionStatus};
use crate::risk::{RiskTracker, RiskView};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerPhase {
    Idle,
    Polling,
    Stopped,
}

/// Why a session stopped being polled.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The service does not know the session
    NotFound,
    /// The service reports the session as no longer active
    Ended,
    /// A risk fetch failed
    RiskFetchFailed(String),
    /// A status fetch failed for a reason other than 404
    StatusFailed(String),
}

impl StopReason {
    /// Whether the remote session is gone, so local session state should end too.
    pub fn ends_session(&self) -> bool {
        matches!(self, StopReason::NotFound | StopReason::Ended)
    }
}

/// Everything the poller publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerState {
    pub phase: PollerPhase,
    pub session_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub risk: Option<RiskSnapshot>,
    pub view: RiskView,
    /// Latched true the first time this session crosses the alert threshold
    pub fraud_alert: bool,
    pub stop_reason: Option<StopReason>,
}

impl PollerState {
    fn idle() -> Self {
        Self {
            phase: PollerPhase::Idle,
            session_id: None,
            status: None,
            risk: None,
            view: RiskView::initial(),
            fraud_alert: false,
            stop_reason: None,
        }
    }

    fn polling(session_id: &str) -> Self {
        Self {
            phase: PollerPhase::Polling,
            session_id: Some(session_id.to_string()),
            ..Self::idle()
        }
    }
}

/// Running poller task plus its published state.
pub struct PollerHandle {
    state_rx: watch::Receiver<PollerState>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> PollerState {
        self.state_rx.borrow().clone()
    }

}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a poller following `session_rx`.
pub fn spawn_poller(
    api: Arc<dyn SessionApi>,
    interval: Duration,
    session_rx: watch::Receiver<Option<String>>,
) -> PollerHandle {
    let (state_tx, state_rx) = watch::channel(PollerState::idle());
    let task = tokio::spawn(run_poller(api, interval, session_rx, state_tx));
    PollerHandle { state_rx, task }
}

async fn run_poller(
    api: Arc<dyn SessionApi>,
    interval: Duration,
    mut session_rx: watch::Receiver<Option<String>>,
    state_tx: watch::Sender<PollerState>,
) {
    let mut tracker = RiskTracker::new();

    loop {
        let session_id = session_rx.borrow_and_update().clone();
        tracker.set_session(session_id.as_deref());

        match session_id {
            None => {
                publish(&state_tx, PollerState::idle());
                info!("Poller idle");
            }
            Some(id) => {
                publish(&state_tx, PollerState::polling(&id));
                info!("Poller following session {}", id);

                tokio::select! {
                    reason = poll_session(api.as_ref(), &id, interval, &mut tracker, &state_tx) => {
                        info!("Poller stopped for session {}: {:?}", id, reason);
                    }
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
        }

        if session_rx.changed().await.is_err() {
            break;
        }
    }

    debug!("Poller task finished");
}

/// Poll one session until it stops; returns why.
async fn poll_session(
    api: &dyn SessionApi,
    session_id: &str,
    interval: Duration,
    tracker: &mut RiskTracker,
    state_tx: &watch::Sender<PollerState>,
) -> StopReason {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let status = match api.session_status(session_id).await {
            Ok(status) => status,
            Err(AppError::SessionNotFound(_)) => {
                warn!("Session {} not found, clearing state", session_id);
                return stop(state_tx, StopReason::NotFound, true);
            }
            Err(e) => {
                warn!("Status fetch failed for session {}: {}", session_id, e);
                return stop(state_tx, StopReason::StatusFailed(e.to_string()), false);
            }
        };

        if !status.active {
            info!("Session {} ended remotely", session_id);
            state_tx.send_modify(|state| state.status = Some(status));
            return stop(state_tx, StopReason::Ended, false);
        }

        match api.session_risk(session_id).await {
            Ok(snapshot) => {
                let update = tracker.update(&snapshot);
                state_tx.send_modify(|state| {
                    state.status = Some(status);
                    state.risk = Some(snapshot);
                    state.view = update.view;
                    state.fraud_alert |= update.alert;
                });
            }
            Err(e) => {
                warn!("Risk fetch failed for session {}: {}", session_id, e);
                state_tx.send_modify(|state| state.status = Some(status));
                return stop(state_tx, StopReason::RiskFetchFailed(e.to_string()), false);
            }
        }
    }
}

fn stop(state_tx: &watch::Sender<PollerState>, reason: StopReason, clear: bool) -> StopReason {
    state_tx.send_modify(|state| {
        state.phase = PollerPhase::Stopped;
        state.stop_reason = Some(reason.clone());
        if clear {
            state.status = None;
            state.risk = None;
            state.view = RiskView::initial();
        }
    });
    reason
}

fn publish(state_tx: &watch::Sender<PollerState>, state: PollerState) {
    state_tx.send_replace(state);
}
