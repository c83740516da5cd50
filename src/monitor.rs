//! # Risk Monitor
//!
//! The read-only surface. It never writes the shared slot; it mirrors it
//! (or follows an id given on the command line), runs its own poller, and
//! turns poller state changes into a stream of display events.

use crate::api::SessionApi;
use crate::config::AppConfig;
use crate::poller::{spawn_poller, PollerHandle, PollerPhase, PollerState, StopReason};
use crate::risk::{call_elapsed, display_name, format_duration, RiskView};
use crate::slot::{SharedSlot, SlotMirror};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Something worth showing to whoever watches the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    SessionChanged(Option<String>),
    PhaseChanged(PollerPhase),
    Risk(RiskView),
    FraudAlert { session_id: String, fake_score: f64 },
    Stopped(StopReason),
}

/// Compare two consecutive poller states.
pub fn describe_changes(prev: &PollerState, next: &PollerState) -> Vec<MonitorEvent> {
    let mut events = Vec::new();

    if prev.session_id != next.session_id {
        events.push(MonitorEvent::SessionChanged(next.session_id.clone()));
    }
    if prev.phase != next.phase {
        events.push(MonitorEvent::PhaseChanged(next.phase));
    }
    if next.risk.is_some() && prev.risk != next.risk {
        events.push(MonitorEvent::Risk(next.view.clone()));
    }

    let alert_raised = next.fraud_alert && (!prev.fraud_alert || prev.session_id != next.session_id);
    if alert_raised {
        if let Some(session_id) = &next.session_id {
            events.push(MonitorEvent::FraudAlert {
                session_id: session_id.clone(),
                fake_score: next.view.fraud_risk,
            });
        }
    }

    if prev.stop_reason != next.stop_reason {
        if let Some(reason) = &next.stop_reason {
            events.push(MonitorEvent::Stopped(reason.clone()));
        }
    }

    events
}

pub struct Monitor {
    state_rx: watch::Receiver<PollerState>,
    last: PollerState,
    _poller: PollerHandle,
    _mirror: Option<SlotMirror>,
    _pinned: Option<watch::Sender<Option<String>>>,
}

impl Monitor {
    /// Follow whatever session the shared slot names.
    pub fn follow_slot(api: Arc<dyn SessionApi>, slot: SharedSlot, config: &AppConfig) -> Self {
        let mirror = SlotMirror::spawn(slot, config.slot_poll_interval());
        let poller = spawn_poller(api, config.risk_poll_interval(), mirror.subscribe());
        Self::with_poller(poller, Some(mirror), None)
    }

    /// Follow one explicit session id.
    pub fn follow_session(api: Arc<dyn SessionApi>, session_id: String, config: &AppConfig) -> Self {
        let (pinned, session_rx) = watch::channel(Some(session_id));
        let poller = spawn_poller(api, config.risk_poll_interval(), session_rx);
        Self::with_poller(poller, None, Some(pinned))
    }

    fn with_poller(
        poller: PollerHandle,
        mirror: Option<SlotMirror>,
        pinned: Option<watch::Sender<Option<String>>>,
    ) -> Self {
        let mut state_rx = poller.subscribe();
        let last = state_rx.borrow_and_update().clone();
        Self {
            state_rx,
            last,
            _poller: poller,
            _mirror: mirror,
            _pinned: pinned,
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.last
    }

    /// Wait for the next poller update and describe what changed.
    /// Returns `None` once the poller is gone.
    pub async fn next_events(&mut self) -> Option<Vec<MonitorEvent>> {
        self.state_rx.changed().await.ok()?;
        let next = self.state_rx.borrow_and_update().clone();
        let events = describe_changes(&self.last, &next);
        self.last = next;
        Some(events)
    }
}

/// Log one event the way the monitor command shows it.
pub fn log_event(event: &MonitorEvent, state: &PollerState) {
    match event {
        MonitorEvent::SessionChanged(Some(id)) => info!("Monitoring session {}", id),
        MonitorEvent::SessionChanged(None) => info!("No active session"),
        MonitorEvent::PhaseChanged(phase) => info!("Poller {:?}", phase),
        MonitorEvent::Risk(view) => {
            let caller = state
                .status
                .as_ref()
                .and_then(|s| s.user_id.as_deref())
                .map(display_name)
                .unwrap_or("unknown caller");
            let elapsed = state
                .status
                .as_ref()
                .and_then(|s| call_elapsed(s, Utc::now().timestamp_millis() as f64 / 1000.0))
                .map(format_duration)
                .unwrap_or_else(|| "--:--:--".to_string());
            info!(
                "[{}] {} | {} | voice {:.1}% ({}) | fraud {:.1}% ({})",
                elapsed,
                caller,
                view.auth_status.label(),
                view.voice_match,
                view.voice_confidence.label(),
                view.fraud_risk,
                view.fraud_level.label()
            );
            if let Some(se) = &view.social_engineering {
                if !se.flagged_phrases.is_empty() {
                    info!(
                        "Social engineering {} ({:.0}): {} [{}]",
                        se.risk_level,
                        se.risk_score,
                        se.reason,
                        se.flagged_phrases.join(", ")
                    );
                }
            }
        }
        MonitorEvent::FraudAlert {
            session_id,
            fake_score,
        } => warn!(
            "AI VOICE ALERT on session {}: synthetic voice likelihood {:.1}%",
            session_id, fake_score
        ),
        MonitorEvent::Stopped(reason) => info!("Polling stopped: {:?}", reason),
    }
}
