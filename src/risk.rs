//! # Risk Presentation State
//!
//! Derives the discrete, UI-facing risk state from the latest raw snapshot
//! and owns the per-session one-shot fraud alert.
//!
//! ## Rules:
//! - Levels are recomputed from the newest snapshot only, never accumulated
//! - Auth status reads "verifying" until the first non-zero fake score of
//!   the session has come back
//! - The fraud alert fires at most once per session id; a new session id is
//!   the only thing that re-arms it

use crate::models::{RiskSnapshot, RiskStatus, SessionStatus, SocialEngineering};
use tracing::{info, warn};

/// Fake score strictly above this raises the one-shot alert.
pub const FRAUD_ALERT_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FraudLevel {
    Low,
    Medium,
    High,
}

impl FraudLevel {
    pub fn from_score(fake_score: f64) -> Self {
        if fake_score >= 50.0 {
            FraudLevel::High
        } else if fake_score >= 20.0 {
            FraudLevel::Medium
        } else {
            FraudLevel::Low
        }
    }

    pub fn label(&self) -> &str {
        match self {
            FraudLevel::Low => "Low Risk",
            FraudLevel::Medium => "Medium Risk",
            FraudLevel::High => "High Risk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceConfidence {
    Low,
    Medium,
    High,
}

impl VoiceConfidence {
    pub fn from_score(match_score: f64) -> Self {
        if match_score >= 80.0 {
            VoiceConfidence::High
        } else if match_score >= 50.0 {
            VoiceConfidence::Medium
        } else {
            VoiceConfidence::Low
        }
    }

    pub fn label(&self) -> &str {
        match self {
            VoiceConfidence::Low => "Low Confidence",
            VoiceConfidence::Medium => "Medium Confidence",
            VoiceConfidence::High => "High Confidence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Verifying,
    Authenticated,
    HighRisk,
}

impl AuthStatus {
    pub fn label(&self) -> &str {
        match self {
            AuthStatus::Verifying => "VERIFYING IDENTITY...",
            AuthStatus::Authenticated => "CLIENT AUTHENTICATED (VOICE ID VERIFIED)",
            AuthStatus::HighRisk => "HIGH RISK DETECTED",
        }
    }
}

/// Everything a display surface needs, derived from one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskView {
    pub voice_match: f64,
    pub fraud_risk: f64,
    pub fraud_level: FraudLevel,
    pub voice_confidence: VoiceConfidence,
    pub auth_status: AuthStatus,
    pub status: RiskStatus,
    pub status_reason: String,
    pub social_engineering: Option<SocialEngineering>,
}

impl RiskView {
    /// Classify `snapshot`. `ai_check_returned` says whether a non-zero fake
    /// score has been seen earlier in this session.
    pub fn derive(snapshot: &RiskSnapshot, ai_check_returned: bool) -> Self {
        let auth_status = if !ai_check_returned {
            AuthStatus::Verifying
        } else {
            match snapshot.status {
                RiskStatus::Safe => AuthStatus::Authenticated,
                RiskStatus::HighRisk => AuthStatus::HighRisk,
                RiskStatus::Initial | RiskStatus::Uncertain => AuthStatus::Verifying,
            }
        };

        Self {
            voice_match: snapshot.match_score,
            fraud_risk: snapshot.fake_score,
            fraud_level: FraudLevel::from_score(snapshot.fake_score),
            voice_confidence: VoiceConfidence::from_score(snapshot.match_score),
            auth_status,
            status: snapshot.status,
            status_reason: snapshot.status_reason.clone(),
            social_engineering: snapshot.social_engineering.clone(),
        }
    }

    /// Placeholder shown before the first snapshot arrives.
    pub fn initial() -> Self {
        Self {
            voice_match: 0.0,
            fraud_risk: 0.0,
            fraud_level: FraudLevel::Low,
            voice_confidence: VoiceConfidence::Low,
            auth_status: AuthStatus::Verifying,
            status: RiskStatus::Initial,
            status_reason: String::new(),
            social_engineering: None,
        }
    }
}

/// One-shot alert, armed per session id.
#[derive(Debug, Default)]
pub struct FraudAlertLatch {
    session_id: Option<String>,
    fired: bool,
}

impl FraudAlertLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow the active session. Re-arms only when the id actually changes.
    pub fn set_session(&mut self, session_id: Option<&str>) {
        if self.session_id.as_deref() != session_id {
            self.session_id = session_id.map(str::to_string);
            self.fired = false;
        }
    }

    /// Returns `true` exactly once per session, the first time the score
    /// exceeds the threshold while a session is active.
    pub fn observe(&mut self, fake_score: f64) -> bool {
        if self.fired || self.session_id.is_none() || fake_score <= FRAUD_ALERT_THRESHOLD {
            return false;
        }
        self.fired = true;
        true
    }
}

/// Result of feeding one snapshot to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskUpdate {
    pub view: RiskView,
    pub alert: bool,
}

/// Per-session presentation state: current view, AI-check flag, alert latch.
#[derive(Debug)]
pub struct RiskTracker {
    session_id: Option<String>,
    ai_check_returned: bool,
    latch: FraudAlertLatch,
    view: Option<RiskView>,
}

impl RiskTracker {
    pub fn new() -> Self {
        Self {
            session_id: None,
            ai_check_returned: false,
            latch: FraudAlertLatch::new(),
            view: None,
        }
    }

    /// Switch sessions. Everything per-session resets on an id change.
    pub fn set_session(&mut self, session_id: Option<&str>) {
        if self.session_id.as_deref() == session_id {
            return;
        }
        self.session_id = session_id.map(str::to_string);
        self.ai_check_returned = false;
        self.view = None;
        self.latch.set_session(session_id);
    }

    pub fn update(&mut self, snapshot: &RiskSnapshot) -> RiskUpdate {
        if snapshot.fake_score > 0.0 {
            self.ai_check_returned = true;
        }

        let view = RiskView::derive(snapshot, self.ai_check_returned);
        let alert = self.latch.observe(snapshot.fake_score);
        if alert {
            warn!(
                "Fraud alert for session {}: fake score {:.1}",
                self.session_id.as_deref().unwrap_or("-"),
                snapshot.fake_score
            );
        }

        if self.view.as_ref().map(|v| v.auth_status) != Some(view.auth_status) {
            info!("Auth status: {}", view.auth_status.label());
        }
        self.view = Some(view.clone());

        RiskUpdate { view, alert }
    }
}

impl Default for RiskTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds since the remote session started, clamped at zero.
pub fn call_elapsed(status: &SessionStatus, now_unix: f64) -> Option<u64> {
    status
        .start_time
        .map(|start| (now_unix - start).max(0.0).floor() as u64)
}

/// `HH:MM:SS`
pub fn format_duration(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// User id with any email domain removed.
pub fn display_name(user_id: &str) -> &str {
    user_id.split('@').next().unwrap_or(user_id)
}
