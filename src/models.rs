//! # Data Model
//!
//! Wire types exchanged with the risk-analysis service and the in-memory
//! records built from them. Field names follow the service's JSON contract
//! (`snake_case`), so most types derive `Deserialize` directly.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Response of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub agent_prompt: String,
}

/// Response of `GET /sessions/{id}/status`, the authoritative record of
/// whether a session still exists remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: String,
    pub active: bool,
    /// Unix timestamp (seconds) of the remote session start
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub elapsed_time: Option<f64>,
}

/// Overall risk classification reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Initial,
    Safe,
    Uncertain,
    HighRisk,
}

/// Optional social-engineering analysis attached to a risk snapshot.
///
/// The service sends it as flat `se_*` fields next to the voice scores;
/// the block exists only when `se_risk_level` is present.
#[derive(Debug, Clone, PartialEq)]
pub struct SocialEngineering {
    pub risk_score: f64,
    pub risk_level: String,
    pub flagged_phrases: Vec<String>,
    pub reason: String,
}

/// Latest fraud/voice-match assessment for a session.
///
/// Replaced wholesale on every successful poll; never merged with the
/// previous one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RiskSnapshotWire")]
pub struct RiskSnapshot {
    pub match_score: f64,
    pub fake_score: f64,
    pub status: RiskStatus,
    pub status_reason: String,
    pub social_engineering: Option<SocialEngineering>,
}

/// `GET /sessions/{id}/risk` exactly as it arrives.
#[derive(Debug, Deserialize)]
struct RiskSnapshotWire {
    match_score: f64,
    fake_score: f64,
    status: RiskStatus,
    #[serde(default)]
    status_reason: String,
    #[serde(default, deserialize_with = "lenient_score")]
    se_risk_score: Option<f64>,
    #[serde(default)]
    se_risk_level: Option<String>,
    #[serde(default)]
    se_flagged_phrases: Option<Vec<String>>,
    #[serde(default)]
    se_reason: Option<String>,
}

impl From<RiskSnapshotWire> for RiskSnapshot {
    fn from(wire: RiskSnapshotWire) -> Self {
        let social_engineering = wire
            .se_risk_level
            .filter(|level| !level.trim().is_empty())
            .map(|risk_level| SocialEngineering {
                risk_score: wire.se_risk_score.unwrap_or(0.0),
                risk_level,
                flagged_phrases: wire.se_flagged_phrases.unwrap_or_default(),
                reason: wire.se_reason.unwrap_or_default(),
            });

        Self {
            match_score: wire.match_score,
            fake_score: wire.fake_score,
            status: wire.status,
            status_reason: wire.status_reason,
            social_engineering,
        }
    }
}

/// The social-engineering score comes from a language model; accept a
/// number, a numeric string or null, and treat anything else as absent.
fn lenient_score<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Who holds the floor during a turn window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Caller,
}

/// One interval of the call script, in seconds since session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: f64,
    pub end: f64,
    pub role: Role,
    #[serde(default)]
    pub segment_index: Option<usize>,
}

impl Window {
    /// Half-open containment: `start <= t < end`.
    pub fn contains(&self, elapsed: f64) -> bool {
        self.start <= elapsed && elapsed < self.end
    }
}

/// Text of one scripted agent segment, indexed positionally by
/// `Window::segment_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub text: String,
    #[serde(default)]
    pub agent_duration: f64,
    #[serde(default)]
    pub caller_duration: f64,
}

/// Response of `GET /agent/script`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScript {
    pub script: Vec<ScriptSegment>,
    pub windows: Vec<Window>,
}

/// Successful response of `POST /enrollment/create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
}

/// Structured error body returned by the service (`{"detail": "..."}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// The local record of one call, owned by the lifecycle manager.
///
/// `start_time` is set when the transport opens, not when the remote
/// session is created, so the turn script is anchored to the moment audio
/// can actually flow.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub start_time: Option<Instant>,
    pub active: bool,
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            id,
            start_time: None,
            active: false,
        }
    }
}
