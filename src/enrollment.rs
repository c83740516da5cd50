//! # Voice Enrollment
//!
//! Records one clean sample of the user's voice and registers it with the
//! risk service. Enrollment never touches call-session state.
//!
//! ## Flow:
//! 1. Validate the identity fields
//! 2. Capture in recording mode for a fixed duration (or until cancelled)
//! 3. Encode the blocks into a single WAV recording
//! 4. Upload `user_id`, `name` and `enrollment.wav` as multipart

use crate::api::SessionApi;
use crate::audio::{AudioInput, PcmCapture, Recording, SpectrumTap};
use crate::config::AudioSettings;
use crate::error::{AppError, AppResult};
use crate::models::EnrollmentResponse;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const METER_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const METER_INTERVAL: Duration = Duration::from_millis(250);

/// Identity a recording is enrolled under.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentRequest {
    pub user_id: String,
    pub name: String,
}

impl EnrollmentRequest {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> AppResult<Self> {
        let user_id = user_id.into().trim().to_string();
        let name = name.into().trim().to_string();

        if user_id.is_empty() {
            return Err(AppError::EnrollmentFailed("User ID is required".to_string()));
        }
        if name.is_empty() {
            return Err(AppError::EnrollmentFailed("Name is required".to_string()));
        }
        Ok(Self { user_id, name })
    }
}

/// Record for `duration`, or until `cancel` resolves, whichever is first.
pub async fn record<F>(
    input: Box<dyn AudioInput>,
    settings: &AudioSettings,
    duration: Duration,
    cancel: F,
) -> AppResult<Recording>
where
    F: Future<Output = ()>,
{
    let mut capture = PcmCapture::recording(input, settings);
    capture.start().await?;
    info!("Recording enrollment sample for up to {:.0}s", duration.as_secs_f64());

    if let Some(tap) = capture.spectrum() {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        tokio::pin!(cancel);
        let mut meter = tokio::time::interval(METER_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut cancel => {
                    info!("Enrollment recording cut short");
                    break;
                }
                _ = meter.tick() => debug!("level {}", level_meter(&tap, 24)),
            }
        }
    }

    let recording = capture
        .stop()
        .await?
        .ok_or_else(|| AppError::Internal("Recording produced no audio".to_string()))?;
    info!(
        "Captured {:.1}s ({} samples at {}Hz)",
        recording.duration_seconds(),
        recording.sample_count,
        recording.sample_rate
    );
    Ok(recording)
}

/// Upload a finished recording.
pub async fn submit(
    api: &dyn SessionApi,
    request: &EnrollmentRequest,
    recording: &Recording,
) -> AppResult<EnrollmentResponse> {
    if recording.sample_count == 0 {
        return Err(AppError::EnrollmentFailed("Recording is empty".to_string()));
    }

    let response = api
        .create_enrollment(&request.user_id, &request.name, recording)
        .await?;
    info!(
        "Enrolled {} ({}): {}",
        response.user_id, response.status, response.message
    );
    Ok(response)
}

/// Render the current spectrum as a one-line bar meter.
pub fn level_meter(tap: &SpectrumTap, width: usize) -> String {
    tap.bars(width)
        .into_iter()
        .map(|v| METER_GLYPHS[(v as usize * METER_GLYPHS.len()) / 256])
        .collect()
}
