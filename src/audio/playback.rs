//! # Agent Clip Playback
//!
//! Plays the pre-recorded agent lines the turn scheduler cues. A clip is
//! always started from its beginning, and starting one replaces whatever was
//! playing before.
//!
//! ## Key Rust Concepts:
//! - **Trait seam**: `AgentPlayer` lets the scheduler run against a silent
//!   recorder in tests and rodio in the binary
//! - **Thread-owned stream**: rodio's `OutputStream` must outlive every sink
//!   but is not `Send`, so a dedicated thread keeps it alive

use crate::error::{AppError, AppResult};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

/// Encoded audio for one agent line.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub segment_index: usize,
    bytes: Arc<Vec<u8>>,
}

impl AudioClip {
    pub fn new(segment_index: usize, bytes: Vec<u8>) -> Self {
        Self {
            segment_index,
            bytes: Arc::new(bytes),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Output side used by the turn scheduler.
pub trait AgentPlayer: Send + Sync {
    /// Start `clip` from the beginning, stopping any clip in progress.
    fn play(&self, clip: &AudioClip) -> AppResult<()>;

    /// Halt playback immediately. A no-op when nothing is playing.
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Speaker output through rodio's default device.
pub struct RodioPlayer {
    handle: OutputStreamHandle,
    sink: Mutex<Option<Sink>>,
    // Dropping this sender releases the stream thread
    _keepalive: std_mpsc::Sender<()>,
}

impl RodioPlayer {
    pub fn new() -> AppResult<Self> {
        let (handle_tx, handle_rx) = std_mpsc::channel::<AppResult<OutputStreamHandle>>();
        let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();

        thread::spawn(move || match OutputStream::try_default() {
            Ok((stream, handle)) => {
                let _ = handle_tx.send(Ok(handle));
                let _ = keepalive_rx.recv();
                drop(stream);
                debug!("Output stream released");
            }
            Err(e) => {
                let _ = handle_tx.send(Err(AppError::Playback(format!(
                    "Failed to open output device: {}",
                    e
                ))));
            }
        });

        let handle = handle_rx
            .recv()
            .map_err(|_| AppError::Playback("Output thread exited".to_string()))??;

        Ok(Self {
            handle,
            sink: Mutex::new(None),
            _keepalive: keepalive_tx,
        })
    }
}

impl AgentPlayer for RodioPlayer {
    fn play(&self, clip: &AudioClip) -> AppResult<()> {
        self.stop();

        let source = rodio::Decoder::new(Cursor::new(clip.bytes().to_vec()))
            .map_err(|e| AppError::Playback(format!("Failed to decode clip: {}", e)))?;
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| AppError::Playback(format!("Failed to create sink: {}", e)))?;
        sink.append(source);
        sink.play();

        debug!("Playing agent clip {}", clip.segment_index);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.stop();
        }
    }

    fn is_playing(&self) -> bool {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .map(|sink| !sink.empty() && !sink.is_paused())
            .unwrap_or(false)
    }
}

/// Player used when no output device can be opened; clips are dropped.
pub struct NullPlayer;

impl AgentPlayer for NullPlayer {
    fn play(&self, clip: &AudioClip) -> AppResult<()> {
        warn!("No output device, skipping agent clip {}", clip.segment_index);
        Ok(())
    }

    fn stop(&self) {}

    fn is_playing(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording player for scheduler and session tests.

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum PlayerEvent {
        Play(usize),
        Stop,
    }

    #[derive(Default)]
    pub struct RecordingPlayer {
        pub events: Mutex<Vec<PlayerEvent>>,
        playing: Mutex<Option<usize>>,
    }

    impl RecordingPlayer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<PlayerEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn current(&self) -> Option<usize> {
            *self.playing.lock().unwrap()
        }
    }

    impl AgentPlayer for RecordingPlayer {
        fn play(&self, clip: &AudioClip) -> AppResult<()> {
            self.events
                .lock()
                .unwrap()
                .push(PlayerEvent::Play(clip.segment_index));
            *self.playing.lock().unwrap() = Some(clip.segment_index);
            Ok(())
        }

        fn stop(&self) {
            if self.playing.lock().unwrap().take().is_some() {
                self.events.lock().unwrap().push(PlayerEvent::Stop);
            }
        }

        fn is_playing(&self) -> bool {
            self.playing.lock().unwrap().is_some()
        }
    }
}
