//! # Audio Module
//!
//! Everything between the microphone/speaker and the rest of the client.
//!
//! ## Key Components:
//! - **Frames**: 16-bit mono PCM blocks, the unit the transport sends
//! - **Processor**: Downmix, resample and slice device blocks into frames
//! - **Buffer**: Ordered raw blocks for enrollment, encoded once into WAV
//! - **Spectrum**: Live FFT tap for level meters
//! - **Capture**: Device acquisition with streaming and recording modes
//! - **Playback**: Scripted agent clip output
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz) by default
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;    // Enrollment recording buffer and WAV container
pub mod capture;   // Microphone capture engine
pub mod frame;     // Outbound PCM frame type
pub mod playback;  // Agent clip output
pub mod processor; // Downmix, resample, framing
pub mod spectrum;  // Spectral tap

pub use buffer::{Recording, RecordingBuffer};
pub use capture::{AudioInput, CpalInput, PcmCapture};
pub use frame::AudioFrame;
pub use playback::{AgentPlayer, AudioClip, NullPlayer, RodioPlayer};
pub use spectrum::SpectrumTap;
