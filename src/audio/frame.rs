//! # Audio Frames
//!
//! The unit of outbound audio: a fixed-size block of 16-bit signed mono
//! samples at the configured rate. A frame is immutable once produced and
//! is moved into the transport on hand-off, so nothing keeps a copy after
//! it has been sent.
//!
//! ## Wire Format:
//! - **Encoding**: Little-endian signed 16-bit integers
//! - **Channels**: Mono (1 channel)
//! - **Header**: None; the socket frame is the raw sample bytes

use byteorder::{LittleEndian, WriteBytesExt};

/// One block of 16-bit PCM ready for the duplex socket.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Build a frame from normalized float samples.
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(float_to_pcm(samples), sample_rate)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Consume the frame into its wire representation.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in self.samples {
            // Writing into a Vec cannot fail
            let _ = bytes.write_i16::<LittleEndian>(sample);
        }
        bytes
    }
}

/// Convert normalized float samples to 16-bit PCM.
///
/// ## Conversion:
/// Clamps to [-1.0, 1.0], then scales negative values by 32768 and
/// positive values by 32767 so both ends of the i16 range are reachable.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}
