//! # Recording Buffer
//!
//! Accumulates raw float sample blocks for the enrollment path and turns
//! them, once, into a playable WAV container.
//!
//! ## Key Features:
//! - **Append-only**: Blocks are stored in arrival order, never reordered or merged
//! - **Exact length**: The encoded sample count equals the sum of all block lengths
//! - **Container**: RIFF/WAVE, PCM, mono, 16-bit, tagged with the capture rate

use crate::audio::frame::float_to_pcm;
use crate::error::{AppError, AppResult};
use std::io::Cursor;

/// Ordered sequence of raw sample blocks from one recording.
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    blocks: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl RecordingBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            blocks: Vec::new(),
            sample_rate,
        }
    }

    /// Append one block exactly as delivered.
    pub fn append(&mut self, block: Vec<f32>) {
        self.blocks.push(block);
    }

    /// Total number of samples across all blocks.
    pub fn total_samples(&self) -> usize {
        self.blocks.iter().map(|block| block.len()).sum()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Concatenate every block in arrival order.
    pub fn concat(&self) -> Vec<f32> {
        let mut samples = Vec::with_capacity(self.total_samples());
        for block in &self.blocks {
            samples.extend_from_slice(block);
        }
        samples
    }

    /// Encode the whole recording as a 16-bit mono WAV file.
    pub fn encode_wav(&self) -> AppResult<Recording> {
        let pcm = float_to_pcm(&self.concat());
        let sample_count = pcm.len();
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, self.sample_rate, 16);

        let mut cursor = Cursor::new(Vec::with_capacity(44 + sample_count * 2));
        wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut cursor)
            .map_err(|e| AppError::Encoding(format!("Failed to write WAV: {}", e)))?;

        Ok(Recording {
            bytes: cursor.into_inner(),
            sample_rate: self.sample_rate,
            sample_count,
        })
    }
}

/// A finished, encoded recording.
#[derive(Debug, Clone)]
pub struct Recording {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub sample_count: usize,
}

impl Recording {
    pub fn duration_seconds(&self) -> f64 {
        self.sample_count as f64 / self.sample_rate as f64
    }
}

/// Read a 16-bit mono WAV container back into its rate and samples.
pub fn decode_wav(bytes: &[u8]) -> AppResult<(u32, Vec<i16>)> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| AppError::Encoding(format!("Failed to read WAV: {}", e)))?;

    if header.channel_count != 1 {
        return Err(AppError::Encoding(format!(
            "Expected mono audio, got {} channels",
            header.channel_count
        )));
    }

    match data {
        wav::BitDepth::Sixteen(samples) => Ok((header.sampling_rate, samples)),
        _ => Err(AppError::Encoding("Expected 16-bit PCM samples".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_samples_is_sum_of_blocks() {
        let mut buffer = RecordingBuffer::new(16000);
        let lengths = [4096usize, 1, 0, 333, 2048, 7];
        for (i, len) in lengths.iter().enumerate() {
            buffer.append(vec![i as f32 / 10.0; *len]);
        }
        let expected: usize = lengths.iter().sum();

        assert_eq!(buffer.total_samples(), expected);

        let recording = buffer.encode_wav().unwrap();
        assert_eq!(recording.sample_count, expected);

        let (rate, samples) = decode_wav(&recording.bytes).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(samples.len(), expected);
    }

    #[test]
    fn test_concat_preserves_arrival_order() {
        let mut buffer = RecordingBuffer::new(8000);
        buffer.append(vec![0.1, 0.2]);
        buffer.append(vec![0.3]);
        buffer.append(vec![0.4, 0.5]);
        assert_eq!(buffer.concat(), vec![0.1, 0.2, 0.3, 0.4, 0.5]);
    }

    #[test]
    fn test_duration_matches_sample_count() {
        let mut buffer = RecordingBuffer::new(16000);
        buffer.append(vec![0.0; 8000]);
        buffer.append(vec![0.0; 24000]);
        let recording = buffer.encode_wav().unwrap();
        assert!((recording.duration_seconds() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_container_header() {
        let mut buffer = RecordingBuffer::new(16000);
        buffer.append(vec![0.5; 10]);
        let recording = buffer.encode_wav().unwrap();
        assert_eq!(&recording.bytes[0..4], b"RIFF");
        assert_eq!(&recording.bytes[8..12], b"WAVE");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"not a wav file").is_err());
    }
}
