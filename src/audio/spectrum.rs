//! # Spectral Tap
//!
//! A live frequency-analysis handle for visualization consumers. The capture
//! callback feeds mono samples in; any number of cloned handles read the
//! current spectrum out.
//!
//! ## Output Format:
//! `byte_frequency_data()` returns `fft_size / 2` bins. Each bin is the
//! Hann-windowed FFT magnitude converted to decibels and mapped linearly
//! from [-100 dB, -30 dB] onto 0..=255, the familiar level-meter scale.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

struct SpectrumState {
    window: VecDeque<f32>,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    fft_size: usize,
}

/// Cloneable handle over a rolling window of the most recent samples.
#[derive(Clone)]
pub struct SpectrumTap {
    inner: Arc<Mutex<SpectrumState>>,
}

impl SpectrumTap {
    /// Create a tap with the given FFT size (must be a power of two).
    pub fn new(fft_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let hann = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(SpectrumState {
                window: VecDeque::with_capacity(fft_size),
                fft,
                hann,
                fft_size,
            })),
        }
    }

    /// Push mono samples, keeping only the newest `fft_size`.
    pub fn feed(&self, samples: &[f32]) {
        let mut state = self.inner.lock().unwrap();
        let capacity = state.fft_size;
        for &sample in samples {
            if state.window.len() == capacity {
                state.window.pop_front();
            }
            state.window.push_back(sample);
        }
    }

    /// Forget all buffered samples.
    pub fn clear(&self) {
        self.inner.lock().unwrap().window.clear();
    }

    /// Current spectrum as bytes (0 = silent, 255 = loud).
    ///
    /// A window that is not yet full is zero-padded at the front, so an
    /// empty tap yields all zeros.
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let state = self.inner.lock().unwrap();
        let size = state.fft_size;
        let bins = size / 2;

        if state.window.is_empty() {
            return vec![0; bins];
        }

        let offset = size - state.window.len();
        let mut buffer: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); size];
        for (i, &sample) in state.window.iter().enumerate() {
            let idx = offset + i;
            buffer[idx] = Complex::new(sample * state.hann[idx], 0.0);
        }
        state.fft.process(&mut buffer);

        buffer
            .iter()
            .take(bins)
            .map(|c| {
                let magnitude = c.norm() / size as f32;
                let db = 20.0 * magnitude.max(1e-12).log10();
                let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Average consecutive bins into `count` bars for level meters.
    pub fn bars(&self, count: usize) -> Vec<u8> {
        let data = self.byte_frequency_data();
        if count == 0 {
            return Vec::new();
        }

        let step = (data.len() / count).max(1);
        (0..count)
            .map(|i| {
                let start = (i * step).min(data.len());
                let end = (start + step).min(data.len());
                let slice = &data[start..end];
                if slice.is_empty() {
                    0
                } else {
                    (slice.iter().map(|&v| v as u32).sum::<u32>() / slice.len() as u32) as u8
                }
            })
            .collect()
    }
}
