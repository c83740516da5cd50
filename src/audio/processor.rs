//! # Audio Processing
//!
//! Turns whatever the input device delivers into the fixed format the risk
//! service expects.
//!
//! ## Key Functions:
//! - **Downmix**: Interleaved multi-channel blocks become mono (channel mean)
//! - **Resample**: Linear interpolation from the device rate to the target rate
//! - **Framing**: Mono samples are sliced into fixed-length `AudioFrame`s,
//!   carrying any remainder into the next device callback

use crate::audio::frame::AudioFrame;

/// Format the device is actually delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl InputFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Stateful converter from device blocks to mono target-rate samples and frames.
///
/// ## State carried between callbacks:
/// - `position`: fractional read position of the resampler
/// - `last_sample`: final mono sample of the previous block (interpolation anchor)
/// - `pending`: mono samples not yet filling a whole frame
///
/// Buffers are reused across calls, so once they have grown to the device's
/// block size, converting a block does not touch the heap.
pub struct FrameProcessor {
    input: InputFormat,
    target_rate: u32,
    frame_size: usize,
    position: f64,
    last_sample: Option<f32>,
    pending: Vec<f32>,
    mono: Vec<f32>,
}

impl FrameProcessor {
    /// Create a new processor for the given device format.
    pub fn new(input: InputFormat, target_rate: u32, frame_size: usize) -> Self {
        Self {
            input,
            target_rate,
            frame_size,
            position: 0.0,
            last_sample: None,
            pending: Vec::with_capacity(frame_size * 2),
            mono: Vec::new(),
        }
    }

    /// Downmix and resample one device block into `out`.
    ///
    /// `out` is cleared first. Its length varies between calls because the
    /// resampler carries its fractional position forward.
    pub fn convert_into(&mut self, interleaved: &[f32], out: &mut Vec<f32>) {
        if self.input.sample_rate == self.target_rate {
            downmix_into(interleaved, self.input.channels, out);
            return;
        }
        let mut mono = std::mem::take(&mut self.mono);
        downmix_into(interleaved, self.input.channels, &mut mono);
        out.clear();
        self.resample_into(&mono, out);
        self.mono = mono;
    }

    /// Frame samples that have already been through `convert_into`, handing
    /// each complete frame to `emit` in order.
    pub fn push_converted(&mut self, converted: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(converted);

        let mut start = 0;
        while self.pending.len() - start >= self.frame_size {
            let end = start + self.frame_size;
            emit(AudioFrame::from_f32(&self.pending[start..end], self.target_rate));
            start = end;
        }
        self.pending.drain(..start);
    }

    /// Linear resampling across block boundaries.
    ///
    /// The previous block's last sample is treated as index -1 so the
    /// interpolation is continuous from one callback to the next.
    fn resample_into(&mut self, mono: &[f32], output: &mut Vec<f32>) {
        if mono.is_empty() {
            return;
        }

        let step = self.input.sample_rate as f64 / self.target_rate as f64;
        let anchor = self.last_sample.unwrap_or(mono[0]);
        let sample_at = |index: isize| -> f32 {
            if index < 0 {
                anchor
            } else {
                mono[index as usize]
            }
        };

        output.reserve((mono.len() as f64 / step).ceil() as usize + 1);
        // position is relative to the start of this block, may be in [-1, 0)
        let last_index = (mono.len() - 1) as f64;
        while self.position <= last_index {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let i = base as isize;
            let a = sample_at(i);
            let b = if (i + 1) as f64 > last_index {
                a
            } else {
                sample_at(i + 1)
            };
            output.push(a + (b - a) * frac);
            self.position += step;
        }

        self.position -= mono.len() as f64;
        self.last_sample = mono.last().copied();
    }
}

/// Average interleaved channels into `out` (cleared first).
pub fn downmix_into(interleaved: &[f32], channels: u16, out: &mut Vec<f32>) {
    out.clear();
    let channels = channels.max(1) as usize;
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
    );
}
