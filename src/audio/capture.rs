//! # PCM Capture Engine
//!
//! Acquires the microphone, converts what it delivers into fixed-rate mono
//! PCM, and exposes a spectral tap while running.
//!
//! ## Modes:
//! - **Streaming** (call session): every complete `AudioFrame` is handed to an
//!   unbounded channel the moment it exists; nothing is retained.
//! - **Recording** (enrollment): converted blocks are appended to a
//!   `RecordingBuffer`; `stop()` encodes them into one WAV recording.
//!
//! ## Threading:
//! The device callback runs on the audio backend's own thread. The cpal
//! stream handle is not `Send` on every platform, so `CpalInput` owns it on a
//! dedicated thread and only a stop channel crosses back. Opening and closing
//! the device are async: the caller awaits the thread's ready signal and
//! its exit instead of parking a runtime worker.
//!
//! Steady-state device blocks reuse pre-sized buffers; only the frames
//! handed downstream are allocated.

use crate::audio::buffer::{Recording, RecordingBuffer};
use crate::audio::frame::AudioFrame;
use crate::audio::processor::{FrameProcessor, InputFormat};
use crate::audio::spectrum::SpectrumTap;
use crate::config::AudioSettings;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use async_trait::async_trait;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Device callback: one interleaved f32 block plus the format it is in.
pub type BlockCallback = Box<dyn FnMut(&[f32], InputFormat) + Send + 'static>;

/// A source of raw microphone blocks.
///
/// `open` must either start delivering blocks and return the device format,
/// or fail with `AppError::DeviceUnavailable` and leave nothing running.
/// `release` signals the device to stop without waiting for it, for use
/// where awaiting is impossible (`Drop`).
#[async_trait]
pub trait AudioInput: Send {
    async fn open(&mut self, on_block: BlockCallback) -> AppResult<InputFormat>;
    async fn close(&mut self);
    fn release(&mut self);
}

/// Current state of the capture engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

enum CaptureMode {
    Streaming(mpsc::UnboundedSender<AudioFrame>),
    Recording(Arc<Mutex<RecordingBuffer>>),
}

/// The capture engine: one device, one mode, start/stop guarded by state.
pub struct PcmCapture {
    input: Box<dyn AudioInput>,
    mode: CaptureMode,
    target_rate: u32,
    frame_size: usize,
    spectrum: SpectrumTap,
    state: CaptureState,
    started_at: Option<Instant>,
}

impl PcmCapture {
    /// Engine that forwards frames to `frame_tx` (call sessions).
    pub fn streaming(
        input: Box<dyn AudioInput>,
        settings: &AudioSettings,
        frame_tx: mpsc::UnboundedSender<AudioFrame>,
    ) -> Self {
        Self::with_mode(input, settings, CaptureMode::Streaming(frame_tx))
    }

    /// Engine that accumulates a retrievable recording (enrollment).
    pub fn recording(input: Box<dyn AudioInput>, settings: &AudioSettings) -> Self {
        let buffer = RecordingBuffer::new(settings.sample_rate);
        Self::with_mode(
            input,
            settings,
            CaptureMode::Recording(Arc::new(Mutex::new(buffer))),
        )
    }

    fn with_mode(input: Box<dyn AudioInput>, settings: &AudioSettings, mode: CaptureMode) -> Self {
        Self {
            input,
            mode,
            target_rate: settings.sample_rate,
            frame_size: settings.frame_size,
            spectrum: SpectrumTap::new(settings.fft_size),
            state: CaptureState::Idle,
            started_at: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    /// Live spectral tap, available only while capturing.
    pub fn spectrum(&self) -> Option<SpectrumTap> {
        self.is_capturing().then(|| self.spectrum.clone())
    }

    /// Seconds since `start()`, zero when idle.
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Request the microphone and begin producing blocks.
    ///
    /// Calling this while already capturing is a no-op. On failure the engine
    /// stays `Idle` so the caller can retry.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.is_capturing() {
            debug!("Capture already running, ignoring start");
            return Ok(());
        }

        self.spectrum.clear();
        if let CaptureMode::Recording(buffer) = &self.mode {
            buffer.lock().unwrap().clear();
        }

        let callback = self.block_callback();
        let format = self.input.open(callback).await?;

        self.state = CaptureState::Capturing;
        self.started_at = Some(Instant::now());
        info!(
            "Capture started ({}Hz x{} -> {}Hz mono)",
            format.sample_rate, format.channels, self.target_rate
        );
        Ok(())
    }

    /// Halt capture and release the device.
    ///
    /// ## Returns:
    /// - Recording mode: `Some(recording)` with every block in arrival order
    /// - Streaming mode, or when not capturing: `None`
    pub async fn stop(&mut self) -> AppResult<Option<Recording>> {
        if !self.is_capturing() {
            return Ok(None);
        }

        self.input.close().await;
        self.state = CaptureState::Idle;
        let elapsed = self.elapsed_secs();
        self.started_at = None;
        self.spectrum.clear();
        info!("Capture stopped after {:.1}s", elapsed);

        match &self.mode {
            CaptureMode::Streaming(_) => Ok(None),
            CaptureMode::Recording(buffer) => {
                let mut buffer = buffer.lock().unwrap();
                let recording = buffer.encode_wav()?;
                buffer.clear();
                Ok(Some(recording))
            }
        }
    }

    /// Build the closure that runs on the audio thread.
    fn block_callback(&self) -> BlockCallback {
        let target_rate = self.target_rate;
        let frame_size = self.frame_size;
        let spectrum = self.spectrum.clone();
        let mut processor: Option<(InputFormat, FrameProcessor)> = None;
        let mut converted: Vec<f32> = Vec::with_capacity(target_rate as usize / 10);

        let mut sink: Box<dyn FnMut(&mut FrameProcessor, &[f32], &mut Vec<f32>) + Send> =
            match &self.mode {
                CaptureMode::Streaming(tx) => {
                    let tx = tx.clone();
                    Box::new(move |proc: &mut FrameProcessor, block: &[f32], out: &mut Vec<f32>| {
                        proc.convert_into(block, out);
                        spectrum.feed(out.as_slice());
                        proc.push_converted(out.as_slice(), |frame| {
                            // Receiver gone means the session is tearing down
                            let _ = tx.send(frame);
                        });
                    })
                }
                CaptureMode::Recording(buffer) => {
                    let buffer = buffer.clone();
                    Box::new(move |proc: &mut FrameProcessor, block: &[f32], out: &mut Vec<f32>| {
                        proc.convert_into(block, out);
                        spectrum.feed(out.as_slice());
                        buffer.lock().unwrap().append(out.clone());
                    })
                }
            };

        Box::new(move |block: &[f32], format: InputFormat| {
            let needs_new = processor.as_ref().map(|(f, _)| *f != format).unwrap_or(true);
            if needs_new {
                processor = Some((format, FrameProcessor::new(format, target_rate, frame_size)));
            }
            if let Some((_, proc)) = processor.as_mut() {
                sink(proc, block, &mut converted);
            }
        })
    }
}

impl Drop for PcmCapture {
    fn drop(&mut self) {
        if self.is_capturing() {
            self.input.release();
        }
    }
}

/// Microphone input through cpal's default host and device.
pub struct CpalInput {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self {
            stop_tx: None,
            thread: None,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> AppResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AppError::DeviceUnavailable(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Default for CpalInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    async fn open(&mut self, on_block: BlockCallback) -> AppResult<InputFormat> {
        self.close().await;

        let (ready_tx, ready_rx) = oneshot::channel::<AppResult<InputFormat>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let stream = match open_default_stream(on_block) {
                Ok((stream, format)) => {
                    let _ = ready_tx.send(Ok(format));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Park until told to stop (or the engine is dropped)
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Input stream released");
        });

        let ready = ready_rx
            .await
            .map_err(|_| AppError::DeviceUnavailable("Capture thread exited".to_string()));

        match ready {
            Ok(Ok(format)) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                Ok(format)
            }
            Ok(Err(e)) | Err(e) => {
                join_capture_thread(handle).await;
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            join_capture_thread(handle).await;
        }
    }

    fn release(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        // Detached: the thread drops the stream and exits on its own
        self.thread.take();
    }
}

async fn join_capture_thread(handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("Capture thread panicked"),
        Err(e) => warn!("Could not join capture thread: {}", e),
    }
}

fn open_default_stream(on_block: BlockCallback) -> AppResult<(cpal::Stream, InputFormat)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AppError::DeviceUnavailable("No input device available".to_string()))?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device
        .default_input_config()
        .map_err(|e| AppError::DeviceUnavailable(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let format = InputFormat::new(config.sample_rate.0, config.channels);

    // Roughly 100ms of interleaved samples; most backends deliver less
    let scratch_len = (config.sample_rate.0 as usize / 10) * config.channels.max(1) as usize;

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, format, scratch_len, on_block),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, format, scratch_len, on_block),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, format, scratch_len, on_block),
        other => {
            return Err(AppError::DeviceUnavailable(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| AppError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AppError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, format))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: InputFormat,
    scratch_len: usize,
    mut on_block: BlockCallback,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::with_capacity(scratch_len);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
            on_block(&scratch, format);
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )
}

#[cfg(test)]
pub mod testing {
    //! Scriptable input used by capture and session tests.

    use super::*;

    type SharedCallback = Arc<Mutex<Option<BlockCallback>>>;

    /// Input whose blocks are pushed by the test.
    #[derive(Clone)]
    pub struct FakeInput {
        callback: SharedCallback,
        format: InputFormat,
        deny: Arc<Mutex<bool>>,
        hold: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
        pub opened: Arc<Mutex<u32>>,
    }

    impl FakeInput {
        pub fn new(format: InputFormat) -> Self {
            Self {
                callback: Arc::new(Mutex::new(None)),
                format,
                deny: Arc::new(Mutex::new(false)),
                hold: Arc::new(Mutex::new(None)),
                opened: Arc::new(Mutex::new(0)),
            }
        }

        pub fn set_denied(&self, denied: bool) {
            *self.deny.lock().unwrap() = denied;
        }

        /// Make the next `open` wait until the returned sender fires, the
        /// way a real device reports ready from its own thread.
        pub fn hold_open(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.hold.lock().unwrap() = Some(rx);
            tx
        }

        /// Deliver one block as the device would. Returns false when closed.
        pub fn deliver(&self, block: &[f32]) -> bool {
            let mut guard = self.callback.lock().unwrap();
            match guard.as_mut() {
                Some(cb) => {
                    cb(block, self.format);
                    true
                }
                None => false,
            }
        }

        pub fn is_open(&self) -> bool {
            self.callback.lock().unwrap().is_some()
        }
    }

    #[async_trait]
    impl AudioInput for FakeInput {
        async fn open(&mut self, on_block: BlockCallback) -> AppResult<InputFormat> {
            let hold = self.hold.lock().unwrap().take();
            if let Some(ready) = hold {
                let _ = ready.await;
            }
            if *self.deny.lock().unwrap() {
                return Err(AppError::DeviceUnavailable("Permission denied".to_string()));
            }
            *self.callback.lock().unwrap() = Some(on_block);
            *self.opened.lock().unwrap() += 1;
            Ok(self.format)
        }

        async fn close(&mut self) {
            self.callback.lock().unwrap().take();
        }

        fn release(&mut self) {
            self.callback.lock().unwrap().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeInput;
    use super::*;
    use crate::audio::buffer::decode_wav;
    use crate::config::AppConfig;

    fn settings(frame_size: usize) -> AudioSettings {
        let mut settings = AppConfig::default().audio;
        settings.frame_size = frame_size;
        settings.fft_size = 64;
        settings
    }

    #[tokio::test]
    async fn test_denied_device_leaves_capture_idle_and_retryable() {
        let input = FakeInput::new(InputFormat::new(16000, 1));
        input.set_denied(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut capture = PcmCapture::streaming(Box::new(input.clone()), &settings(4), tx);

        let err = capture.start().await.unwrap_err();
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(capture.spectrum().is_none());

        input.set_denied(false);
        capture.start().await.unwrap();
        assert!(capture.is_capturing());
    }

    #[tokio::test]
    async fn test_start_twice_is_noop_and_stop_when_idle_is_noop() {
        let input = FakeInput::new(InputFormat::new(16000, 1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut capture = PcmCapture::streaming(Box::new(input.clone()), &settings(4), tx);

        assert!(capture.stop().await.unwrap().is_none());
        capture.start().await.unwrap();
        capture.start().await.unwrap();
        assert_eq!(*input.opened.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_yields_to_other_tasks_while_device_opens() {
        // Single-threaded runtime: a start() that blocked its thread would
        // never let the second branch run and would hang here.
        let input = FakeInput::new(InputFormat::new(16000, 1));
        let ready = input.hold_open();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut capture = PcmCapture::streaming(Box::new(input.clone()), &settings(4), tx);

        let (started, signalled) = tokio::join!(capture.start(), async {
            tokio::task::yield_now().await;
            ready.send(()).is_ok()
        });

        assert!(signalled);
        started.unwrap();
        assert!(capture.is_capturing());
        assert!(input.is_open());
    }

    #[tokio::test]
    async fn test_drop_while_capturing_releases_device() {
        let input = FakeInput::new(InputFormat::new(16000, 1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut capture = PcmCapture::streaming(Box::new(input.clone()), &settings(4), tx);
        capture.start().await.unwrap();
        assert!(input.is_open());

        drop(capture);
        assert!(!input.is_open());
    }

    #[tokio::test]
    async fn test_streaming_emits_fixed_frames_in_order() {
        let input = FakeInput::new(InputFormat::new(16000, 2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut capture = PcmCapture::streaming(Box::new(input.clone()), &settings(3), tx);
        capture.start().await.unwrap();

        // Stereo pairs average to 0.1, 0.2, ... 0.6
        let block: Vec<f32> = (1..=6).flat_map(|i| [i as f32 / 10.0; 2]).collect();
        assert!(input.deliver(&block));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(first.len(), 3);
        assert!(first.samples()[0] < second.samples()[0]);

        assert!(capture.stop().await.unwrap().is_none());
        assert!(!input.is_open());
    }

    #[tokio::test]
    async fn test_recording_mode_returns_exact_recording() {
        let input = FakeInput::new(InputFormat::new(16000, 1));
        let mut capture = PcmCapture::recording(Box::new(input.clone()), &settings(4096));
        capture.start().await.unwrap();
        assert!(capture.spectrum().is_some());

        let lengths = [128usize, 1, 4000, 77];
        for len in lengths {
            input.deliver(&vec![0.25; len]);
        }

        let recording = capture.stop().await.unwrap().unwrap();
        assert_eq!(recording.sample_count, lengths.iter().sum::<usize>());
        let (rate, samples) = decode_wav(&recording.bytes).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(samples.len(), recording.sample_count);
    }

    #[tokio::test]
    async fn test_restart_clears_previous_recording() {
        let input = FakeInput::new(InputFormat::new(16000, 1));
        let mut capture = PcmCapture::recording(Box::new(input.clone()), &settings(4096));

        capture.start().await.unwrap();
        input.deliver(&[0.1; 100]);
        capture.stop().await.unwrap();

        capture.start().await.unwrap();
        input.deliver(&[0.1; 10]);
        let recording = capture.stop().await.unwrap().unwrap();
        assert_eq!(recording.sample_count, 10);
    }
}
