//! Microphone and speaker backends on the default cpal host.
//!
//! cpal streams are not `Send`, so each stream is built, played and dropped on
//! a thread of its own. The rest of the client only sees the shared buffers
//! those threads fill and drain, always mono at the configured sample rate.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, mpsc},
    thread,
};

use async_trait::async_trait;
use cpal::{
    Device, Sample, SampleFormat, Stream, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use tracing::{debug, warn};

use crate::{
    audio::{
        capture::{CaptureBackend, CaptureStream},
        level::{downmix, encode_pcm16, resample},
        sink::{AudioSink, DecodedChunk, PcmSink},
    },
    error::AudioError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Captured {
    segment: Vec<f32>,
    recent: VecDeque<f32>,
}

/// The default input device, captured as 16-bit PCM segments.
#[derive(Debug, Clone)]
pub struct CpalCapture {
    sample_rate: u32,
}

impl CpalCapture {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl CaptureBackend for CpalCapture {
    fn open(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::DeviceUnavailable("sample rate must be non-zero".into()));
        }
        let sample_rate = self.sample_rate;
        let window = (sample_rate / 100).max(1) as usize;
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let shared = Arc::clone(&captured);
        let thread = thread::Builder::new()
            .name("voice-bar-mic".into())
            .spawn(move || {
                let stream = match open_input(sample_rate, window, shared) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns once the handle is stopped or dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|err| AudioError::DeviceUnavailable(format!("capture thread: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(MicStream {
                captured,
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(AudioError::DeviceUnavailable("capture thread exited".into())),
        }
    }
}

fn open_input(
    sample_rate: u32,
    window: usize,
    captured: Arc<Mutex<Captured>>,
) -> Result<Stream, AudioError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    debug!(device = %device.name().unwrap_or_default(), ?config, "opening microphone");

    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, sample_rate, window, captured),
        SampleFormat::I16 => build_input::<i16>(&device, &config, sample_rate, window, captured),
        SampleFormat::U16 => build_input::<u16>(&device, &config, sample_rate, window, captured),
    }?;
    stream
        .play()
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;
    Ok(stream)
}

fn build_input<T: Sample>(
    device: &Device,
    config: &StreamConfig,
    sample_rate: u32,
    window: usize,
    captured: Arc<Mutex<Captured>>,
) -> Result<Stream, AudioError> {
    let channels = usize::from(config.channels);
    let device_rate = config.sample_rate.0;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let raw: Vec<f32> = data.iter().map(Sample::to_f32).collect();
                let mono = resample(&downmix(&raw, channels), device_rate, sample_rate);
                let mut captured = lock(&captured);
                captured.segment.extend_from_slice(&mono);
                captured.recent.extend(mono);
                let excess = captured.recent.len().saturating_sub(window);
                captured.recent.drain(..excess);
            },
            |err| warn!(error = %err, "microphone stream error"),
        )
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))
}

struct MicStream {
    captured: Arc<Mutex<Captured>>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureStream for MicStream {
    fn finalize_segment(&mut self) -> Vec<u8> {
        encode_pcm16(&std::mem::take(&mut lock(&self.captured).segment))
    }

    fn recent_samples(&self) -> Vec<f32> {
        lock(&self.captured).recent.iter().copied().collect()
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the stream thread, which then drops the stream.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let mut captured = lock(&self.captured);
        captured.segment.clear();
        captured.recent.clear();
    }
}

impl Drop for MicStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct Playout {
    queue: VecDeque<f32>,
    failure: Option<String>,
}

/// The default output device. Decoding is the same 16-bit PCM as [`PcmSink`].
pub struct CpalSink {
    pcm: PcmSink,
    sample_rate: u32,
    device_rate: u32,
    playout: Arc<Mutex<Playout>>,
    _stop: mpsc::Sender<()>,
}

impl CpalSink {
    pub fn open(sample_rate: u32) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::DeviceUnavailable("sample rate must be non-zero".into()));
        }
        let playout = Arc::new(Mutex::new(Playout::default()));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let shared = Arc::clone(&playout);
        thread::Builder::new()
            .name("voice-bar-speaker".into())
            .spawn(move || {
                let (stream, device_rate) = match open_output(shared) {
                    Ok(opened) => opened,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(device_rate));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|err| AudioError::DeviceUnavailable(format!("output thread: {err}")))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("output thread exited".into()))??;
        Ok(Self {
            pcm: PcmSink::new(sample_rate),
            sample_rate,
            device_rate,
            playout,
            _stop: stop_tx,
        })
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedChunk, AudioError> {
        self.pcm.decode(payload).await
    }

    async fn play(&self, chunk: DecodedChunk) -> Result<(), AudioError> {
        let samples = resample(&chunk.samples, self.sample_rate, self.device_rate);
        {
            let mut playout = lock(&self.playout);
            if let Some(failure) = &playout.failure {
                return Err(AudioError::Playback(failure.clone()));
            }
            playout.queue.extend(samples);
        }
        tokio::time::sleep(chunk.duration).await;
        Ok(())
    }
}

fn open_output(playout: Arc<Mutex<Playout>>) -> Result<(Stream, u32), AudioError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default output device".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    debug!(device = %device.name().unwrap_or_default(), ?config, "opening speaker");

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, playout),
        SampleFormat::I16 => build_output::<i16>(&device, &config, playout),
        SampleFormat::U16 => build_output::<u16>(&device, &config, playout),
    }?;
    stream
        .play()
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;
    Ok((stream, config.sample_rate.0))
}

fn build_output<T: Sample>(
    device: &Device,
    config: &StreamConfig,
    playout: Arc<Mutex<Playout>>,
) -> Result<Stream, AudioError> {
    let channels = usize::from(config.channels).max(1);
    let failed = Arc::clone(&playout);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut playout = lock(&playout);
                for frame in data.chunks_mut(channels) {
                    let value = playout.queue.pop_front().unwrap_or(0.0);
                    for sample in frame {
                        *sample = <T as Sample>::from(&value);
                    }
                }
            },
            move |err| {
                warn!(error = %err, "speaker stream error");
                lock(&failed).failure = Some(err.to_string());
            },
        )
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hosts without sound hardware only get to check the error path.
    #[test]
    fn microphone_opens_or_reports_the_device() {
        match CpalCapture::new(16_000).open() {
            Ok(mut stream) => {
                std::thread::sleep(std::time::Duration::from_millis(50));
                assert_eq!(stream.finalize_segment().len() % 2, 0);
                stream.stop();
                assert!(stream.finalize_segment().is_empty());
            }
            Err(err) => assert!(matches!(err, AudioError::DeviceUnavailable(_)), "{err}"),
        }
    }

    #[tokio::test]
    async fn speaker_opens_or_reports_the_device() {
        match CpalSink::open(16_000) {
            Ok(sink) => {
                assert!(matches!(sink.decode(&[0u8; 3]).await, Err(AudioError::Decode(_))));
                let chunk = sink.decode(&[0u8; 320]).await.expect("decode");
                sink.play(chunk).await.expect("play");
            }
            Err(err) => assert!(matches!(err, AudioError::DeviceUnavailable(_)), "{err}"),
        }
    }

    #[test]
    fn zero_rate_is_rejected_before_touching_the_host() {
        assert!(matches!(
            CpalCapture::new(0).open(),
            Err(AudioError::DeviceUnavailable(_))
        ));
        assert!(matches!(
            CpalSink::open(0),
            Err(AudioError::DeviceUnavailable(_))
        ));
    }
}
