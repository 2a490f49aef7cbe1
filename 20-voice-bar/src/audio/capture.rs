use std::{f64::consts::TAU, time::Instant};

use crate::{audio::level::encode_pcm16, error::AudioError};

/// Something that can hand out a live input stream, such as a microphone.
pub trait CaptureBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureStream>, AudioError>;
}

/// A running capture. Segments are opaque encoded bytes.
pub trait CaptureStream: Send {
    /// Closes the segment captured so far and immediately starts the next one.
    fn finalize_segment(&mut self) -> Vec<u8>;

    /// The most recent input samples, for level metering only.
    fn recent_samples(&self) -> Vec<f32>;

    fn stop(&mut self);
}

/// Synthesizes a sine tone in real time as 16-bit PCM.
#[derive(Debug, Clone)]
pub struct ToneCapture {
    pub sample_rate: u32,
    pub frequency: f64,
    pub amplitude: f64,
}

impl ToneCapture {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frequency: 440.0,
            amplitude: 0.25,
        }
    }
}

impl CaptureBackend for ToneCapture {
    fn open(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::DeviceUnavailable("sample rate must be non-zero".into()));
        }
        Ok(Box::new(ToneStream {
            tone: self.clone(),
            started: Instant::now(),
            emitted: 0,
            stopped: false,
        }))
    }
}

struct ToneStream {
    tone: ToneCapture,
    started: Instant,
    emitted: u64,
    stopped: bool,
}

impl ToneStream {
    fn due(&self) -> u64 {
        (self.started.elapsed().as_secs_f64() * self.tone.sample_rate as f64) as u64
    }

    fn sample_at(&self, index: u64) -> f32 {
        let t = index as f64 / self.tone.sample_rate as f64;
        (self.tone.amplitude * (TAU * self.tone.frequency * t).sin()) as f32
    }
}

impl CaptureStream for ToneStream {
    fn finalize_segment(&mut self) -> Vec<u8> {
        if self.stopped {
            return Vec::new();
        }
        let due = self.due();
        let samples: Vec<f32> = (self.emitted..due).map(|n| self.sample_at(n)).collect();
        self.emitted = due;
        encode_pcm16(&samples)
    }

    fn recent_samples(&self) -> Vec<f32> {
        if self.stopped {
            return Vec::new();
        }
        let due = self.due();
        let window = u64::from(self.tone.sample_rate / 100).max(1);
        (due.saturating_sub(window)..due)
            .map(|n| self.sample_at(n))
            .collect()
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Backend for builds without a microphone, or whose permission prompt was refused.
#[derive(Debug, Clone, Default)]
pub struct DeniedCapture;

impl CaptureBackend for DeniedCapture {
    fn open(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
        Err(AudioError::PermissionDenied(
            "microphone access was not granted".into(),
        ))
    }
}
