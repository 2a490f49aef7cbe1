use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::{audio::level::decode_pcm16, error::AudioError};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    pub samples: Vec<f32>,
    pub duration: Duration,
}

/// Decoder and output device for received chunks.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedChunk, AudioError>;

    /// Resolves once the chunk has finished playing.
    async fn play(&self, chunk: DecodedChunk) -> Result<(), AudioError>;
}

/// Decodes 16-bit PCM and paces "playback" in real time without an output device.
#[derive(Debug, Clone)]
pub struct PcmSink {
    sample_rate: u32,
}

impl PcmSink {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl AudioSink for PcmSink {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedChunk, AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::Decode("sample rate must be non-zero".into()));
        }
        if payload.len() % 2 != 0 {
            return Err(AudioError::Decode(format!(
                "odd payload length {} for 16-bit pcm",
                payload.len()
            )));
        }
        let samples = decode_pcm16(payload);
        let duration = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        Ok(DecodedChunk { samples, duration })
    }

    async fn play(&self, chunk: DecodedChunk) -> Result<(), AudioError> {
        trace!(samples = chunk.samples.len(), duration = ?chunk.duration, "playing chunk");
        tokio::time::sleep(chunk.duration).await;
        Ok(())
    }
}
