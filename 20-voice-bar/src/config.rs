//! Typed settings for the relay, the connection layer and the audio pipeline.
//!
//! The CLI in [`crate::cli`] fills these in; tests build them directly.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

pub const DEFAULT_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5050));

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Envelopes queued per connection before broadcasts to it start being skipped.
    pub outbound_buffer: usize,
    /// Largest base64 audio payload relayed. `None` relays anything.
    pub max_audio_payload: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDR,
            outbound_buffer: 256,
            max_audio_payload: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that may be shaved off at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub reconnect: BackoffConfig,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_ADDR,
            reconnect: BackoffConfig::default(),
            event_buffer: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub chunk_duration: Duration,
    pub level_interval: Duration,
    pub decode_timeout: Duration,
    /// Extra time a chunk may take to play beyond its decoded length.
    pub play_slack: Duration,
    pub min_payload_bytes: usize,
    pub min_decoded_duration: Duration,
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_millis(200),
            level_interval: Duration::from_millis(50),
            decode_timeout: Duration::from_secs(1),
            play_slack: Duration::from_millis(500),
            min_payload_bytes: 100,
            min_decoded_duration: Duration::from_millis(10),
            sample_rate: 16_000,
        }
    }
}
