use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{AudioConfig, BackoffConfig, ClientConfig, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the voice relay, accepting TCP connections from clients.
    Relay(RelayArgs),
    /// Connect to a relay and hang out in bars from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5050")]
    pub listen: SocketAddr,

    /// Envelopes buffered per connection before broadcasts to it are skipped.
    #[arg(long, default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Drop relayed audio chunks whose base64 payload is longer than this.
    #[arg(long)]
    pub max_audio_payload: Option<usize>,
}

impl RelayArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            listen: self.listen,
            outbound_buffer: self.outbound_buffer.max(1),
            max_audio_payload: self.max_audio_payload,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name shown to other members.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:5050")]
    pub server: SocketAddr,

    /// Use a synthetic test tone as the microphone.
    #[arg(long)]
    pub tone: bool,

    /// Length of each captured audio chunk, in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub chunk_ms: u64,

    #[arg(long, default_value_t = 16_000)]
    pub sample_rate: u32,

    /// First reconnect delay, in milliseconds. Later delays double up to the maximum.
    #[arg(long, default_value_t = 500)]
    pub reconnect_initial_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_ms: u64,
}

impl ClientArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server: self.server,
            reconnect: BackoffConfig {
                initial: Duration::from_millis(self.reconnect_initial_ms),
                max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
                ..BackoffConfig::default()
            },
            ..ClientConfig::default()
        }
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            chunk_duration: Duration::from_millis(self.chunk_ms.max(1)),
            sample_rate: self.sample_rate,
            ..AudioConfig::default()
        }
    }
}
