//! Client-side audio: capture, chunking, metering and ordered playback.
//!
//! Audio payloads are opaque to everything outside [`capture`] and [`sink`];
//! the relay and the connection layer only ever see base64 text.

pub mod capture;
#[cfg(feature = "cpal")]
pub mod device;
pub mod level;
pub mod pipeline;
pub mod playback;
pub mod session;
pub mod sink;

pub use pipeline::{AudioPipeline, AudioTransport};
pub use session::{AudioSessionState, AudioState};
