use std::time::Duration;

/// Failures while turning an inbound frame into a [`crate::message::ClientToServer`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("BAR not found")]
    RoomNotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the relay")]
    NotConnected,

    #[error("connection to the relay closed")]
    ConnectionClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("decode timed out after {0:?}")]
    DecodeTimeout(Duration),

    #[error("playback error: {0}")]
    Playback(String),
}
