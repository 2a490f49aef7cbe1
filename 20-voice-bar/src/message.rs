use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub type BarId = String;
pub type MemberId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Speaker,
    Listener,
}

/// Identity a client claims for itself. The relay trusts it as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: MemberId,
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub is_muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BarSummary {
    pub id: BarId,
    pub title: String,
    pub user_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientToServer {
    CreateBar {
        title: String,
        user: MemberInfo,
    },
    JoinBar {
        bar_id: BarId,
        user: MemberInfo,
    },
    LeaveBar,
    GetBars,
    ChatMessage {
        message: String,
    },
    AudioChunk {
        audio_data: String,
        timestamp: i64,
        #[serde(default)]
        duration: u64,
    },
    ToggleMute {
        is_muted: bool,
    },
}

impl ClientToServer {
    pub const TYPES: &'static [&'static str] = &[
        "create_bar",
        "join_bar",
        "leave_bar",
        "get_bars",
        "chat_message",
        "audio_chunk",
        "toggle_mute",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            ClientToServer::CreateBar { .. } => "create_bar",
            ClientToServer::JoinBar { .. } => "join_bar",
            ClientToServer::LeaveBar => "leave_bar",
            ClientToServer::GetBars => "get_bars",
            ClientToServer::ChatMessage { .. } => "chat_message",
            ClientToServer::AudioChunk { .. } => "audio_chunk",
            ClientToServer::ToggleMute { .. } => "toggle_mute",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerToClient {
    BarCreated {
        bar_id: BarId,
        title: String,
        role: Role,
    },
    JoinedBar {
        bar_id: BarId,
        users: Vec<MemberInfo>,
    },
    UserJoined {
        user: MemberInfo,
    },
    UserLeft {
        user: MemberInfo,
    },
    UserMuted {
        user_id: MemberId,
        is_muted: bool,
    },
    ChatMessage {
        user: MemberInfo,
        message: String,
        timestamp: DateTime<Utc>,
    },
    AudioChunk {
        user_id: MemberId,
        username: String,
        audio_data: String,
        timestamp: i64,
    },
    BarsList {
        bars: Vec<BarSummary>,
    },
    Error {
        error: String,
    },
}

impl ServerToClient {
    pub fn error(message: impl Into<String>) -> Self {
        ServerToClient::Error {
            error: message.into(),
        }
    }
}

/// Decodes one inbound frame, telling apart unknown tags from malformed bodies.
pub fn decode_client_message(frame: &str) -> Result<ClientToServer, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(frame).map_err(|err| ProtocolError::Malformed(err.to_string()))?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing type tag".to_string()))?;

    if !ClientToServer::TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

/// Reads the next non-empty line, without the trailing line ending.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(frame) => serde_json::from_str(&frame).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // One envelope per line; serde_json never emits a raw newline inside a value.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
