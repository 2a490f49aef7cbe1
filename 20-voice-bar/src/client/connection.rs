//! Client side of the relay connection.
//!
//! A [`ConnectionManager`] owns one supervisor task per `connect()` call. The
//! supervisor dials the relay, pumps envelopes in both directions while the
//! socket is up, and on any close waits out a [`Backoff`] delay before dialing
//! again. Only `disconnect()` stops it.
//!
//! Inbound envelopes update a local [`BarMirror`] and are then re-published on
//! a broadcast channel so the console and the audio pipeline can react to them.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{Notify, broadcast, mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::session::AudioSessionState,
    client::backoff::Backoff,
    config::ClientConfig,
    error::ClientError,
    message::{
        BarId, BarSummary, ClientToServer, MemberId, MemberInfo, Role, ServerToClient,
        read_message, write_message,
    },
};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Who this client claims to be. Supplied by the surrounding session provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: MemberId,
    pub username: String,
}

impl LocalIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: generate_member_id(),
            username: username.into(),
        }
    }
}

/// Timestamp plus random suffix. Unique enough for one tab, not a security token.
pub fn generate_member_id() -> MemberId {
    format!("user_{}_{}", Utc::now().timestamp_millis(), nanoid::nanoid!(9))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub user: MemberInfo,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Local copy of the server state this client cares about.
#[derive(Debug, Clone, Default)]
pub struct BarMirror {
    pub current_bar: Option<BarId>,
    pub members: Vec<MemberInfo>,
    pub chat: Vec<ChatEntry>,
    pub directory: Vec<BarSummary>,
}

impl BarMirror {
    pub fn apply(&mut self, message: &ServerToClient, me: &MemberInfo) {
        match message {
            ServerToClient::BarCreated { bar_id, role, .. } => {
                self.current_bar = Some(bar_id.clone());
                self.members = vec![MemberInfo {
                    role: *role,
                    ..me.clone()
                }];
                self.chat.clear();
            }
            ServerToClient::JoinedBar { bar_id, users } => {
                self.current_bar = Some(bar_id.clone());
                self.members = users.clone();
                if !self.members.iter().any(|member| member.id == me.id) {
                    self.members.push(me.clone());
                }
                self.chat.clear();
            }
            ServerToClient::UserJoined { user } => {
                self.members.retain(|member| member.id != user.id);
                self.members.push(user.clone());
            }
            ServerToClient::UserLeft { user } => {
                self.members.retain(|member| member.id != user.id);
            }
            ServerToClient::UserMuted { user_id, is_muted } => {
                for member in self.members.iter_mut().filter(|m| &m.id == user_id) {
                    member.is_muted = *is_muted;
                }
            }
            ServerToClient::ChatMessage {
                user,
                message,
                timestamp,
            } => self.chat.push(ChatEntry {
                user: user.clone(),
                message: message.clone(),
                timestamp: *timestamp,
            }),
            ServerToClient::BarsList { bars } => self.directory = bars.clone(),
            ServerToClient::AudioChunk { .. } | ServerToClient::Error { .. } => {}
        }
    }

    pub fn clear_bar(&mut self) {
        self.current_bar = None;
        self.members.clear();
        self.chat.clear();
    }
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    identity: LocalIdentity,
    audio: Arc<AudioSessionState>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerToClient>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientToServer>>>,
    mirror: Mutex<BarMirror>,
    supervisor: Mutex<Option<Supervisor>>,
    retry_now: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "connection state changed");
        }
    }

    fn me(&self, role: Role) -> MemberInfo {
        MemberInfo {
            id: self.identity.id.clone(),
            username: self.identity.username.clone(),
            role,
            is_muted: self.audio.is_muted(),
        }
    }

    fn handle_inbound(&self, message: ServerToClient) {
        if let ServerToClient::Error { error } = &message {
            warn!(%error, "relay reported an error");
        }
        lock(&self.mirror).apply(&message, &self.me(Role::Listener));
        // No subscribers is fine; nobody is listening yet.
        let _ = self.events.send(message);
    }

    fn mark_disconnected(&self) {
        *lock(&self.outbound) = None;
        lock(&self.mirror).clear_bar();
        self.set_state(ConnectionState::Disconnected);
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, identity: LocalIdentity, audio: Arc<AudioSessionState>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                audio,
                state,
                events,
                outbound: Mutex::new(None),
                mirror: Mutex::new(BarMirror::default()),
                supervisor: Mutex::new(None),
                retry_now: Notify::new(),
            }),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    pub fn audio_state(&self) -> Arc<AudioSessionState> {
        Arc::clone(&self.inner.audio)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every envelope received from the relay, after the mirror has been updated.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerToClient> {
        self.inner.events.subscribe()
    }

    pub fn mirror(&self) -> BarMirror {
        lock(&self.inner.mirror).clone()
    }

    pub fn current_bar(&self) -> Option<BarId> {
        lock(&self.inner.mirror).current_bar.clone()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        lock(&self.inner.mirror).members.clone()
    }

    pub fn chat_history(&self) -> Vec<ChatEntry> {
        lock(&self.inner.mirror).chat.clone()
    }

    pub fn bar_directory(&self) -> Vec<BarSummary> {
        lock(&self.inner.mirror).directory.clone()
    }

    /// Starts the connection supervisor. Calling it while a supervisor is alive
    /// never opens a second socket; if that supervisor is waiting to retry, it
    /// retries immediately instead.
    pub fn connect(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if let Some(existing) = supervisor.as_ref() {
            if !existing.task.is_finished() {
                if self.state() == ConnectionState::Disconnected {
                    self.inner.retry_now.notify_one();
                }
                return;
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_supervisor(Arc::clone(&self.inner), cancel.clone()));
        *supervisor = Some(Supervisor { cancel, task });
    }

    /// Stops reconnecting and closes the socket. Returns once the socket is gone.
    pub async fn disconnect(&self) {
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(Supervisor { cancel, task }) = supervisor {
            cancel.cancel();
            if let Err(err) = task.await {
                warn!(?err, "connection supervisor ended abnormally");
            }
        }
        self.inner.mark_disconnected();
    }

    pub fn create_bar(&self, title: &str) -> Result<(), ClientError> {
        self.send(ClientToServer::CreateBar {
            title: title.to_string(),
            user: self.inner.me(Role::Host),
        })
    }

    pub fn join_bar(&self, bar_id: &str) -> Result<(), ClientError> {
        self.send(ClientToServer::JoinBar {
            bar_id: bar_id.to_string(),
            user: self.inner.me(Role::Listener),
        })
    }

    /// Leaves the current bar. Local state is cleared without waiting for the relay.
    pub fn leave_bar(&self) -> Result<(), ClientError> {
        self.send(ClientToServer::LeaveBar)?;
        lock(&self.inner.mirror).clear_bar();
        Ok(())
    }

    pub fn get_bars(&self) -> Result<(), ClientError> {
        self.send(ClientToServer::GetBars)
    }

    pub fn send_chat_message(&self, message: &str) -> Result<(), ClientError> {
        self.send(ClientToServer::ChatMessage {
            message: message.to_string(),
        })
    }

    pub fn send_audio_chunk(&self, audio_data: String, timestamp: i64, duration: u64) -> Result<(), ClientError> {
        self.send(ClientToServer::AudioChunk {
            audio_data,
            timestamp,
            duration,
        })
    }

    pub fn send_mute_state(&self, is_muted: bool) -> Result<(), ClientError> {
        self.send(ClientToServer::ToggleMute { is_muted })
    }

    fn send(&self, message: ClientToServer) -> Result<(), ClientError> {
        if !self.is_connected() {
            warn!(kind = message.kind(), "not connected, message not sent");
            return Err(ClientError::NotConnected);
        }
        match lock(&self.inner.outbound).as_ref() {
            Some(outbound) => outbound
                .send(message)
                .map_err(|_| ClientError::ConnectionClosed),
            None => Err(ClientError::NotConnected),
        }
    }
}

async fn run_supervisor(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(inner.config.reconnect.clone());

    loop {
        inner.set_state(ConnectionState::Connecting);
        let dialed = select! {
            _ = cancel.cancelled() => break,
            result = TcpStream::connect(inner.config.server) => result,
        };

        match dialed {
            Ok(stream) => {
                backoff.reset();
                if let Err(err) = run_connection(&inner, stream, &cancel).await {
                    warn!(error = ?err, "relay connection failed");
                }
            }
            Err(err) => debug!(server = %inner.config.server, error = ?err, "failed to reach relay"),
        }

        inner.mark_disconnected();
        if cancel.is_cancelled() {
            break;
        }

        let delay = backoff.next_delay();
        info!(?delay, attempt = backoff.attempt(), "reconnecting to relay");
        select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = inner.retry_now.notified() => {}
        }
    }

    inner.mark_disconnected();
}

async fn run_connection(inner: &Inner, stream: TcpStream, cancel: &CancellationToken) -> io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    *lock(&inner.outbound) = Some(outbound_tx);
    inner.set_state(ConnectionState::Connected);
    info!(server = %inner.config.server, "connected to relay");

    // Writes run on their own task so a half-read inbound line is never
    // dropped by a select! branch switching to an outbound write.
    let mut writer_task = tokio::spawn(pump_outbound(writer, outbound_rx));
    let mut writer_done = false;

    let result = loop {
        select! {
            _ = cancel.cancelled() => break Ok(()),
            written = &mut writer_task => {
                writer_done = true;
                break match written {
                    Ok(result) => result,
                    Err(err) => Err(io::Error::other(err)),
                };
            }
            inbound = read_message::<_, ServerToClient>(&mut reader) => match inbound {
                Ok(Some(message)) => inner.handle_inbound(message),
                Ok(None) => {
                    info!("relay closed the connection");
                    break Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!(error = ?err, "ignoring undecodable envelope");
                }
                Err(err) => break Err(err),
            },
        }
    };

    // Dropping the last sender lets the writer flush and close its half.
    *lock(&inner.outbound) = None;
    if !writer_done && timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    result
}

async fn pump_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<ClientToServer>,
) -> io::Result<()> {
    while let Some(message) = outbound.recv().await {
        write_message(&mut writer, &message).await?;
    }
    if let Err(err) = writer.shutdown().await {
        debug!(?err, "failed to shutdown relay writer cleanly");
    }
    Ok(())
}
