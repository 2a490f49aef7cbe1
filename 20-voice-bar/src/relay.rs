use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::RelayConfig,
    message::{
        BarId, ClientToServer, MemberId, MemberInfo, ServerToClient, decode_client_message,
        read_frame, write_message,
    },
    registry::{ConnectionHandle, ConnectionId, RoomRegistry},
};

/// How long a closing connection may spend flushing its outbox.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, state } = self;
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &tracker);
                }
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &RelayState) {
    info!("relay shutting down");
    for connection in state.connections.lock().await.values() {
        connection.try_deliver(ServerToClient::error("relay shutting down"));
    }
    state.shutdown.cancel();
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    tracker: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, tracker),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    tracker: &TaskTracker,
) {
    let state = Arc::clone(state);
    tracker.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

struct RelayState {
    registry: Arc<RoomRegistry>,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Where a connection's member currently lives.
#[derive(Debug, Clone)]
struct Association {
    bar_id: BarId,
    member_id: MemberId,
}

struct Session {
    handle: ConnectionHandle,
    association: Option<Association>,
}

impl Session {
    async fn reply(&self, message: ServerToClient) {
        if !self.handle.deliver(message).await {
            debug!(connection = self.handle.id(), "reply dropped, writer is gone");
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (outbox_tx, outbox_rx) = mpsc::channel(state.config.outbound_buffer.max(1));
    let handle = ConnectionHandle::new(state.next_id(), outbox_tx);
    state
        .connections
        .lock()
        .await
        .insert(handle.id(), handle.clone());
    let mut writer_task = tokio::spawn(run_writer(writer, outbox_rx));

    info!(%peer, connection = handle.id(), "client connected");
    let mut session = Session {
        handle,
        association: None,
    };

    let result = run_session(&state, &mut reader, &mut session).await;
    cleanup_disconnect(&state, &mut session, peer).await;

    // The writer exits once the last sender for this outbox is dropped.
    drop(session);
    if timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        writer_task.abort();
    }

    result
}

async fn run_writer(mut writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<ServerToClient>) {
    while let Some(message) = outbox.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            debug!(?err, "failed to deliver message to client");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        trace!(?err, "writer shutdown failed");
    }
}

async fn run_session<R>(state: &RelayState, reader: &mut R, session: &mut Session) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        select! {
            _ = state.shutdown.cancelled() => break,
            frame = read_frame(reader) => {
                match frame {
                    Ok(Some(frame)) => handle_frame(state, session, &frame).await,
                    Ok(None) => break,
                    Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                        session.reply(ServerToClient::error("Invalid message format")).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
    Ok(())
}

async fn handle_frame(state: &RelayState, session: &mut Session, frame: &str) {
    let message = match decode_client_message(frame) {
        Ok(message) => message,
        Err(err) => {
            debug!(connection = session.handle.id(), ?err, "rejected frame");
            session.reply(ServerToClient::error(err.to_string())).await;
            return;
        }
    };

    match message {
        ClientToServer::CreateBar { title, user } => handle_create(state, session, title, user).await,
        ClientToServer::JoinBar { bar_id, user } => handle_join(state, session, bar_id, user).await,
        ClientToServer::LeaveBar => leave_current(state, session).await,
        ClientToServer::GetBars => {
            let bars = state.registry.list_rooms().await;
            session.reply(ServerToClient::BarsList { bars }).await;
        }
        ClientToServer::ChatMessage { message } => handle_chat(state, session, message).await,
        ClientToServer::AudioChunk {
            audio_data,
            timestamp,
            duration,
        } => handle_audio(state, session, audio_data, timestamp, duration).await,
        ClientToServer::ToggleMute { is_muted } => handle_mute(state, session, is_muted).await,
    }
}

async fn handle_create(state: &RelayState, session: &mut Session, title: String, user: MemberInfo) {
    leave_current(state, session).await;

    let (bar_id, host) = state
        .registry
        .create_room(title.clone(), user, session.handle.clone())
        .await;
    info!(bar = %bar_id, member = %host.id, %title, "bar created");

    session.association = Some(Association {
        bar_id: bar_id.clone(),
        member_id: host.id,
    });
    session
        .reply(ServerToClient::BarCreated {
            bar_id,
            title,
            role: host.role,
        })
        .await;
}

async fn handle_join(state: &RelayState, session: &mut Session, bar_id: BarId, user: MemberInfo) {
    if let Err(err) = state.registry.get_room(&bar_id).await {
        debug!(bar = %bar_id, member = %user.id, "join rejected: {err}");
        session.reply(ServerToClient::error(err.to_string())).await;
        return;
    }

    let already_here = session
        .association
        .as_ref()
        .is_some_and(|current| current.bar_id == bar_id && current.member_id == user.id);
    if !already_here {
        leave_current(state, session).await;
    }

    // Queues `joined_bar` and the `user_joined` broadcast under the room lock.
    let outcome = match state
        .registry
        .join_room(&bar_id, user.clone(), session.handle.clone())
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            debug!(bar = %bar_id, member = %user.id, "bar closed before join: {err}");
            session.association = None;
            session.reply(ServerToClient::error(err.to_string())).await;
            return;
        }
    };

    info!(bar = %bar_id, member = %user.id, members = outcome.members.len(), "member joined");
    session.association = Some(Association {
        bar_id,
        member_id: user.id,
    });
}

async fn leave_current(state: &RelayState, session: &mut Session) {
    let Some(Association { bar_id, member_id }) = session.association.take() else {
        return;
    };

    // No-op once another connection has rejoined under the same member id.
    match state
        .registry
        .leave_room(&bar_id, &member_id, session.handle.id())
        .await
    {
        Some(outcome) => {
            info!(bar = %bar_id, member = %member_id, closed = outcome.room_closed, "member left")
        }
        None => debug!(bar = %bar_id, member = %member_id, "membership already gone"),
    }
}

async fn handle_chat(state: &RelayState, session: &mut Session, message: String) {
    let audience = match &session.association {
        Some(current) => {
            state
                .registry
                .audience(&current.bar_id, &current.member_id, session.handle.id(), true)
                .await
        }
        None => None,
    };

    let Some(audience) = audience else {
        session.association = None;
        session.reply(ServerToClient::error("Not in any BAR")).await;
        return;
    };

    if message.trim().is_empty() {
        return;
    }

    let event = ServerToClient::ChatMessage {
        user: audience.sender,
        message,
        timestamp: Utc::now(),
    };
    for recipient in audience.recipients {
        recipient.try_deliver(event.clone());
    }
}

async fn handle_audio(
    state: &RelayState,
    session: &Session,
    audio_data: String,
    timestamp: i64,
    duration: u64,
) {
    let Some(current) = &session.association else {
        trace!(connection = session.handle.id(), "audio before joining, dropped");
        return;
    };

    if let Some(limit) = state.config.max_audio_payload {
        if audio_data.len() > limit {
            debug!(member = %current.member_id, size = audio_data.len(), limit, "oversized audio chunk dropped");
            return;
        }
    }

    let Some(audience) = state
        .registry
        .audience(&current.bar_id, &current.member_id, session.handle.id(), false)
        .await
    else {
        return;
    };

    trace!(member = %current.member_id, duration, recipients = audience.recipients.len(), "relaying audio");
    let event = ServerToClient::AudioChunk {
        user_id: audience.sender.id,
        username: audience.sender.username,
        audio_data,
        timestamp,
    };
    for recipient in audience.recipients {
        recipient.try_deliver(event.clone());
    }
}

async fn handle_mute(state: &RelayState, session: &Session, is_muted: bool) {
    let Some(current) = &session.association else {
        return;
    };

    let peers = state
        .registry
        .set_muted(&current.bar_id, &current.member_id, session.handle.id(), is_muted)
        .await;
    for peer in peers {
        peer.try_deliver(ServerToClient::UserMuted {
            user_id: current.member_id.clone(),
            is_muted,
        });
    }
}

async fn cleanup_disconnect(state: &RelayState, session: &mut Session, peer: SocketAddr) {
    leave_current(state, session).await;
    state.connections.lock().await.remove(&session.handle.id());
    info!(%peer, connection = session.handle.id(), "client disconnected");
}
