use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use voice_bar::{
    config::RelayConfig,
    message::{ClientToServer, MemberInfo, Role, ServerToClient, read_message, write_message},
    registry::RoomRegistry,
    relay::RelayServer,
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let relay = RelayServer::new(listener, RelayConfig::default());
        let registry = relay.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.server.await;
    }
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    user: MemberInfo,
}

impl Peer {
    async fn connect(addr: SocketAddr, id: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            user: MemberInfo {
                id: id.to_string(),
                username: id.to_uppercase(),
                role: Role::Listener,
                is_muted: false,
            },
        })
    }

    async fn send(&mut self, message: ClientToServer) -> Result<()> {
        write_message(&mut self.writer, &message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ServerToClient> {
        timeout(READ_TIMEOUT, read_message::<_, ServerToClient>(&mut self.reader))
            .await
            .context("timed out waiting for envelope")??
            .context("relay closed the connection")
    }

    async fn assert_quiet(&mut self) -> Result<()> {
        match timeout(QUIET_PERIOD, read_message::<_, ServerToClient>(&mut self.reader)).await {
            Err(_) => Ok(()),
            Ok(other) => anyhow::bail!("expected silence, got {other:?}"),
        }
    }

    async fn create(&mut self, title: &str) -> Result<String> {
        let user = MemberInfo {
            role: Role::Host,
            ..self.user.clone()
        };
        self.send(ClientToServer::CreateBar {
            title: title.to_string(),
            user,
        })
        .await?;
        match self.recv().await? {
            ServerToClient::BarCreated { bar_id, role, .. } => {
                assert_eq!(role, Role::Host);
                Ok(bar_id)
            }
            other => anyhow::bail!("expected bar_created, got {other:?}"),
        }
    }

    async fn join(&mut self, bar_id: &str) -> Result<Vec<MemberInfo>> {
        self.send(ClientToServer::JoinBar {
            bar_id: bar_id.to_string(),
            user: self.user.clone(),
        })
        .await?;
        match self.recv().await? {
            ServerToClient::JoinedBar { users, .. } => Ok(users),
            other => anyhow::bail!("expected joined_bar, got {other:?}"),
        }
    }

    async fn bars(&mut self) -> Result<Vec<voice_bar::message::BarSummary>> {
        self.send(ClientToServer::GetBars).await?;
        match self.recv().await? {
            ServerToClient::BarsList { bars } => Ok(bars),
            other => anyhow::bail!("expected bars_list, got {other:?}"),
        }
    }
}

async fn wait_for_room_count(registry: &RoomRegistry, expected: usize) -> Result<()> {
    for _ in 0..50 {
        if registry.list_rooms().await.len() == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("room count never reached {expected}")
}

#[tokio::test]
async fn lounge_scenario() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut a = Peer::connect(relay.addr, "a").await?;
    let mut b = Peer::connect(relay.addr, "b").await?;

    let bar_id = a.create("Lounge").await?;

    let users = b.join(&bar_id).await?;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, "a");
    assert_eq!(users[0].role, Role::Host);
    assert_eq!(
        a.recv().await?,
        ServerToClient::UserJoined { user: b.user.clone() }
    );

    a.send(ClientToServer::ChatMessage {
        message: "hi".into(),
    })
    .await?;
    for peer in [&mut a, &mut b] {
        match peer.recv().await? {
            ServerToClient::ChatMessage { user, message, .. } => {
                assert_eq!(user.id, "a");
                assert_eq!(message, "hi");
            }
            other => anyhow::bail!("expected chat, got {other:?}"),
        }
    }

    let b_user = b.user.clone();
    drop(b);
    assert_eq!(a.recv().await?, ServerToClient::UserLeft { user: b_user });
    let room = relay.registry.get_room(&bar_id).await?;
    assert_eq!(room.members.len(), 1);

    drop(a);
    wait_for_room_count(&relay.registry, 0).await?;
    assert!(relay.registry.get_room(&bar_id).await.is_err());

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_room_yields_exactly_one_error() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut a = Peer::connect(relay.addr, "a").await?;
    let mut b = Peer::connect(relay.addr, "b").await?;
    let bar_id = a.create("Lounge").await?;

    b.send(ClientToServer::JoinBar {
        bar_id: "nonexistent".into(),
        user: b.user.clone(),
    })
    .await?;
    assert_eq!(b.recv().await?, ServerToClient::error("BAR not found"));
    b.assert_quiet().await?;
    a.assert_quiet().await?;

    let bars = b.bars().await?;
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].id, bar_id);
    assert_eq!(bars[0].user_count, 1);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn audio_skips_the_sender_but_chat_does_not() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut a = Peer::connect(relay.addr, "a").await?;
    let mut b = Peer::connect(relay.addr, "b").await?;
    let mut c = Peer::connect(relay.addr, "c").await?;

    let bar_id = a.create("Lounge").await?;
    b.join(&bar_id).await?;
    a.recv().await?;
    c.join(&bar_id).await?;
    a.recv().await?;
    b.recv().await?;

    a.send(ClientToServer::AudioChunk {
        audio_data: "AAECAw==".into(),
        timestamp: 42,
        duration: 200,
    })
    .await?;
    for peer in [&mut b, &mut c] {
        assert_eq!(
            peer.recv().await?,
            ServerToClient::AudioChunk {
                user_id: "a".into(),
                username: "A".into(),
                audio_data: "AAECAw==".into(),
                timestamp: 42,
            }
        );
    }

    // Replies are ordered, so the list arriving first proves no audio came back.
    let bars = a.bars().await?;
    assert_eq!(bars[0].user_count, 3);

    a.send(ClientToServer::ChatMessage {
        message: "cheers".into(),
    })
    .await?;
    for peer in [&mut a, &mut b, &mut c] {
        assert!(matches!(
            peer.recv().await?,
            ServerToClient::ChatMessage { .. }
        ));
    }

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn bad_frames_do_not_close_the_connection() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut a = Peer::connect(relay.addr, "a").await?;

    a.writer.write_all(b"this is not json\n").await?;
    assert_eq!(a.recv().await?, ServerToClient::error("Invalid message format"));

    a.writer.write_all(b"{\"type\":\"dance\"}\n").await?;
    assert_eq!(
        a.recv().await?,
        ServerToClient::error("Unknown message type: dance")
    );

    a.send(ClientToServer::ChatMessage {
        message: "anyone?".into(),
    })
    .await?;
    assert_eq!(a.recv().await?, ServerToClient::error("Not in any BAR"));

    assert!(a.bars().await?.is_empty());

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn leaving_and_muting_notify_the_others() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut a = Peer::connect(relay.addr, "a").await?;
    let mut b = Peer::connect(relay.addr, "b").await?;

    let bar_id = a.create("Lounge").await?;
    b.join(&bar_id).await?;
    a.recv().await?;

    b.send(ClientToServer::ToggleMute { is_muted: true }).await?;
    assert_eq!(
        a.recv().await?,
        ServerToClient::UserMuted {
            user_id: "b".into(),
            is_muted: true,
        }
    );
    let room = relay.registry.get_room(&bar_id).await?;
    assert!(room.members.iter().any(|m| m.id == "b" && m.is_muted));

    b.send(ClientToServer::LeaveBar).await?;
    match a.recv().await? {
        ServerToClient::UserLeft { user } => assert_eq!(user.id, "b"),
        other => anyhow::bail!("expected user_left, got {other:?}"),
    }
    b.assert_quiet().await?;

    a.send(ClientToServer::LeaveBar).await?;
    assert!(a.bars().await?.is_empty());

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut a = Peer::connect(relay.addr, "a").await?;
    a.create("Lounge").await?;

    relay.stop().await;
    assert_eq!(a.recv().await?, ServerToClient::error("relay shutting down"));
    let closed = timeout(READ_TIMEOUT, read_message::<_, ServerToClient>(&mut a.reader)).await??;
    assert!(closed.is_none());
    Ok(())
}

#[tokio::test]
async fn reconnecting_member_survives_its_old_socket_closing() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut host = Peer::connect(relay.addr, "host").await?;
    let bar_id = host.create("Lounge").await?;

    let mut old = Peer::connect(relay.addr, "x").await?;
    old.join(&bar_id).await?;
    assert!(matches!(host.recv().await?, ServerToClient::UserJoined { .. }));

    let mut fresh = Peer::connect(relay.addr, "x").await?;
    let users = fresh.join(&bar_id).await?;
    assert_eq!(users.len(), 1);
    assert!(matches!(host.recv().await?, ServerToClient::UserJoined { .. }));

    drop(old);
    host.assert_quiet().await?;

    fresh
        .send(ClientToServer::ChatMessage {
            message: "back".into(),
        })
        .await?;
    match fresh.recv().await? {
        ServerToClient::ChatMessage { user, message, .. } => {
            assert_eq!(user.id, "x");
            assert_eq!(message, "back");
        }
        other => anyhow::bail!("expected chat, got {other:?}"),
    }
    assert_eq!(relay.registry.get_room(&bar_id).await?.members.len(), 2);

    relay.stop().await;
    Ok(())
}
