use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use voice_bar::{
    audio::AudioSessionState,
    client::{ConnectionManager, ConnectionState, LocalIdentity},
    config::{BackoffConfig, ClientConfig, RelayConfig},
    message::{Role, ServerToClient},
    relay::RelayServer,
};

const WAIT: Duration = Duration::from_secs(3);

struct TestRelay {
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(addr: SocketAddr) -> Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let relay = RelayServer::new(listener, RelayConfig::default());
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = relay
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Ok((Self { shutdown, server }, addr))
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}

fn manager(server: SocketAddr, name: &str) -> ConnectionManager {
    let config = ClientConfig {
        server,
        reconnect: BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..ClientConfig::default()
    };
    ConnectionManager::new(
        config,
        LocalIdentity::new(name),
        Arc::new(AudioSessionState::new()),
    )
}

async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) -> Result<()> {
    let mut states = manager.watch_state();
    timeout(WAIT, states.wait_for(|state| *state == wanted))
        .await
        .with_context(|| format!("never reached {wanted:?}"))??;
    Ok(())
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..150 {
        if check() {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("timed out waiting for {what}")
}

#[tokio::test]
async fn connect_twice_opens_one_socket() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let acceptor = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let client = manager(addr, "alice");
    client.connect();
    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await?;
    client.connect();

    sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(client.is_connected());

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    acceptor.abort();
    Ok(())
}

#[tokio::test]
async fn reconnects_after_the_relay_restarts() -> Result<()> {
    let (relay, addr) = TestRelay::start("127.0.0.1:0".parse()?).await?;
    let client = manager(addr, "alice");
    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await?;

    client.create_bar("Lounge")?;
    eventually("bar_created", || client.current_bar().is_some()).await?;

    relay.stop().await;
    wait_for_state(&client, ConnectionState::Disconnected).await?;
    assert!(client.current_bar().is_none());
    assert!(client.members().is_empty());
    assert!(client.get_bars().is_err());

    let (relay, _) = TestRelay::start(addr).await?;
    wait_for_state(&client, ConnectionState::Connected).await?;

    // The new relay starts empty.
    let mut events = client.subscribe();
    client.get_bars()?;
    match timeout(WAIT, events.recv()).await?? {
        ServerToClient::BarsList { bars } => assert!(bars.is_empty()),
        other => anyhow::bail!("expected bars_list, got {other:?}"),
    }
    client.create_bar("Second round")?;
    eventually("bar_created after reconnect", || client.current_bar().is_some()).await?;

    client.disconnect().await;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn mirrors_follow_the_room() -> Result<()> {
    let (relay, addr) = TestRelay::start("127.0.0.1:0".parse()?).await?;
    let alice = manager(addr, "alice");
    let bob = manager(addr, "bob");
    alice.connect();
    bob.connect();
    wait_for_state(&alice, ConnectionState::Connected).await?;
    wait_for_state(&bob, ConnectionState::Connected).await?;

    alice.create_bar("Lounge")?;
    eventually("alice in a bar", || alice.current_bar().is_some()).await?;
    let bar_id = alice.current_bar().context("alice bar id")?;
    assert_eq!(alice.members()[0].role, Role::Host);

    bob.get_bars()?;
    eventually("bob sees the directory", || bob.bar_directory().len() == 1).await?;
    assert_eq!(bob.bar_directory()[0].title, "Lounge");

    bob.join_bar(&bar_id)?;
    eventually("bob joined", || bob.members().len() == 2).await?;
    eventually("alice sees bob", || alice.members().len() == 2).await?;
    let bob_members: Vec<_> = bob.members().into_iter().map(|m| m.username).collect();
    assert_eq!(bob_members, vec!["alice", "bob"]);

    bob.send_chat_message("evening")?;
    eventually("chat reaches alice", || alice.chat_history().len() == 1).await?;
    eventually("chat echoes to bob", || bob.chat_history().len() == 1).await?;
    assert_eq!(alice.chat_history()[0].user.username, "bob");

    bob.send_mute_state(true)?;
    eventually("alice sees bob muted", || {
        alice.members().iter().any(|m| m.username == "bob" && m.is_muted)
    })
    .await?;

    bob.leave_bar()?;
    assert!(bob.current_bar().is_none());
    assert!(bob.chat_history().is_empty());
    eventually("alice sees bob leave", || alice.members().len() == 1).await?;

    alice.disconnect().await;
    bob.disconnect().await;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_stops_retrying() -> Result<()> {
    let probe = TcpListener::bind("127.0.0.1:0").await?;
    let addr = probe.local_addr()?;
    drop(probe);

    let client = manager(addr, "alice");
    client.connect();
    sleep(Duration::from_millis(150)).await;
    assert_ne!(client.state(), ConnectionState::Connected);
    client.disconnect().await;

    let listener = TcpListener::bind(addr).await?;
    let accepted = timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(accepted.is_err(), "client dialed after disconnect");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}
