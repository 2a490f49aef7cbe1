//! Line-oriented terminal client.
//!
//! Plain input lines are chat. Lines starting with `/` are commands:
//! `/bars`, `/create <title>`, `/join <bar id>`, `/leave`, `/who`, `/mute`,
//! `/deafen`, `/record`, `/stop`, `/level` and `/quit`.

use std::sync::Arc;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::{broadcast, watch},
};
use tracing::{debug, warn};

use crate::{
    audio::{
        capture::{CaptureBackend, ToneCapture},
        pipeline::AudioPipeline,
        session::AudioSessionState,
        sink::{AudioSink, PcmSink},
    },
    cli::ClientArgs,
    client::connection::{ConnectionManager, ConnectionState, LocalIdentity},
    error::ClientError,
    message::{Role, ServerToClient},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let audio_config = args.audio_config();
    let identity = LocalIdentity::new(args.name.clone());
    let state = Arc::new(AudioSessionState::new());
    let manager = ConnectionManager::new(args.client_config(), identity.clone(), Arc::clone(&state));

    let capture: Arc<dyn CaptureBackend> = if args.tone {
        Arc::new(ToneCapture::new(audio_config.sample_rate))
    } else {
        default_capture(audio_config.sample_rate)
    };
    let sink = default_sink(audio_config.sample_rate);
    let pipeline = AudioPipeline::new(
        audio_config,
        identity.id.clone(),
        state,
        Arc::new(manager.clone()),
        capture,
        sink,
    );

    let mut events = manager.subscribe();
    let audio_listener = pipeline.attach(manager.subscribe());
    let mut connection = manager.watch_state();
    manager.connect();

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let result = run_console_loop(
        &manager,
        &pipeline,
        &mut events,
        &mut connection,
        &mut stdin,
        &mut input,
    )
    .await;

    pipeline.stop_recording().await;
    manager.disconnect().await;
    audio_listener.abort();
    result
}

#[cfg(feature = "cpal")]
fn default_capture(sample_rate: u32) -> Arc<dyn CaptureBackend> {
    Arc::new(crate::audio::device::CpalCapture::new(sample_rate))
}

#[cfg(not(feature = "cpal"))]
fn default_capture(_sample_rate: u32) -> Arc<dyn CaptureBackend> {
    Arc::new(crate::audio::capture::DeniedCapture)
}

#[cfg(feature = "cpal")]
fn default_sink(sample_rate: u32) -> Arc<dyn AudioSink> {
    match crate::audio::device::CpalSink::open(sample_rate) {
        Ok(sink) => Arc::new(sink),
        Err(err) => {
            warn!(error = %err, "no speaker available, received audio will be silent");
            Arc::new(PcmSink::new(sample_rate))
        }
    }
}

#[cfg(not(feature = "cpal"))]
fn default_sink(sample_rate: u32) -> Arc<dyn AudioSink> {
    Arc::new(PcmSink::new(sample_rate))
}

async fn run_console_loop(
    manager: &ConnectionManager,
    pipeline: &AudioPipeline,
    events: &mut broadcast::Receiver<ServerToClient>,
    connection: &mut watch::Receiver<ConnectionState>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let mut was_connected = false;
    loop {
        input.clear();
        select! {
            event = events.recv() => match event {
                Ok(message) => render_server_message(manager, message).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "console fell behind relay events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *connection.borrow_and_update();
                was_connected = render_connection_change(manager, was_connected, current).await?;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, manager, pipeline).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn render_connection_change(
    manager: &ConnectionManager,
    was_connected: bool,
    current: ConnectionState,
) -> io::Result<bool> {
    match current {
        ConnectionState::Connected if !was_connected => {
            write_stdout(&format!(
                "*** connected as {}",
                manager.identity().username
            ))
            .await?;
            Ok(true)
        }
        ConnectionState::Disconnected if was_connected => {
            write_stdout("*** connection lost, reconnecting").await?;
            Ok(false)
        }
        ConnectionState::Connected => Ok(true),
        ConnectionState::Connecting | ConnectionState::Disconnected => Ok(was_connected),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    manager: &ConnectionManager,
    pipeline: &AudioPipeline,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    let Some(command) = text.strip_prefix('/') else {
        report(manager.send_chat_message(text)).await?;
        return Ok(true);
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));

    match name.to_ascii_lowercase().as_str() {
        "quit" => {
            write_stdout("*** leaving").await?;
            return Ok(false);
        }
        "bars" => report(manager.get_bars()).await?,
        "create" if !rest.is_empty() => report(manager.create_bar(rest)).await?,
        "join" if !rest.is_empty() => report(manager.join_bar(rest)).await?,
        "create" | "join" => write_stderr(&format!("!!! usage: /{name} <argument>")).await?,
        "leave" => match manager.leave_bar() {
            Ok(()) => write_stdout("*** left the bar").await?,
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        },
        "who" => render_members(manager).await?,
        "mute" => {
            let muted = pipeline.toggle_mute();
            write_stdout(if muted { "*** muted" } else { "*** unmuted" }).await?;
        }
        "deafen" => {
            let deafened = pipeline.toggle_deafen();
            write_stdout(if deafened { "*** deafened" } else { "*** undeafened" }).await?;
        }
        "record" => match pipeline.start_recording().await {
            Ok(()) => write_stdout("*** recording").await?,
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        },
        "stop" => {
            pipeline.stop_recording().await;
            write_stdout("*** recording stopped").await?;
        }
        "level" => {
            let audio = pipeline.state().snapshot();
            let playback = pipeline.playback();
            write_stdout(&format!(
                "*** input level {} (recording: {}, muted: {}, deafened: {}, playing: {}, queued: {})",
                audio.input_level,
                audio.is_recording,
                audio.is_muted,
                audio.is_deafened,
                playback.is_playing(),
                playback.pending()
            ))
            .await?;
        }
        other => write_stderr(&format!("!!! unknown command /{other}")).await?,
    }
    Ok(true)
}

async fn report(result: Result<(), ClientError>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => write_stderr(&format!("!!! {err}")).await,
    }
}

async fn render_members(manager: &ConnectionManager) -> io::Result<()> {
    let Some(bar_id) = manager.current_bar() else {
        return write_stdout("*** not in a bar").await;
    };
    let names: Vec<String> = manager
        .members()
        .iter()
        .map(|member| {
            let mut name = member.username.clone();
            if member.role == Role::Host {
                name.push_str(" (host)");
            }
            if member.is_muted {
                name.push_str(" [muted]");
            }
            name
        })
        .collect();
    write_stdout(&format!("*** in {bar_id}: {}", names.join(", "))).await
}

async fn render_server_message(manager: &ConnectionManager, message: ServerToClient) -> io::Result<()> {
    match message {
        ServerToClient::BarCreated {
            bar_id,
            title,
            role,
        } => {
            write_stdout(&format!(
                "*** created bar {title} ({bar_id}) as {}",
                role_name(role)
            ))
            .await
        }
        ServerToClient::JoinedBar { bar_id, users } => {
            if users.is_empty() {
                return write_stdout(&format!("*** joined bar {bar_id}, nobody else here")).await;
            }
            let names: Vec<&str> = users.iter().map(|user| user.username.as_str()).collect();
            write_stdout(&format!("*** joined bar {bar_id} with: {}", names.join(", "))).await
        }
        ServerToClient::UserJoined { user } => {
            write_stdout(&format!("*** {} joined the bar", user.username)).await
        }
        ServerToClient::UserLeft { user } => {
            write_stdout(&format!("*** {} left the bar", user.username)).await
        }
        ServerToClient::UserMuted { user_id, is_muted } => {
            let name = manager
                .members()
                .into_iter()
                .find(|member| member.id == user_id)
                .map(|member| member.username)
                .unwrap_or(user_id);
            let verb = if is_muted { "muted" } else { "unmuted" };
            write_stdout(&format!("*** {name} {verb}")).await
        }
        ServerToClient::ChatMessage { user, message, .. } => {
            write_stdout(&format!("<{}> {message}", user.username)).await
        }
        ServerToClient::BarsList { bars } => {
            if bars.is_empty() {
                return write_stdout("*** no open bars").await;
            }
            for bar in bars {
                write_stdout(&format!(
                    "*** {} {} ({} inside)",
                    bar.id, bar.title, bar.user_count
                ))
                .await?;
            }
            Ok(())
        }
        // Played by the audio pipeline.
        ServerToClient::AudioChunk { .. } => Ok(()),
        ServerToClient::Error { error } => write_stderr(&format!("!!! {error}")).await,
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Host => "host",
        Role::Speaker => "speaker",
        Role::Listener => "listener",
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
