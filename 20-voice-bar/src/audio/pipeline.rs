//! Microphone to relay, relay to speaker.
//!
//! Recording runs two independent loops over one open [`CaptureStream`]: the
//! chunk loop finalizes a segment every `chunk_duration` and sends it, and the
//! level loop samples the input every `level_interval` for the meter. Muting
//! discards finalized segments but keeps capture, and so metering, running.
//!
//! Inbound chunks go through [`PlaybackQueue`].

use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use tokio::{
    select,
    sync::broadcast,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    audio::{
        capture::{CaptureBackend, CaptureStream},
        level::input_level,
        playback::{AudioChunk, PlaybackQueue},
        session::AudioSessionState,
        sink::AudioSink,
    },
    client::connection::{ConnectionManager, ConnectionState},
    config::AudioConfig,
    error::{AudioError, ClientError},
    message::{MemberId, ServerToClient},
};

/// Where outbound audio goes. Implemented by [`ConnectionManager`].
pub trait AudioTransport: Send + Sync {
    fn is_ready(&self) -> bool;

    fn send_audio(&self, audio_data: String, timestamp: i64, duration: u64) -> Result<(), ClientError>;

    fn announce_mute(&self, is_muted: bool) -> Result<(), ClientError>;
}

impl AudioTransport for ConnectionManager {
    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send_audio(&self, audio_data: String, timestamp: i64, duration: u64) -> Result<(), ClientError> {
        self.send_audio_chunk(audio_data, timestamp, duration)
    }

    fn announce_mute(&self, is_muted: bool) -> Result<(), ClientError> {
        self.send_mute_state(is_muted)
    }
}

type SharedStream = Arc<Mutex<Box<dyn CaptureStream>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Recording {
    cancel: CancellationToken,
    stream: SharedStream,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: AudioConfig,
    local_id: MemberId,
    state: Arc<AudioSessionState>,
    transport: Arc<dyn AudioTransport>,
    capture: Arc<dyn CaptureBackend>,
    playback: PlaybackQueue,
    recording: tokio::sync::Mutex<Option<Recording>>,
}

#[derive(Clone)]
pub struct AudioPipeline {
    inner: Arc<Inner>,
}

impl AudioPipeline {
    /// Must be called from within a tokio runtime; the playback worker starts immediately.
    pub fn new(
        config: AudioConfig,
        local_id: MemberId,
        state: Arc<AudioSessionState>,
        transport: Arc<dyn AudioTransport>,
        capture: Arc<dyn CaptureBackend>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let playback = PlaybackQueue::spawn(sink, Arc::clone(&state), &config);
        Self {
            inner: Arc::new(Inner {
                config,
                local_id,
                state,
                transport,
                capture,
                playback,
                recording: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> &Arc<AudioSessionState> {
        &self.inner.state
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.inner.playback
    }

    /// Opens the capture device and starts chunking. A second call while
    /// recording does nothing.
    pub async fn start_recording(&self) -> Result<(), AudioError> {
        let mut recording = self.inner.recording.lock().await;
        if recording.is_some() {
            return Ok(());
        }

        let stream: SharedStream = Arc::new(Mutex::new(self.inner.capture.open()?));
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_chunk_loop(
                Arc::clone(&stream),
                Arc::clone(&self.inner.state),
                Arc::clone(&self.inner.transport),
                self.inner.config.chunk_duration,
                cancel.clone(),
            )),
            tokio::spawn(run_level_loop(
                Arc::clone(&stream),
                Arc::clone(&self.inner.state),
                self.inner.config.level_interval,
                cancel.clone(),
            )),
        ];

        *recording = Some(Recording {
            cancel,
            stream,
            tasks,
        });
        self.inner.state.set_recording(true);
        info!("recording started");
        Ok(())
    }

    /// Stops both loops and releases the capture device before returning.
    pub async fn stop_recording(&self) {
        let mut recording = self.inner.recording.lock().await;
        let Some(Recording {
            cancel,
            stream,
            tasks,
        }) = recording.take()
        else {
            return;
        };

        cancel.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(?err, "capture task ended abnormally");
            }
        }
        lock(&stream).stop();

        self.inner.state.set_recording(false);
        self.inner.state.set_input_level(0);
        info!("recording stopped");
    }

    /// Encodes and sends one captured segment. Returns whether it went out.
    pub fn send_audio_chunk(&self, payload: &[u8], duration: Duration) -> bool {
        send_segment(
            &self.inner.state,
            self.inner.transport.as_ref(),
            payload,
            duration,
        )
    }

    /// Queues a chunk relayed from another member. Returns whether it was queued.
    pub fn handle_remote_chunk(&self, user_id: &str, username: &str, audio_data: &str, timestamp: i64) -> bool {
        if user_id == self.inner.local_id {
            trace!("dropping own chunk");
            return false;
        }
        if self.inner.state.is_deafened() {
            trace!(from = user_id, "deafened, dropping chunk");
            return false;
        }
        let payload = match STANDARD.decode(audio_data) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(from = user_id, error = %err, "dropping chunk with bad base64");
                return false;
            }
        };
        self.inner.playback.enqueue(AudioChunk {
            payload,
            member_id: user_id.to_string(),
            username: username.to_string(),
            timestamp,
        })
    }

    /// Feeds relayed `audio_chunk` envelopes into playback until the event
    /// stream closes or the pipeline is dropped.
    pub fn attach(&self, mut events: broadcast::Receiver<ServerToClient>) -> JoinHandle<()> {
        let pipeline: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "audio listener lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = pipeline.upgrade() else {
                    break;
                };
                if let ServerToClient::AudioChunk {
                    user_id,
                    username,
                    audio_data,
                    timestamp,
                } = event
                {
                    AudioPipeline { inner }.handle_remote_chunk(&user_id, &username, &audio_data, timestamp);
                }
            }
        })
    }

    /// Flips mute and tells the room. Returns the new value.
    pub fn toggle_mute(&self) -> bool {
        let muted = self.inner.state.toggle_muted();
        if let Err(err) = self.inner.transport.announce_mute(muted) {
            debug!(error = %err, "mute change not announced");
        }
        muted
    }

    /// Flips deafen. Local only. Returns the new value.
    pub fn toggle_deafen(&self) -> bool {
        self.inner.state.toggle_deafened()
    }
}

fn send_segment(state: &AudioSessionState, transport: &dyn AudioTransport, payload: &[u8], duration: Duration) -> bool {
    if state.is_muted() || !transport.is_ready() {
        return false;
    }
    let timestamp = Utc::now().timestamp_millis();
    match transport.send_audio(STANDARD.encode(payload), timestamp, duration.as_millis() as u64) {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "audio chunk not sent");
            false
        }
    }
}

async fn run_chunk_loop(
    stream: SharedStream,
    state: Arc<AudioSessionState>,
    transport: Arc<dyn AudioTransport>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first segment ends one period later.
    ticker.tick().await;

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let segment = lock(&stream).finalize_segment();
        if segment.is_empty() {
            continue;
        }
        if state.is_muted() {
            trace!(bytes = segment.len(), "muted, discarding segment");
            continue;
        }
        send_segment(&state, transport.as_ref(), &segment, period);
    }
}

async fn run_level_loop(
    stream: SharedStream,
    state: Arc<AudioSessionState>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let samples = lock(&stream).recent_samples();
        state.set_input_level(input_level(&samples));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::audio::{capture::DeniedCapture, sink::PcmSink};

    #[derive(Default)]
    struct FakeTransport {
        ready: AtomicBool,
        sent: Mutex<Vec<(String, u64)>>,
        mutes: Mutex<Vec<bool>>,
    }

    impl AudioTransport for FakeTransport {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn send_audio(&self, audio_data: String, _timestamp: i64, duration: u64) -> Result<(), ClientError> {
            self.sent.lock().unwrap().push((audio_data, duration));
            Ok(())
        }

        fn announce_mute(&self, is_muted: bool) -> Result<(), ClientError> {
            self.mutes.lock().unwrap().push(is_muted);
            Ok(())
        }
    }

    /// Every segment is 200 loud bytes; counts opens and finalizes.
    #[derive(Default)]
    struct CountingCapture {
        opened: Arc<AtomicUsize>,
        finalized: Arc<AtomicUsize>,
    }

    struct CountingStream {
        finalized: Arc<AtomicUsize>,
    }

    impl CaptureStream for CountingStream {
        fn finalize_segment(&mut self) -> Vec<u8> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            vec![0x7f; 200]
        }

        fn recent_samples(&self) -> Vec<f32> {
            vec![1.0; 16]
        }

        fn stop(&mut self) {}
    }

    impl CaptureBackend for CountingCapture {
        fn open(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingStream {
                finalized: Arc::clone(&self.finalized),
            }))
        }
    }

    fn config() -> AudioConfig {
        AudioConfig {
            chunk_duration: Duration::from_millis(20),
            level_interval: Duration::from_millis(10),
            ..AudioConfig::default()
        }
    }

    fn pipeline(transport: Arc<FakeTransport>, capture: Arc<dyn CaptureBackend>) -> AudioPipeline {
        AudioPipeline::new(
            config(),
            "me".into(),
            Arc::new(AudioSessionState::new()),
            transport,
            capture,
            Arc::new(PcmSink::new(16_000)),
        )
    }

    #[tokio::test]
    async fn recording_sends_base64_chunks() {
        let transport = Arc::new(FakeTransport::default());
        transport.ready.store(true, Ordering::SeqCst);
        let pipeline = pipeline(Arc::clone(&transport), Arc::new(CountingCapture::default()));

        pipeline.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        pipeline.stop_recording().await;

        let sent = transport.sent.lock().unwrap().clone();
        assert!(!sent.is_empty());
        let (payload, duration) = &sent[0];
        assert_eq!(STANDARD.decode(payload).unwrap(), vec![0x7f; 200]);
        assert_eq!(*duration, 20);
        assert!(!pipeline.state().is_recording());
        assert_eq!(pipeline.state().input_level(), 0);
    }

    #[tokio::test]
    async fn muted_capture_keeps_ticking_but_sends_nothing() {
        let transport = Arc::new(FakeTransport::default());
        transport.ready.store(true, Ordering::SeqCst);
        let capture = CountingCapture::default();
        let finalized = Arc::clone(&capture.finalized);
        let pipeline = pipeline(Arc::clone(&transport), Arc::new(capture));

        assert!(pipeline.toggle_mute());
        pipeline.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(finalized.load(Ordering::SeqCst) >= 2);
        assert!(pipeline.state().input_level() > 0);
        pipeline.stop_recording().await;

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(*transport.mutes.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn nothing_is_sent_while_the_connection_is_down() {
        let transport = Arc::new(FakeTransport::default());
        let pipeline = pipeline(Arc::clone(&transport), Arc::new(CountingCapture::default()));
        assert!(!pipeline.send_audio_chunk(&[1; 200], Duration::from_millis(200)));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let transport = Arc::new(FakeTransport::default());
        let capture = CountingCapture::default();
        let opened = Arc::clone(&capture.opened);
        let pipeline = pipeline(transport, Arc::new(capture));

        pipeline.start_recording().await.unwrap();
        pipeline.start_recording().await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        pipeline.stop_recording().await;
        pipeline.stop_recording().await;
        pipeline.start_recording().await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        pipeline.stop_recording().await;
    }

    #[tokio::test]
    async fn denied_permission_leaves_recording_off() {
        let pipeline = pipeline(Arc::new(FakeTransport::default()), Arc::new(DeniedCapture));
        let result = pipeline.start_recording().await;
        assert!(matches!(result, Err(AudioError::PermissionDenied(_))));
        assert!(!pipeline.state().is_recording());
    }

    #[tokio::test]
    async fn own_and_deafened_chunks_are_not_queued() {
        let transport = Arc::new(FakeTransport::default());
        let pipeline = pipeline(Arc::clone(&transport), Arc::new(CountingCapture::default()));
        let audio = STANDARD.encode([0u8; 640]);

        assert!(!pipeline.handle_remote_chunk("me", "Me", &audio, 0));
        assert!(!pipeline.handle_remote_chunk("bob", "Bob", "not base64!", 0));

        assert!(pipeline.toggle_deafen());
        assert!(!pipeline.handle_remote_chunk("bob", "Bob", &audio, 0));
        assert!(!pipeline.toggle_deafen());
        assert!(pipeline.handle_remote_chunk("bob", "Bob", &audio, 0));

        // Deafen is never announced.
        assert!(transport.mutes.lock().unwrap().is_empty());
    }
}
