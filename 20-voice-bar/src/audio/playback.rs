//! Received-audio queue.
//!
//! Chunks are played strictly in arrival order by a single worker task. A
//! chunk that fails to decode or play in time, or turns out to be implausibly
//! small, is skipped and the worker moves on to the next one.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, trace};

use crate::{
    audio::{session::AudioSessionState, sink::AudioSink},
    config::AudioConfig,
    error::AudioError,
    message::MemberId,
};

/// One received segment, waiting to be played.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub payload: Vec<u8>,
    pub member_id: MemberId,
    pub username: String,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

pub struct PlaybackQueue {
    queue: mpsc::UnboundedSender<AudioChunk>,
    state: Arc<AudioSessionState>,
    pending: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl PlaybackQueue {
    pub fn spawn(sink: Arc<dyn AudioSink>, state: Arc<AudioSessionState>, config: &AudioConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let playing = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(run_worker(
            rx,
            sink,
            Arc::clone(&state),
            Arc::clone(&pending),
            Arc::clone(&playing),
            config.clone(),
        ));

        Self {
            queue,
            state,
            pending,
            playing,
            worker,
        }
    }

    /// Queues a chunk behind everything already waiting. Returns `false` if it
    /// was dropped because output is deafened.
    pub fn enqueue(&self, chunk: AudioChunk) -> bool {
        if self.state.is_deafened() {
            trace!(from = %chunk.member_id, "deafened, dropping chunk");
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(chunk).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Chunks queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<AudioChunk>,
    sink: Arc<dyn AudioSink>,
    state: Arc<AudioSessionState>,
    pending: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
    config: AudioConfig,
) {
    while let Some(chunk) = rx.recv().await {
        pending.fetch_sub(1, Ordering::AcqRel);

        // Deafen may have been switched on while the chunk sat in the queue.
        if state.is_deafened() {
            trace!(from = %chunk.member_id, "deafened, dropping queued chunk");
            continue;
        }

        playing.store(true, Ordering::Release);
        let from = chunk.member_id.clone();
        match play_one(sink.as_ref(), chunk, &config).await {
            Ok(()) => {}
            Err(Skip::Undersized(len)) => trace!(%from, len, "skipping undersized chunk"),
            Err(Skip::TooShort(duration)) => trace!(%from, ?duration, "skipping near-empty chunk"),
            Err(Skip::Failed(err)) => debug!(%from, error = %err, "skipping chunk"),
        }
        playing.store(false, Ordering::Release);
    }
}

enum Skip {
    Undersized(usize),
    TooShort(Duration),
    Failed(AudioError),
}

async fn play_one(sink: &dyn AudioSink, chunk: AudioChunk, config: &AudioConfig) -> Result<(), Skip> {
    if chunk.payload.len() < config.min_payload_bytes {
        return Err(Skip::Undersized(chunk.payload.len()));
    }

    let decoded = match timeout(config.decode_timeout, sink.decode(&chunk.payload)).await {
        Ok(Ok(decoded)) => decoded,
        Ok(Err(err)) => return Err(Skip::Failed(err)),
        Err(_) => return Err(Skip::Failed(AudioError::DecodeTimeout(config.decode_timeout))),
    };
    if decoded.duration < config.min_decoded_duration {
        return Err(Skip::TooShort(decoded.duration));
    }

    trace!(
        from = %chunk.member_id,
        username = %chunk.username,
        timestamp = chunk.timestamp,
        duration = ?decoded.duration,
        "playing"
    );
    let limit = decoded.duration + config.play_slack;
    match timeout(limit, sink.play(decoded)).await {
        Ok(result) => result.map_err(Skip::Failed),
        Err(_) => Err(Skip::Failed(AudioError::Playback(format!(
            "output stalled for {limit:?}"
        )))),
    }
}
