use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Mute, deafen, recording and level flags shared by the connection layer,
/// the capture loop and the playback worker. There is exactly one of these
/// per client; everyone holds it through an `Arc`.
#[derive(Debug, Default)]
pub struct AudioSessionState {
    recording: AtomicBool,
    muted: AtomicBool,
    deafened: AtomicBool,
    input_level: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioState {
    pub is_recording: bool,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub input_level: u8,
}

impl AudioSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AudioState {
        AudioState {
            is_recording: self.is_recording(),
            is_muted: self.is_muted(),
            is_deafened: self.is_deafened(),
            input_level: self.input_level(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Flips the mute flag and returns the new value.
    pub fn toggle_muted(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Acquire)
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Release);
    }

    /// Flips the deafen flag and returns the new value.
    pub fn toggle_deafened(&self) -> bool {
        !self.deafened.fetch_xor(true, Ordering::AcqRel)
    }

    /// Current input level, 0 to 100.
    pub fn input_level(&self) -> u8 {
        self.input_level.load(Ordering::Relaxed)
    }

    pub fn set_input_level(&self, level: u8) {
        self.input_level.store(level.min(100), Ordering::Relaxed);
    }
}
