//! Push-To-Talk Controller
//!
//! Gates the local track's `enabled` bit on a single held key. Holds no
//! network state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::audio::LocalAudioTrack;

/// Key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Down,
    Up,
}

/// What had input focus when the key event fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Focus {
    #[default]
    None,
    TextInput,
    TextArea,
}

impl Focus {
    /// Typing into a text field must not toggle voice.
    pub const fn is_text_entry(self) -> bool {
        matches!(self, Self::TextInput | Self::TextArea)
    }
}

/// A global key event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub phase: KeyPhase,
    pub focus: Focus,
}

impl KeyEvent {
    pub fn down(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            phase: KeyPhase::Down,
            focus: Focus::None,
        }
    }

    pub fn up(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            phase: KeyPhase::Up,
            focus: Focus::None,
        }
    }

    #[must_use]
    pub const fn with_focus(mut self, focus: Focus) -> Self {
        self.focus = focus;
        self
    }
}

/// Push-to-talk state machine.
///
/// Key-down arms a debounce deadline; the track is enabled only if the
/// deadline passes with no key-up in between. Key-up disables immediately.
pub struct PushToTalk {
    key: String,
    debounce: Duration,
    track: Option<Arc<LocalAudioTrack>>,
    active: bool,
    pending: Option<Instant>,
}

impl PushToTalk {
    pub fn new(key: impl Into<String>, debounce: Duration) -> Self {
        Self {
            key: key.into(),
            debounce,
            track: None,
            active: false,
            pending: None,
        }
    }

    /// Swap the gated track. `None` makes the controller inert.
    pub fn set_track(&mut self, track: Option<Arc<LocalAudioTrack>>) {
        let same = match (&self.track, &track) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }

        self.release();
        self.track = track;
    }

    pub fn handle_key(&mut self, event: &KeyEvent, now: Instant) {
        if event.focus.is_text_entry()
            || !event.key.eq_ignore_ascii_case(&self.key)
            || self.track.is_none()
        {
            return;
        }

        match event.phase {
            KeyPhase::Down => {
                // Auto-repeat sends more key-downs while held
                if !self.active && self.pending.is_none() {
                    self.pending = Some(now + self.debounce);
                }
            }
            KeyPhase::Up => self.release(),
        }
    }

    /// When the pending activation is due, if any.
    pub const fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Complete a pending activation whose deadline has passed.
    pub fn fire(&mut self, now: Instant) {
        let Some(deadline) = self.pending else {
            return;
        };
        if now < deadline {
            return;
        }

        self.pending = None;
        if let Some(track) = &self.track {
            self.active = true;
            track.set_enabled(true);
            debug!("Push-to-talk engaged");
        }
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    fn release(&mut self) {
        self.pending = None;
        if let Some(track) = &self.track {
            track.set_enabled(false);
        }
        if std::mem::take(&mut self.active) {
            debug!("Push-to-talk released");
        }
    }

    /// Clear pending timers and mute the track.
    pub fn teardown(&mut self) {
        self.release();
        self.track = None;
    }
}

/// Drive `ptt` from key events, following the current capture track.
///
/// Returns once the key source or the track source closes.
pub async fn run(
    mut ptt: PushToTalk,
    mut keys: mpsc::Receiver<KeyEvent>,
    mut tracks: watch::Receiver<Option<Arc<LocalAudioTrack>>>,
) {
    let current = tracks.borrow_and_update().clone();
    ptt.set_track(current);

    loop {
        let deadline = ptt.deadline();

        tokio::select! {
            key = keys.recv() => match key {
                Some(event) => ptt.handle_key(&event, Instant::now()),
                None => break,
            },
            changed = tracks.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = tracks.borrow_and_update().clone();
                ptt.set_track(current);
            }
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                ptt.fire(Instant::now());
            }
        }
    }

    ptt.teardown();
    debug!("Push-to-talk stopped");
}
