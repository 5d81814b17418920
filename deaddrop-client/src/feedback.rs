use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arboard::Clipboard;
use deaddrop_core::{FEEDBACK_DELAY, FeedbackKind};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
}

pub trait ClipboardWriter: Send + Sync + 'static {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardWriter for SystemClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard =
            Clipboard::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
        clipboard
            .set_text(text)
            .map_err(|err| ClipboardError::Write(err.to_string()))
    }
}

/// Which "Copied!" acknowledgements are showing.
///
/// Each visible slot holds the token of the copy that raised it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackState {
    copy_id: Option<u64>,
    copy_link: Option<u64>,
}

impl FeedbackState {
    pub fn is_visible(&self, kind: FeedbackKind) -> bool {
        self.slot(kind).is_some()
    }

    fn slot(&self, kind: FeedbackKind) -> Option<u64> {
        match kind {
            FeedbackKind::CopyId => self.copy_id,
            FeedbackKind::CopyLink => self.copy_link,
        }
    }

    fn slot_mut(&mut self, kind: FeedbackKind) -> &mut Option<u64> {
        match kind {
            FeedbackKind::CopyId => &mut self.copy_id,
            FeedbackKind::CopyLink => &mut self.copy_link,
        }
    }
}

/// Copies text and raises a short-lived acknowledgement per [`FeedbackKind`].
///
/// Must be used from within a Tokio runtime; each acknowledgement is reverted
/// by a spawned delayed task.
pub struct FeedbackSequencer<C> {
    clipboard: C,
    state: Arc<watch::Sender<FeedbackState>>,
    reverts: Mutex<HashMap<FeedbackKind, JoinHandle<()>>>,
    tokens: AtomicU64,
    delay: Duration,
}

impl<C: ClipboardWriter> FeedbackSequencer<C> {
    pub fn new(clipboard: C) -> Self {
        Self::with_delay(clipboard, FEEDBACK_DELAY)
    }

    pub fn with_delay(clipboard: C, delay: Duration) -> Self {
        let (state, _) = watch::channel(FeedbackState::default());
        Self {
            clipboard,
            state: Arc::new(state),
            reverts: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(0),
            delay,
        }
    }

    pub fn snapshot(&self) -> FeedbackState {
        *self.state.borrow()
    }

    pub fn is_visible(&self, kind: FeedbackKind) -> bool {
        self.snapshot().is_visible(kind)
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedbackState> {
        self.state.subscribe()
    }

    /// Writes `text` to the clipboard and shows the acknowledgement for `kind`.
    ///
    /// A repeated copy of the same kind restarts the delay. Nothing is shown when
    /// the clipboard write fails.
    pub fn copy(&self, kind: FeedbackKind, text: &str) -> Result<(), ClipboardError> {
        if let Err(err) = self.clipboard.write_text(text) {
            warn!(?kind, "copy failed: {}", err);
            return Err(err);
        }

        let token = self.tokens.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.send_modify(|state| *state.slot_mut(kind) = Some(token));
        debug!(?kind, token, "feedback shown");

        let state = Arc::clone(&self.state);
        let delay = self.delay;
        let revert = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.send_if_modified(|current| {
                let slot = current.slot_mut(kind);
                if *slot != Some(token) {
                    return false;
                }
                *slot = None;
                true
            });
        });

        let previous = self
            .reverts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, revert);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    pub async fn wait_until_hidden(&self, kind: FeedbackKind) {
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|state| !state.is_visible(kind)).await;
    }
}

impl<C> Drop for FeedbackSequencer<C> {
    fn drop(&mut self) {
        let reverts = self
            .reverts
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, revert) in reverts.drain() {
            revert.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeClipboard {
        writes: Mutex<Vec<String>>,
        broken: bool,
    }

    impl ClipboardWriter for Arc<FakeClipboard> {
        fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
            if self.broken {
                return Err(ClipboardError::Unavailable("no display".to_owned()));
            }
            self.writes.lock().unwrap().push(text.to_owned());
            Ok(())
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test(start_paused = true)]
    async fn copy_shows_then_reverts_after_delay() {
        let clipboard = Arc::new(FakeClipboard::default());
        let sequencer = FeedbackSequencer::new(Arc::clone(&clipboard));

        sequencer.copy(FeedbackKind::CopyId, "abc123").unwrap();
        assert!(sequencer.is_visible(FeedbackKind::CopyId));
        assert_eq!(clipboard.writes.lock().unwrap().as_slice(), ["abc123"]);

        tokio::time::sleep(ms(999)).await;
        assert!(sequencer.is_visible(FeedbackKind::CopyId));

        tokio::time::sleep(ms(2)).await;
        assert!(!sequencer.is_visible(FeedbackKind::CopyId));
    }

    #[tokio::test(start_paused = true)]
    async fn kinds_revert_independently() {
        let sequencer = FeedbackSequencer::new(Arc::new(FakeClipboard::default()));

        sequencer.copy(FeedbackKind::CopyId, "abc123").unwrap();
        tokio::time::sleep(ms(500)).await;
        sequencer
            .copy(FeedbackKind::CopyLink, "https://drop.example.com/deaddrop/abc123.txt")
            .unwrap();
        assert!(sequencer.is_visible(FeedbackKind::CopyId));
        assert!(sequencer.is_visible(FeedbackKind::CopyLink));

        tokio::time::sleep(ms(600)).await;
        assert!(!sequencer.is_visible(FeedbackKind::CopyId));
        assert!(sequencer.is_visible(FeedbackKind::CopyLink));

        tokio::time::sleep(ms(500)).await;
        assert!(!sequencer.is_visible(FeedbackKind::CopyLink));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_copy_restarts_the_window() {
        let sequencer = FeedbackSequencer::new(Arc::new(FakeClipboard::default()));

        sequencer.copy(FeedbackKind::CopyId, "abc123").unwrap();
        tokio::time::sleep(ms(700)).await;
        sequencer.copy(FeedbackKind::CopyId, "abc123").unwrap();

        tokio::time::sleep(ms(700)).await;
        assert!(sequencer.is_visible(FeedbackKind::CopyId));

        tokio::time::sleep(ms(400)).await;
        assert!(!sequencer.is_visible(FeedbackKind::CopyId));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_clipboard_write_shows_nothing() {
        let clipboard = Arc::new(FakeClipboard {
            broken: true,
            ..FakeClipboard::default()
        });
        let sequencer = FeedbackSequencer::new(clipboard);

        let err = sequencer.copy(FeedbackKind::CopyLink, "link").unwrap_err();
        assert!(err.to_string().contains("no display"));
        assert!(!sequencer.is_visible(FeedbackKind::CopyLink));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_hidden_follows_the_delay() {
        let sequencer = FeedbackSequencer::new(Arc::new(FakeClipboard::default()));
        let started = tokio::time::Instant::now();

        sequencer.copy(FeedbackKind::CopyId, "abc123").unwrap();
        sequencer.wait_until_hidden(FeedbackKind::CopyId).await;

        assert!(started.elapsed() >= FEEDBACK_DELAY);
        assert_eq!(sequencer.snapshot(), FeedbackState::default());
    }
}
