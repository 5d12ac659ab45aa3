//! Client-side reconciliation between a text widget and the relay.
//!
//! Two independent pieces of state decide what reaches the network:
//!
//! ```text
//!  remote update ──► EditorBuffer::apply_remote ──► pending_remote = true
//!                                                      │
//!  widget change ──► EditorBuffer::local_change ───────┤
//!                       pending_remote? ── yes ──► swallow, reset flag
//!                              │
//!                              no
//!                              ▼
//!                    Debouncer::schedule ──► (200 ms idle) ──► code-change
//! ```
//!
//! Echo suppression assumes the widget reports the programmatic update as a
//! change before any keystroke does. If the widget stays silent, the next real
//! edit is the one swallowed.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Buffer content before any snapshot or draft arrives.
pub const DEFAULT_CODE: &str = "// write your code here";

/// Idle time after the last local edit before it is broadcast.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Outcome of a change notification from the widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChange {
    /// The change echoed a remote update; nothing is sent.
    Suppressed,
    /// A genuine local edit that should be broadcast.
    Broadcast,
}

/// Local text plus the flag that marks the next change as network-originated.
#[derive(Debug, Clone)]
pub struct EditorBuffer {
    content: String,
    pending_remote: bool,
}

impl Default for EditorBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CODE)
    }
}

impl EditorBuffer {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            content: initial.into(),
            pending_remote: false,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn pending_remote(&self) -> bool {
        self.pending_remote
    }

    /// Replace the content without marking it remote or broadcasting it,
    /// e.g. when a saved draft is loaded.
    pub fn seed(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    /// Apply content received from the relay.
    ///
    /// Returns `false` and leaves the flag alone if the content is already
    /// what the buffer holds, which also covers an echo of our own edit.
    pub fn apply_remote(&mut self, incoming: &str) -> bool {
        if incoming == self.content {
            return false;
        }
        self.pending_remote = true;
        self.content = incoming.to_owned();
        true
    }

    /// Forget a remote update the widget was never told about, so its next
    /// change notification counts as a real edit.
    pub fn clear_pending_remote(&mut self) {
        self.pending_remote = false;
    }

    /// Record a change notification from the widget.
    pub fn local_change(&mut self, content: impl Into<String>) -> LocalChange {
        self.content = content.into();
        if self.pending_remote {
            self.pending_remote = false;
            LocalChange::Suppressed
        } else {
            LocalChange::Broadcast
        }
    }
}

/// Owned, replaceable timer handle.
///
/// Scheduling aborts whatever was pending, so only the last action inside a
/// window ever runs. Dropping the debouncer cancels the pending action.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancel any pending action and run `action` after the delay.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&mut self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    /// Abort the pending action. Returns `true` if one was still waiting.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
