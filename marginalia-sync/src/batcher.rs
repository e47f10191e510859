//! Debounced coalescing of local changes before broadcast.
//!
//! ```text
//!            push (quiet ≥ window)             fire (now ≥ deadline)
//!   ┌──────┐ ───────────────► Flush   ┌─────────┐ ───────────────► Flush
//!   │ Idle │                          │ Pending │
//!   └──────┘ ─────────────────────────►└─────────┘ ◄─── push (merge)
//!            push (within window of last flush)
//! ```
//!
//! A change arriving after a quiet period goes out immediately. Changes
//! arriving within `window` of the last flush are merged and released together
//! at `last_flush + window`, so at most one flush happens per window.
//!
//! The batcher is pure state. The session's outbound task owns the timer and
//! calls [`ChangeBatcher::fire`] when [`ChangeBatcher::deadline`] passes.

use std::time::Duration;

use marginalia_core::{merge_changes, ChangeSet};
use tokio::time::Instant;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Pending { deadline: Instant },
}

/// Result of feeding one change into the batcher.
#[derive(Debug)]
pub enum Admission {
    /// Send this merged set now.
    Flush(ChangeSet),
    /// Buffered; a flush is due at `deadline`.
    Deferred { deadline: Instant },
    /// Everything cancelled out; nothing to send.
    Dropped,
}

#[derive(Debug)]
pub struct ChangeBatcher {
    window: Duration,
    buffered: Option<ChangeSet>,
    last_flush: Option<Instant>,
    state: BatchState,
    flushes: u64,
}

impl Default for ChangeBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl ChangeBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buffered: None,
            last_flush: None,
            state: BatchState::Idle,
            flushes: 0,
        }
    }

    pub fn push(&mut self, changes: ChangeSet, now: Instant) -> Admission {
        let merged = match self.buffered.take() {
            Some(buffered) => merge_changes(buffered, changes),
            None => changes,
        };

        match self.last_flush {
            Some(last) if now.saturating_duration_since(last) < self.window => {
                let deadline = last + self.window;
                self.buffered = Some(merged);
                self.state = BatchState::Pending { deadline };
                Admission::Deferred { deadline }
            }
            _ => match self.flush(merged, now) {
                Some(changes) => Admission::Flush(changes),
                None => Admission::Dropped,
            },
        }
    }

    /// Releases the pending buffer once its deadline has passed.
    pub fn fire(&mut self, now: Instant) -> Option<ChangeSet> {
        match self.state {
            BatchState::Pending { deadline } if now >= deadline => {
                let buffered = self.buffered.take().unwrap_or_default();
                self.flush(buffered, now)
            }
            _ => None,
        }
    }

    /// Drops any pending buffer. Returns what was discarded.
    pub fn cancel(&mut self) -> Option<ChangeSet> {
        self.state = BatchState::Idle;
        self.buffered.take()
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            BatchState::Pending { deadline } => Some(deadline),
            BatchState::Idle => None,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of non-empty sets released so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn flush(&mut self, merged: ChangeSet, now: Instant) -> Option<ChangeSet> {
        self.state = BatchState::Idle;
        self.last_flush = Some(now);
        if merged.is_empty() {
            return None;
        }
        self.flushes += 1;
        Some(merged)
    }
}
