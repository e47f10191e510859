//! Privacy mode switch.
//!
//! The broadcast path and the durable writer each hold their own mirror of
//! the flag so neither has to reach into the session on the hot path. The
//! mediator is the only writer and checks on every read that both mirrors
//! agree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::session::SyncError;

/// One component's copy of the privacy flag.
#[derive(Debug, Clone, Default)]
pub struct PrivacyMirror(Arc<AtomicBool>);

impl PrivacyMirror {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, private: bool) {
        self.0.store(private, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct PrivacyMediator {
    broadcast: PrivacyMirror,
    durable: PrivacyMirror,
}

impl PrivacyMediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, private: bool) {
        self.broadcast.set(private);
        self.durable.set(private);
        log::info!("privacy mode {}", if private { "on" } else { "off" });
    }

    /// Current mode. Fails if the mirrors have diverged.
    pub fn get(&self) -> Result<bool, SyncError> {
        let broadcast = self.broadcast.get();
        let durable = self.durable.get();
        if broadcast != durable {
            log::error!("privacy mirrors diverged: broadcast={broadcast} durable={durable}");
            return Err(SyncError::PrivacyDiverged { broadcast, durable });
        }
        Ok(broadcast)
    }

    pub fn broadcast_mirror(&self) -> PrivacyMirror {
        self.broadcast.clone()
    }

    pub fn durable_mirror(&self) -> PrivacyMirror {
        self.durable.clone()
    }
}
