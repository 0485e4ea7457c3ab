// SPDX-License-Identifier: MIT
//! The global mode switch: closed / frozen / open.
//!
//! Closed permits admin maintenance; frozen lets students see their current
//! holdings but not change them; open is normal operation. The value is
//! durable (the `misc('state')` row) and mirrored in a process-wide atomic
//! so every handler can gate without touching the database.

use crate::broadcast::FrameBroadcaster;
use crate::protocol;
use crate::registry::SessionRegistry;
use crate::storage::Storage;
use anyhow::{Context as _, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Closed = 0,
    Frozen = 1,
    Open = 2,
}

impl Mode {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Mode::Closed),
            1 => Some(Mode::Frozen),
            2 => Some(Mode::Open),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Closed => write!(f, "closed"),
            Mode::Frozen => write!(f, "frozen"),
            Mode::Open => write!(f, "open"),
        }
    }
}

pub struct ModeController {
    storage: Arc<Storage>,
    broadcaster: Arc<FrameBroadcaster>,
    mode: AtomicU8,
}

impl ModeController {
    /// Read the durable mode; missing row defaults to closed. An
    /// out-of-range stored value also falls back to closed rather than
    /// opening selections by accident.
    pub async fn load(storage: Arc<Storage>, broadcaster: Arc<FrameBroadcaster>) -> Result<Self> {
        let stored = storage.load_mode().await.context("load mode")?;
        let mode = match stored {
            None => Mode::Closed,
            Some(v) => Mode::from_i64(v).unwrap_or_else(|| {
                warn!(value = v, "invalid stored mode — defaulting to closed");
                Mode::Closed
            }),
        };
        info!(mode = %mode, "mode loaded");
        Ok(Self {
            storage,
            broadcaster,
            mode: AtomicU8::new(mode as u8),
        })
    }

    pub fn current(&self) -> Mode {
        // Only ever stored from a valid Mode.
        Mode::from_i64(self.mode.load(Ordering::Acquire) as i64).unwrap_or(Mode::Closed)
    }

    /// Transition to `new`: persist, then mirror, then apply the side
    /// effect. On persistence failure the in-memory mode does not advance.
    pub async fn set(&self, registry: &SessionRegistry, new: Mode) -> Result<()> {
        self.storage
            .store_mode(new as i64)
            .await
            .context("persist mode")?;
        let old = self.mode.swap(new as u8, Ordering::AcqRel);
        info!(from = old, to = %new, "mode changed");

        match new {
            Mode::Closed => registry.cancel_all(),
            Mode::Frozen => self.broadcaster.broadcast(protocol::stop()),
            Mode::Open => self.broadcaster.broadcast(protocol::start()),
        }
        Ok(())
    }
}
