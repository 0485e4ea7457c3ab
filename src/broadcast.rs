// SPDX-License-Identifier: MIT

use crate::protocol::Message;
use tokio::sync::broadcast;

/// Broadcasts protocol frames (`START` / `STOP`) to every live session.
///
/// Each session's select loop holds a receiver and forwards frames onto its
/// own socket. Lagged receivers drop old frames rather than blocking the
/// sender; for mode transitions only the latest frame matters anyway.
#[derive(Clone)]
pub struct FrameBroadcaster {
    tx: broadcast::Sender<Message>,
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Send a frame to all connected sessions. No subscribers is fine.
    pub fn broadcast(&self, frame: Message) {
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}
