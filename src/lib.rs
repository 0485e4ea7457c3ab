// SPDX-License-Identifier: MIT

pub mod broadcast;
pub mod catalogue;
pub mod config;
pub mod engine;
pub mod http;
pub mod modes;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;
pub mod usem;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use broadcast::FrameBroadcaster;
use catalogue::Catalogue;
use config::ServerConfig;
use modes::ModeController;
use registry::SessionRegistry;
use storage::Storage;

/// Shared application state passed to every handler and background task.
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub storage: Arc<Storage>,
    pub catalogue: Arc<Catalogue>,
    pub registry: Arc<SessionRegistry>,
    pub modes: Arc<ModeController>,
    pub broadcaster: Arc<FrameBroadcaster>,
    /// Live (session × course) signal population; feeds notifier pacing.
    pub usem_count: AtomicU64,
    pub started_at: std::time::Instant,
}
