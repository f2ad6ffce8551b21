use std::sync::Arc;

use crate::db::DbPool;
use crate::storage::AttachmentStore;
use crate::ws::presence::PresenceTracker;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::router::EventRouter;

/// Shared application state passed to all handlers via axum State extractor.
///
/// The registry, presence tracker, and router are owned here and injected
/// everywhere — constructed once at process start, never ambient globals,
/// so tests get fresh instances per server.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// User → live WebSocket connection map
    pub registry: Arc<ConnectionRegistry>,
    /// Users currently viewing an active chat
    pub presence: Arc<PresenceTracker>,
    /// Fan-out of server events over the registry
    pub router: EventRouter,
    /// Attachment object store
    pub storage: Arc<AttachmentStore>,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
}

impl AppState {
    /// Wire up the in-memory services around a database pool and store.
    pub fn new(db: DbPool, storage: AttachmentStore, jwt_secret: Vec<u8>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = EventRouter::new(registry.clone());
        Self {
            db,
            registry,
            presence: Arc::new(PresenceTracker::new()),
            router,
            storage: Arc::new(storage),
            jwt_secret,
        }
    }
}
