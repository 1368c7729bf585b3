use std::sync::Arc;

use crate::chat::store::SqliteStore;
use crate::chat::RealtimeSettings;
use crate::ws::registry::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Message and membership storage (SQLite)
    pub store: Arc<SqliteStore>,
    /// JWT verification secret shared with the identity service
    pub jwt_secret: Vec<u8>,
    /// Live connection per user
    pub connections: Arc<ConnectionRegistry>,
    pub realtime: Arc<RealtimeSettings>,
}
