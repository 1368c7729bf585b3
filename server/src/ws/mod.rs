pub mod actor;
pub mod handler;
pub mod protocol;
pub mod registry;

use std::sync::Arc;

pub use registry::{ConnectionHandle, ConnectionRegistry, PeerLookup};

/// Create a new empty connection registry.
pub fn new_connection_registry() -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new())
}
