pub mod admission;
pub mod fanout;
pub mod groups;
pub mod messages;
pub mod message;
pub mod store;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use crate::chat::time::DisplayClock;

/// Tunables for the realtime path, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    /// Capacity of each connection's outbound buffer.
    pub outbound_buffer: usize,
    /// How long fanout waits for room in a full outbound buffer.
    pub delivery_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_content_length: usize,
    pub clock: DisplayClock,
}
