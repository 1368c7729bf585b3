//! Recipient resolution and best-effort delivery.

use axum::extract::ws::Message as Frame;
use futures_util::future::join_all;
use std::time::Duration;

use crate::chat::message::{Addressing, Message, UserId};
use crate::chat::store::MessageStore;
use crate::ws::registry::{Delivery, PeerLookup};

/// Counts for one message's fanout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub recipients: usize,
    pub queued: usize,
    /// Recipients with no registered connection.
    pub offline: usize,
    /// Reachable recipients whose buffer was full or whose writer was gone.
    pub dropped: usize,
}

/// Who should receive `message`, excluding its sender.
///
/// Group membership is read from the store on every call. Blocks on the
/// store, so async callers run this inside `spawn_blocking`.
pub fn resolve_recipients<S>(store: &S, message: &Message) -> Vec<UserId>
where
    S: MessageStore + ?Sized,
{
    let mut recipients: Vec<UserId> = match message.addressing {
        Addressing::Direct(receiver_id) => vec![receiver_id],
        Addressing::Group(group_id) => store.list_group_members(group_id).into_iter().collect(),
    };
    recipients.retain(|user_id| *user_id != message.sender_id);
    recipients.sort_unstable();
    recipients
}

/// Push `frame` to every reachable recipient.
///
/// Handles are looked up before any waiting, so the registry is never held
/// across an await. Deliveries run concurrently; the total wait is bounded
/// by `wait` no matter how many recipients are saturated.
pub async fn deliver<L>(peers: &L, recipients: &[UserId], frame: Frame, wait: Duration) -> FanoutReport
where
    L: PeerLookup + ?Sized,
{
    let mut report = FanoutReport {
        recipients: recipients.len(),
        ..FanoutReport::default()
    };

    let mut pending = Vec::with_capacity(recipients.len());
    for &user_id in recipients {
        match peers.lookup(user_id) {
            Some(handle) => {
                let frame = frame.clone();
                pending.push(async move { (user_id, handle.deliver(frame, wait).await) });
            }
            None => report.offline += 1,
        }
    }

    for (user_id, outcome) in join_all(pending).await {
        match outcome {
            Delivery::Queued => report.queued += 1,
            Delivery::Dropped | Delivery::Closed => {
                tracing::debug!(user_id, outcome = ?outcome, "Delivery dropped");
                report.dropped += 1;
            }
        }
    }

    report
}
