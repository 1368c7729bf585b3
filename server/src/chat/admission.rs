//! Message admission: validate, stamp, persist, then fan out.
//!
//! Both the WebSocket session and the REST submit endpoint go through
//! `admit`. A message that fails validation or persistence is never fanned
//! out.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::chat::fanout::{self, FanoutReport};
use crate::chat::message::{Addressing, InboundPayload, Message, NewMessage, UserId};
use crate::chat::store::MessageStore;
use crate::chat::RealtimeSettings;
use crate::error::{AdmissionError, StoreError, ValidationError};
use crate::ws::protocol;
use crate::ws::registry::PeerLookup;

/// Check a payload and stamp it with the authenticated sender and `now`.
/// Whitespace-only content is empty; otherwise the content is kept as sent.
pub fn validate(
    payload: InboundPayload,
    sender_id: UserId,
    max_content_length: usize,
    now: DateTime<Utc>,
) -> Result<NewMessage, ValidationError> {
    if payload.content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    if payload.content.chars().count() > max_content_length {
        return Err(ValidationError::ContentTooLong {
            max: max_content_length,
        });
    }

    let addressing = Addressing::from_parts(payload.receiver_id, payload.group_id)
        .ok_or(ValidationError::MalformedAddressing)?;

    Ok(NewMessage {
        content: payload.content,
        sender_id,
        addressing,
        created_at: now,
    })
}

/// Admit one inbound payload from `sender_id`.
///
/// The append and the membership read run on the blocking pool; the
/// registry is only consulted afterwards, so persistence never holds it.
pub async fn admit<S, L>(
    store: &Arc<S>,
    peers: &L,
    settings: &RealtimeSettings,
    sender_id: UserId,
    payload: InboundPayload,
) -> Result<(Message, FanoutReport), AdmissionError>
where
    S: MessageStore + ?Sized,
    L: PeerLookup + ?Sized,
{
    let draft = validate(payload, sender_id, settings.max_content_length, Utc::now())?;

    let store = Arc::clone(store);
    let (message, recipients) = tokio::task::spawn_blocking(move || {
        let message = store.append(draft)?;
        let recipients = fanout::resolve_recipients(store.as_ref(), &message);
        Ok::<_, StoreError>((message, recipients))
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))??;

    let frame = match protocol::delivery_frame(&message, &settings.clock) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(message_id = message.id, error = %e, "Failed to encode delivery");
            return Ok((message, FanoutReport::default()));
        }
    };

    let report = fanout::deliver(peers, &recipients, frame, settings.delivery_timeout).await;
    tracing::debug!(
        message_id = message.id,
        sender_id,
        recipients = report.recipients,
        queued = report.queued,
        offline = report.offline,
        dropped = report.dropped,
        "Message fanned out"
    );

    Ok((message, report))
}
