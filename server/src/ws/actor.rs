use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, timeout_at, Instant};

use crate::auth::middleware::remember_identity;
use crate::chat::admission;
use crate::chat::message::UserId;
use crate::state::AppState;
use crate::ws::protocol::{
    self, CLOSE_GOING_AWAY, CLOSE_INVALID_PAYLOAD, CLOSE_SUPERSEDED, CLOSE_UNSUPPORTED_DATA,
};
use crate::ws::registry::{CloseRequest, ConnectionHandle, Delivery};

/// How long a finished session waits for its writer to flush queued frames,
/// and how long the writer waits to get a close frame out.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const PING_PAYLOAD: [u8; 4] = [1, 2, 3, 4];

type StopSignal = watch::Receiver<Option<CloseRequest>>;

/// Why a session's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    StreamEnded,
    ReceiveError,
    DecodeFailure,
    ProtocolViolation,
    /// Told to close: superseded or heartbeat failure.
    Stopped,
    /// Writer finished first: the sink failed.
    TransportClosed,
}

/// Run one authenticated connection from registration to deregistration.
///
/// The socket is split into:
/// - a writer task that owns the sink and drains the bounded outbound buffer
/// - a heartbeat task that pings and closes on missing pongs
/// - this task's receive loop, which admits inbound payloads one at a time
///   so a connection's messages are admitted in the order received
///
/// Any of them can end the session through the handle's stop signal.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let settings = state.realtime.clone();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(settings.outbound_buffer);
    let handle = ConnectionHandle::new(tx);
    let writer_stop = handle.stop_signal();
    let mut stop = handle.stop_signal();

    remember_identity(&state.store, user_id).await;

    if let Some(previous) = state.connections.register(user_id, handle.clone()) {
        tracing::info!(user_id, "Superseding previous connection");
        previous.close(CLOSE_SUPERSEDED, "Superseded by a newer connection");
    }

    tracing::info!(user_id, "WebSocket session started");

    let mut writer = tokio::spawn(writer_task(ws_sender, rx, writer_stop));

    let (pong_tx, pong_rx) = watch::channel(Instant::now());
    let heartbeat = tokio::spawn(heartbeat_task(
        handle.clone(),
        pong_rx,
        settings.ping_interval,
        settings.pong_timeout,
        user_id,
    ));

    let mut writer_finished = false;
    let end = loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            request = wait_for_stop(&mut stop) => {
                tracing::info!(user_id, code = request.code, reason = request.reason, "Closing connection");
                break SessionEnd::Stopped;
            }
            _ = &mut writer => {
                writer_finished = true;
                break SessionEnd::TransportClosed;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                let payload = match protocol::decode_inbound(text.as_str()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "Undecodable inbound payload");
                        handle.close(CLOSE_INVALID_PAYLOAD, "Malformed payload");
                        break SessionEnd::DecodeFailure;
                    }
                };

                match admission::admit(
                    &state.store,
                    state.connections.as_ref(),
                    &settings,
                    user_id,
                    payload,
                )
                .await
                {
                    Ok((message, _report)) => {
                        tracing::debug!(user_id, message_id = message.id, "Message admitted");
                    }
                    Err(err) => {
                        if err.is_validation() {
                            tracing::debug!(user_id, error = %err, "Message rejected");
                        } else {
                            tracing::warn!(user_id, error = %err, "Message not recorded");
                        }
                        if let Ok(frame) = protocol::error_frame(&err) {
                            handle.deliver(frame, settings.delivery_timeout).await;
                        }
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::debug!(user_id, "Received binary frame, expected JSON text");
                handle.close(CLOSE_UNSUPPORTED_DATA, "Binary frames are not supported");
                break SessionEnd::ProtocolViolation;
            }
            Some(Ok(Message::Pong(_))) => {
                pong_tx.send_replace(Instant::now());
            }
            // The transport answers pings itself
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(user_id, reason = ?frame, "Client initiated close");
                break SessionEnd::ClientClosed;
            }
            Some(Err(e)) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break SessionEnd::ReceiveError;
            }
            None => break SessionEnd::StreamEnded,
        }
    };

    heartbeat.abort();

    // Only removes the entry if a newer session has not replaced it.
    state.connections.deregister(user_id, &handle);
    drop(handle);

    // With every sender gone the writer flushes what is queued and exits.
    if !writer_finished && timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::info!(user_id, reason = ?end, "WebSocket session stopped");
}

/// Resolves with the first close request. Never resolves once every handle
/// is gone without one.
async fn wait_for_stop(stop: &mut StopSignal) -> CloseRequest {
    let request = match stop.wait_for(Option::is_some).await {
        Ok(request) => *request,
        Err(_) => None,
    };
    match request {
        Some(request) => request,
        None => std::future::pending().await,
    }
}

/// Forwards queued frames to the WebSocket sink until the buffer closes or
/// the sink fails. A stop request preempts any pending send, then the close
/// frame gets a bounded attempt of its own.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    mut stop: StopSignal,
) {
    let request = {
        let forward = async {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            biased;
            _ = forward => None,
            request = wait_for_stop(&mut stop) => Some(request),
        }
    };

    if let Some(request) = request {
        let frame = Message::Close(Some(CloseFrame {
            code: request.code,
            reason: request.reason.into(),
        }));
        let _ = timeout(WRITER_DRAIN_TIMEOUT, ws_sender.send(frame)).await;
    }
}

/// Pings every `ping_interval` and closes with 1001 when the pong does not
/// arrive within `pong_timeout`, or when the ping cannot enter the buffer
/// within `pong_timeout`.
///
/// `pongs` carries the arrival time of the latest pong, so only a pong
/// received after the current ping counts.
async fn heartbeat_task(
    handle: ConnectionHandle,
    mut pongs: watch::Receiver<Instant>,
    ping_interval: Duration,
    pong_timeout: Duration,
    user_id: UserId,
) {
    let mut ping_timer = interval(ping_interval);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        match handle
            .deliver(Message::Ping(PING_PAYLOAD.to_vec().into()), pong_timeout)
            .await
        {
            Delivery::Queued => {}
            Delivery::Dropped => {
                tracing::warn!(user_id, "Outbound buffer not draining, closing connection");
                handle.close(CLOSE_GOING_AWAY, "Connection not draining");
                break;
            }
            Delivery::Closed => break,
        }

        let sent_at = Instant::now();
        let answered = timeout_at(sent_at + pong_timeout, async {
            pongs.wait_for(|last| *last >= sent_at).await.is_ok()
        })
        .await;

        match answered {
            Ok(true) => {}
            // Session is gone
            Ok(false) => break,
            Err(_) => {
                tracing::warn!(user_id, "Pong timeout, closing connection");
                handle.close(CLOSE_GOING_AWAY, "Pong timeout");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    fn connection(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(tx), rx)
    }

    async fn close_request_within(handle: &ConnectionHandle, within: Duration) -> Option<CloseRequest> {
        let mut stop = handle.stop_signal();
        timeout(within, wait_for_stop(&mut stop)).await.ok()
    }

    #[tokio::test]
    async fn unanswered_ping_closes_going_away() {
        let (handle, mut rx) = connection(4);
        let (_pong_tx, pong_rx) = watch::channel(Instant::now());
        let heartbeat = tokio::spawn(heartbeat_task(handle.clone(), pong_rx, TICK, TICK, 1));

        let request = close_request_within(&handle, Duration::from_secs(2))
            .await
            .expect("heartbeat never closed the connection");
        assert_eq!(request.code, CLOSE_GOING_AWAY);
        assert_eq!(request.reason, "Pong timeout");
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
        heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn answered_pings_keep_connection_open() {
        let (handle, mut rx) = connection(4);
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let heartbeat = tokio::spawn(heartbeat_task(handle.clone(), pong_rx, TICK, TICK * 5, 1));

        let client = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(frame) = rx.recv().await {
                if matches!(frame, Message::Ping(_)) {
                    pings += 1;
                    pong_tx.send_replace(Instant::now());
                }
            }
            pings
        });

        assert!(close_request_within(&handle, TICK * 15).await.is_none());
        heartbeat.abort();
        drop(handle);
        assert!(client.await.unwrap() >= 3);
    }

    #[tokio::test]
    async fn pong_from_before_the_ping_does_not_count() {
        let (handle, _rx) = connection(4);
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        // Arrives before any ping was sent
        pong_tx.send_replace(Instant::now());
        let heartbeat = tokio::spawn(heartbeat_task(handle.clone(), pong_rx, TICK, TICK, 1));

        let request = close_request_within(&handle, Duration::from_secs(2)).await;
        assert_eq!(request.map(|r| r.code), Some(CLOSE_GOING_AWAY));
        heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn full_buffer_closes_going_away() {
        let (handle, _rx) = connection(1);
        assert_eq!(handle.try_deliver(Message::Text("stuck".into())), Delivery::Queued);
        let (_pong_tx, pong_rx) = watch::channel(Instant::now());
        let heartbeat = tokio::spawn(heartbeat_task(handle.clone(), pong_rx, TICK, TICK, 1));

        let request = close_request_within(&handle, Duration::from_secs(2))
            .await
            .expect("heartbeat never closed the connection");
        assert_eq!(request.code, CLOSE_GOING_AWAY);
        assert_eq!(request.reason, "Connection not draining");
        heartbeat.await.unwrap();
    }
}
