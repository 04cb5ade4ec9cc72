//! `GET /sessions/{session_id}/events`: SSE fan-out with `Last-Event-ID`
//! replay-then-live resume semantics.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use tracing::warn;

use crate::events::event_type;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/sessions/{session_id}/events", get(stream_events))
}

const LAST_EVENT_ID_HEADER: &str = "last-event-id";

async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let after_seq = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let handle = state.broadcaster.subscribe(&session_id);
    let broadcaster = std::sync::Arc::clone(&state.broadcaster);
    let history = std::sync::Arc::clone(&state.history);

    let stream = async_stream::stream! {
        yield Ok(SseEvent::default().event(event_type::CONNECTED).data("{}"));

        let mut max_replayed_seq = after_seq;
        match history.replay(&session_id, after_seq).await {
            Ok(events) => {
                for stored in events {
                    max_replayed_seq = max_replayed_seq.max(stored.seq);
                    yield Ok(to_sse(stored.seq, &stored.event_type, &serde_json::json!({
                        "session_id": stored.session_id,
                        "run_id": stored.run_id,
                        "parent_run_id": stored.parent_run_id,
                        "timestamp": stored.timestamp,
                        "payload": stored.payload,
                    })));
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "history replay failed, continuing with live stream only");
            }
        }

        let mut receiver = handle.receiver;
        let mut priority_receiver = handle.priority_receiver;
        // Terminal events and stream.dropped notices arrive on the unbounded
        // priority channel and must never wait behind the bounded data
        // channel; `priority_open` stops selecting on it once it closes so
        // the loop falls back to plain `receiver.recv()` instead of busy
        // polling a permanently-ready closed channel.
        let mut priority_open = true;
        loop {
            let event = if priority_open {
                tokio::select! {
                    biased;
                    event = priority_receiver.recv() => {
                        if event.is_none() {
                            priority_open = false;
                            continue;
                        }
                        event
                    }
                    event = receiver.recv() => event,
                }
            } else {
                receiver.recv().await
            };

            let Some(event) = event else { break };

            if event.event_type == event_type::STREAM_DROPPED {
                // Ephemeral control message, not part of the durable
                // sequence: never subject to the replay-cursor filter below.
                yield Ok(to_sse(event.seq, &event.event_type, &serde_json::json!({
                    "session_id": event.session_id,
                    "payload": event.payload,
                })));
                continue;
            }

            if event.seq <= max_replayed_seq {
                continue;
            }
            broadcaster.mark_seen(&handle.subscriber_id, &event.run_id, event.seq);
            yield Ok(to_sse(event.seq, &event.event_type, &serde_json::json!({
                "session_id": event.session_id,
                "run_id": event.run_id,
                "parent_run_id": event.parent_run_id,
                "timestamp": event.timestamp,
                "payload": event.payload,
            })));
        }
        broadcaster.unsubscribe(&handle.subscriber_id);
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(seq: u64, event_type: &str, body: &serde_json::Value) -> SseEvent {
    SseEvent::default()
        .id(seq.to_string())
        .event(event_type.to_string())
        .data(serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()))
}
