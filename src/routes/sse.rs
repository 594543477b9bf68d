// SSE progress stream. One-way and best effort: a lagging observer skips
// events and keeps going; stream end tells the consumer nothing about the
// operation's outcome.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::broadcast;

use super::AppState;
use crate::models::ProgressEvent;

/// GET /api/updates/events — named events (`connected`, `step`, `log`,
/// `error`, `launched`) with JSON payloads.
pub(super) async fn events_handler(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.progress_tx.subscribe();

    let hello = stream::iter(vec![sse_event(&ProgressEvent::Connected)]);
    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((sse_event(&event), rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "SSE observer lagged; skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(hello.chain(updates)).keep_alive(KeepAlive::default())
}

fn sse_event(event: &ProgressEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.event_name()).json_data(event)
}
