use crate::http::HttpError;
use crate::status::{StatusEvent, StreamStatus};
use crate::stream_manager::StreamManager;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

/// `GET /streams`: JSON snapshot of all per-stream statuses.
pub async fn list_streams(State(manager): State<StreamManager>) -> Json<Vec<StreamStatus>> {
    Json(manager.status().statuses())
}

fn to_sse(event: &StatusEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// `GET /streams/status`: one `snapshot` event, then incremental events.
pub async fn status_events(
    State(manager): State<StreamManager>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (snapshot, rx) = manager.status().subscribe(
        manager.browser().is_connected(),
        manager.browser().page_count(),
    );
    let initial = stream::once(async move { Ok(to_sse(&snapshot)) });
    let live = BroadcastStream::new(rx)
        .filter_map(|event| async move { event.ok().map(|e| Ok(to_sse(&e))) });
    Sse::new(initial.chain(live)).keep_alive(KeepAlive::default())
}

/// `DELETE /streams/{id}`
pub async fn terminate(
    State(manager): State<StreamManager>,
    Path(id): Path<u64>,
) -> Result<StatusCode, HttpError> {
    if manager.stream(id).is_none() {
        return Err(HttpError::NotFound("unknown stream"));
    }
    manager.terminate_stream(id, "terminated via API").await;
    Ok(StatusCode::OK)
}
