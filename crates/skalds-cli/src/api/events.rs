//! Event fanout: long-lived SSE streams over the state-store change feeds.
//!
//! Each client subscription is one broadcast receiver; a client that falls
//! more than the configured high-water mark behind sees `Lagged` and the
//! stream is closed with reason `slow_consumer` instead of ever blocking
//! the monitors.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use skalds_core::state::{SkaldChange, TaskChange};

use super::AppState;

/// Decrements the connected-client gauge when a stream is dropped, however
/// the disconnect happens.
struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn matches(filter: &Option<String>, id: &str) -> bool {
    filter.as_deref().is_none_or(|f| f == id)
}

fn close_event() -> Event {
    Event::default().event("close").data("{\"reason\":\"slow_consumer\"}")
}

#[derive(Debug, Deserialize)]
pub struct SkaldEventsQuery {
    pub skald_id: Option<String>,
}

pub async fn skald_events(
    State(state): State<AppState>,
    Query(query): Query<SkaldEventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.runtime.skalds.subscribe();
    let filter = query.skald_id;
    let guard = ClientGuard::new(state.sse_clients.clone());
    let keepalive = state.runtime.config.sse_keepalive_interval;

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(SkaldChange::Updated(record)) if matches(&filter, &record.id) => {
                    if let Ok(event) = Event::default().event("skald").json_data(&record) {
                        yield Ok(event);
                    }
                }
                Ok(SkaldChange::Removed(id)) if matches(&filter, &id) => {
                    yield Ok(Event::default().event("skald-removed").data(id));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "dropping slow skald-event consumer");
                    yield Ok(close_event());
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("keep-alive"))
}

#[derive(Debug, Deserialize)]
pub struct TaskEventsQuery {
    pub task_id: Option<String>,
}

pub async fn task_events(
    State(state): State<AppState>,
    Query(query): Query<TaskEventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.runtime.tasks.subscribe();
    let filter = query.task_id;
    let guard = ClientGuard::new(state.sse_clients.clone());
    let keepalive = state.runtime.config.sse_keepalive_interval;

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(TaskChange::Updated(record)) if matches(&filter, &record.id) => {
                    if let Ok(event) = Event::default().event("task").json_data(&record) {
                        yield Ok(event);
                    }
                }
                Ok(TaskChange::Removed(id)) if matches(&filter, &id) => {
                    yield Ok(Event::default().event("task-removed").data(id));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "dropping slow task-event consumer");
                    yield Ok(close_event());
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("keep-alive"))
}

pub async fn events_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "connectedClients": state.sse_clients.load(Ordering::Relaxed),
        "status": "ok",
    }))
}
