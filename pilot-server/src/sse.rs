//! Server-Sent Events stream of one run's events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use pilot::core::event::RunEvent;
use pilot::registry::RunRegistry;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::routes::not_found;
use crate::state::AppState;

/// One attached observer. Dropping it releases the run if it was the last one.
struct Observer {
    run_id: String,
    registry: Arc<RunRegistry>,
    rx: Option<broadcast::Receiver<RunEvent>>,
}

impl Observer {
    async fn recv(&mut self) -> Option<RunEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(run_id = %self.run_id, skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        // Unsubscribe first so the count below excludes this observer.
        drop(self.rx.take());
        if self.registry.release_if_unobserved(&self.run_id) {
            info!(run_id = %self.run_id, "last observer left, run released");
        }
    }
}

fn frame(event: &RunEvent) -> Option<Event> {
    serde_json::to_string(event)
        .ok()
        .map(|json| Event::default().event("run").data(json))
}

fn event_stream(mut observer: Observer, backlog: Vec<RunEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        for event in &backlog {
            if let Some(frame) = frame(event) {
                yield Ok(frame);
            }
        }
        while let Some(event) = observer.recv().await {
            if let Some(frame) = frame(&event) {
                yield Ok(frame);
            }
        }
        debug!(run_id = %observer.run_id, "event stream closed");
    }
}

/// GET /api/test/{run_id}/events
pub async fn events_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    let Some(run) = state.registry.get(&run_id) else {
        return (StatusCode::NOT_FOUND, not_found()).into_response();
    };
    let (backlog, rx) = run.events().subscribe_with_backlog();
    info!(run_id = %run_id, backlog = backlog.len(), "observer attached");
    let observer = Observer {
        run_id,
        registry: state.registry.clone(),
        rx: Some(rx),
    };

    Sse::new(event_stream(observer, backlog))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}
