//! HTTP surface: dashboard page, SSE snapshot stream and health check.
//!
//! * `GET /`       – bundled dashboard page.
//! * `GET /events` – SSE stream; every open stream is one hub subscriber and
//!   receives each snapshot as a `gpustat` event.
//! * `GET /health` – poller status as JSON, `503` once polling has stopped.

use std::time::Duration;

use async_stream::stream;
use poem::http::StatusCode;
use poem::web::sse::{Event, SSE};
use poem::web::{Data, Html, Json};
use poem::{get, handler, Endpoint, EndpointExt, IntoResponse, Response, Route};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use crate::controller::{PollState, PollerStatus};
use crate::hub::SubscriberHub;

const INDEX_HTML: &str = include_str!("../static/index.html");

pub const SNAPSHOT_EVENT: &str = "gpustat";

#[derive(Clone)]
pub struct AppState {
    pub hub: SubscriberHub,
    pub status: watch::Receiver<PollerStatus>,
}

#[derive(Serialize)]
struct Health {
    #[serde(flatten)]
    status: PollerStatus,
    subscribers: usize,
}

#[handler]
fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[handler]
fn events(Data(state): Data<&AppState>) -> SSE {
    let mut receiver = state.hub.subscribe();
    let sse_stream = stream! {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    yield Event::message(payload.to_string()).event_type(SNAPSHOT_EVENT);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber fell behind, skipping snapshots");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    SSE::new(sse_stream).keep_alive(Duration::from_secs(15))
}

#[handler]
fn health(Data(state): Data<&AppState>) -> Response {
    let status = state.status.borrow().clone();
    let code = if status.state == PollState::Failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Json(Health {
        status,
        subscribers: state.hub.subscriber_count(),
    })
    .with_status(code)
    .into_response()
}

pub fn routes(state: AppState) -> impl Endpoint {
    Route::new()
        .at("/", get(index))
        .at("/events", get(events))
        .at("/health", get(health))
        .data(state)
}
