//! Localhost status API for dashboards and operators.
//!
//! Binds to 127.0.0.1:9190 by default.
//! Routes:
//!   GET    /healthz                  - liveness
//!   GET    /api/v1/status            - transport, window and poller status
//!   GET    /api/v1/readings          - rolling window, oldest first
//!   GET    /api/v1/readings/current  - newest reading (404 when none)
//!   DELETE /api/v1/readings          - clear history (store first)
//!   PUT    /api/v1/broker/active     - start or stop the broker session
//!   GET    /api/v1/events            - SSE stream of window and status events

use crate::coordinator::IngestionCoordinator;
use crate::status_log::{Banner, StatusLog};
use crate::transport::{ConnectionState, TransportClient, TransportConfig, TransportHandler};
use crate::ui_events::IngestUiEvent;
use axum::routing::{get, put};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tower_http::trace::TraceLayer;
use tracing::info;
use wx_reading::Reading;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub coordinator: Arc<IngestionCoordinator>,
    pub transport: Arc<TransportClient>,
    pub status: StatusLog,
    /// Last broker config handed to the transport, reused by the active toggle.
    pub broker: Mutex<TransportConfig>,
    pub handler: Arc<dyn TransportHandler>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<IngestionCoordinator>,
        transport: Arc<TransportClient>,
        broker: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Arc<Self> {
        let status = coordinator.status_log().clone();
        Arc::new(Self {
            coordinator,
            transport,
            status,
            broker: Mutex::new(broker),
            handler,
        })
    }
}

// ---------------------------------------------------------------------------
// Request/Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connection_state: ConnectionState,
    pub subscribed: bool,
    pub broker_active: bool,
    pub window_size: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub active_poller: bool,
    pub pending_persist: usize,
    pub banners: Vec<Banner>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub readings: Vec<Reading>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerActiveRequest {
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let window = state.coordinator.window();
    let broker_active = state.broker.lock().await.active;
    Json(StatusResponse {
        connection_state: state.transport.state(),
        subscribed: state.transport.is_subscribed(),
        broker_active,
        window_size: window.len(),
        last_updated: window.last_updated(),
        active_poller: state.coordinator.is_active_poller(),
        pending_persist: state.coordinator.pending_count(),
        banners: state.status.entries(),
    })
}

async fn get_readings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.coordinator.window().view();
    Json(ReadingsResponse {
        readings: view.readings,
        last_updated: view.last_updated,
    })
}

async fn get_current(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.coordinator.window().current() {
        Some(reading) => Json(reading).into_response(),
        None => (StatusCode::NOT_FOUND, "no readings").into_response(),
    }
}

async fn delete_readings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.coordinator.clear_history().await {
        Ok(removed) => {
            info!(removed, "history cleared via api");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn put_broker_active(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BrokerActiveRequest>,
) -> impl IntoResponse {
    let mut broker = state.broker.lock().await;
    if broker.active == body.active {
        return StatusCode::OK.into_response();
    }
    broker.active = body.active;
    info!(active = body.active, "broker active flag changed");
    if body.active {
        state
            .transport
            .connect(broker.clone(), Arc::clone(&state.handler))
            .await;
    } else {
        state.transport.disconnect().await;
    }
    StatusCode::ACCEPTED.into_response()
}

fn event_name(event: &IngestUiEvent) -> &'static str {
    match event {
        IngestUiEvent::StatusChanged { .. } => "status_changed",
        IngestUiEvent::Banner { .. } => "banner",
        IngestUiEvent::Window { .. } => "window",
    }
}

async fn events_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::stream::Stream<Item = Result<Event, Infallible>>> {
    let ui = BroadcastStream::new(state.status.subscribe()).map(|r| r.map_err(|_| ()));
    let window = BroadcastStream::new(state.coordinator.window().subscribe())
        .map(|r| r.map(|update| IngestUiEvent::Window { update }).map_err(|_| ()));
    let transport = Arc::clone(&state.transport);
    let connection = WatchStream::new(state.transport.watch_state()).map(move |connection_state| {
        Ok(IngestUiEvent::StatusChanged {
            connection_state,
            subscribed: transport.is_subscribed(),
        })
    });

    let updates = ui.merge(window).merge(connection).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().event(event_name(&event)).data(json))),
            Err(_) => None,
        },
        Err(()) => Some(Ok(Event::default().event("resync").data("{}"))),
    });
    let initial = tokio_stream::once(Ok(Event::default().event("connected").data("{}")));
    let stream = initial.chain(updates);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/readings", get(get_readings).delete(delete_readings))
        .route("/api/v1/readings/current", get(get_current))
        .route("/api/v1/broker/active", put(put_broker_active))
        .route("/api/v1/events", get(events_sse))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
