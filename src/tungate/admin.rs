use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tungate::control::{Command, StatusEvent};
use crate::tungate::profile_store::{Profile, ProfileStore};

#[derive(Clone)]
pub struct AdminState {
    pub prom: Arc<PrometheusHandle>,
    pub profile_store: Arc<ProfileStore>,
    pub commands: mpsc::Sender<Command>,
    pub status: watch::Receiver<StatusEvent>,
}

pub async fn serve(addr: SocketAddr, state: AdminState) -> anyhow::Result<()> {
    let shared = Arc::new(state);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/profiles", get(list_profiles).post(upsert_profile))
        .route("/profiles/{id}", axum::routing::delete(delete_profile))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn status(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let current = st.status.borrow().clone();
    (StatusCode::OK, Json(current))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn list_profiles(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.profile_store.list()))
}

async fn upsert_profile(
    State(st): State<Arc<AdminState>>,
    Json(profile): Json<Profile>,
) -> impl IntoResponse {
    match st.profile_store.upsert(profile) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn delete_profile(
    State(st): State<Arc<AdminState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> impl IntoResponse {
    match st.profile_store.remove(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    profile_id: String,
}

async fn start(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    if st
        .commands
        .send(Command::Start {
            profile_id: req.profile_id,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "supervisor unavailable".to_string())
            .into_response();
    }

    match reply_rx.await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(err)) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "supervisor dropped reply".to_string())
            .into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct StopRequest {
    #[serde(default)]
    force: bool,
}

async fn stop(
    State(st): State<Arc<AdminState>>,
    body: Option<Json<StopRequest>>,
) -> impl IntoResponse {
    let force = body.map(|Json(r)| r.force).unwrap_or(false);

    let (reply_tx, reply_rx) = oneshot::channel();
    if st
        .commands
        .send(Command::Stop {
            force,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "supervisor unavailable".to_string())
            .into_response();
    }

    match reply_rx.await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(err)) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "supervisor dropped reply".to_string())
            .into_response(),
    }
}
