use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;

use strata_core::{build_system_prompt, ChatRequest};
use strata_observability::{emit_event, ObservabilityEvent, ProcessKind};
use strata_tools::load_schema;
use strata_types::{App, AutomationRun, InputMessage};

use crate::{AppState, USER_HEADER};

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let stop = CancellationToken::new();
    let dispatcher = state
        .dispatcher
        .clone()
        .map(|dispatcher| dispatcher.spawn(&state.event_bus, stop.clone()));
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let detail = format!("listening on {addr}");
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            status: Some("ready"),
            detail: Some(&detail),
            ..ObservabilityEvent::new("server.started", "server.http")
        },
    );
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    stop.cancel();
    if let Some(dispatcher) = dispatcher {
        if let Err(err) = dispatcher.await {
            tracing::warn!("automation dispatcher stopped abnormally: {err}");
        }
    }
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/tools", get(list_tools))
        .route("/providers", get(list_providers))
        .route("/apps", post(create_app))
        .route("/apps/{app_id}/schema", get(app_schema))
        .route("/apps/{app_id}/chat", post(chat))
        .route(
            "/apps/{app_id}/automations/{automation_id}/runs",
            get(automation_runs),
        )
        .layer(cors)
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": crate::now_ms().saturating_sub(state.started_at_ms),
        "automations": state.dispatcher.is_some(),
    }))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tools.list())
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.providers.list())
}

fn require_user(headers: &HeaderMap) -> Result<String, StatusCode> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// Apps owned by someone else are reported as missing.
async fn owned_app(state: &AppState, app_id: &str, user_id: &str) -> Result<App, StatusCode> {
    let app = state.store.get_app(app_id).await.map_err(|err| {
        tracing::error!("app lookup failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    app.filter(|app| app.owner_id == user_id)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct CreateAppInput {
    name: String,
}

async fn create_app(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateAppInput>,
) -> Result<Json<App>, StatusCode> {
    let user_id = require_user(&headers)?;
    let name = input.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let app = state
        .store
        .insert_app(App::new(name, user_id))
        .await
        .map_err(|err| {
            tracing::error!("failed to create app: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(app))
}

async fn app_schema(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let user_id = require_user(&headers)?;
    let app = owned_app(&state, &app_id, &user_id).await?;
    let types = load_schema(state.store.as_ref(), &app.id)
        .await
        .map_err(|err| {
            tracing::error!("failed to load schema: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let prompt = build_system_prompt(&app.name, &types);
    Ok(Json(json!({ "types": types, "prompt": prompt })))
}

#[derive(Debug, Deserialize)]
struct ChatInput {
    messages: Vec<InputMessage>,
    provider: Option<String>,
    model: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<ChatInput>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let user_id = require_user(&headers)?;
    let app = owned_app(&state, &app_id, &user_id).await?;
    let request = ChatRequest {
        app_id: app.id,
        user_id,
        messages: input.messages,
        provider: input.provider,
        model: input.model,
    };
    let cancel = CancellationToken::new();
    // Dropping the response stream (client gone) cancels the loop.
    let guard = cancel.clone().drop_guard();
    let stream = state
        .orchestrator
        .stream_chat(request, cancel)
        .map(move |event| {
            let _ = &guard;
            Ok::<_, Infallible>(
                Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
            )
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn automation_runs(
    State(state): State<AppState>,
    Path((app_id, automation_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Vec<AutomationRun>>, StatusCode> {
    let user_id = require_user(&headers)?;
    let app = owned_app(&state, &app_id, &user_id).await?;
    let internal = |err: strata_store::StoreError| {
        tracing::error!("automation run lookup failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let automation = state
        .store
        .get_automation(&app.id, &automation_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let runs = state
        .store
        .list_automation_runs(&automation.id)
        .await
        .map_err(internal)?;
    Ok(Json(runs))
}
