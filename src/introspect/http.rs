use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router as HttpRouter};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::Router;
use crate::broker::channel::Channel;
use crate::broker::message::Message;
use crate::remote::RemoteSite;
use crate::utils::error::GatewayError;

type HttpError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct IntrospectState {
    pub router: Arc<Router>,
    /// Remote sites by configured name.
    pub sites: Arc<HashMap<String, Arc<RemoteSite>>>,
}

pub fn app(state: IntrospectState) -> HttpRouter {
    HttpRouter::new()
        .route("/router/history", get(history))
        .route("/router/listeners", get(listeners))
        .route("/remote/{name}/status", get(remote_status))
        .route("/remote/{name}/queue", get(remote_queue))
        .with_state(state)
}

/// Serve the debug endpoints on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: IntrospectState,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "introspection listening");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn history(State(state): State<IntrospectState>) -> Json<Vec<Message>> {
    Json(state.router.history())
}

async fn listeners(State(state): State<IntrospectState>) -> Json<Vec<Value>> {
    Json(state.router.channel_table())
}

fn remote(state: &IntrospectState, name: &str) -> Result<Arc<RemoteSite>, HttpError> {
    state.sites.get(name).cloned().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown remote site '{name}'") })),
        )
    })
}

async fn remote_status(
    State(state): State<IntrospectState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, HttpError> {
    Ok(Json(remote(&state, &name)?.debug_json()))
}

async fn remote_queue(
    State(state): State<IntrospectState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, HttpError> {
    Ok(Json(remote(&state, &name)?.queue_json()))
}
