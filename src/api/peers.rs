use crate::workflow::model::WorkflowResponse;
use crate::AppState;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::instrument;

/// HTTP Router for the storage peers.
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/peers", get(all_peers))
		.route("/peers/{name}/store", post(store_series))
		.route("/peers/{name}/store/structured", post(store_structured))
		.route("/peers/{name}/store/path", post(store_path))
}

async fn all_peers(State(state): State<AppState>) -> impl IntoResponse {
	Json(state.service.peer_names())
}

/// Stores the acquired series of a procedure step.
#[instrument(skip_all)]
async fn store_series(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.store_series(&name, &body).await
}

#[instrument(skip_all)]
async fn store_structured(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.store_structured(&name, &body).await
}

/// Stores files without a procedure step.
#[instrument(skip_all)]
async fn store_path(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.store_path(&name, &body).await
}
