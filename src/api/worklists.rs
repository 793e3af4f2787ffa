use crate::workflow::model::WorkflowResponse;
use crate::AppState;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::instrument;

/// HTTP Router for the scheduling peers: worklist queries and the MPPS lifecycle.
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/worklists", get(all_worklists))
		.route("/worklists/{name}/query", post(query))
		.route("/worklists/{name}/mpps", post(begin))
		.route("/worklists/{name}/mpps/complete", post(complete))
		.route("/worklists/{name}/mpps/discontinue", post(discontinue))
}

async fn all_worklists(State(state): State<AppState>) -> impl IntoResponse {
	Json(state.service.worklist_names())
}

#[instrument(skip_all)]
async fn query(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.query_worklist(&name, &body).await
}

#[instrument(skip_all)]
async fn begin(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.begin(&name, &body).await
}

#[instrument(skip_all)]
async fn complete(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.complete(&name, &body).await
}

#[instrument(skip_all)]
async fn discontinue(
	State(state): State<AppState>,
	Path(name): Path<String>,
	body: String,
) -> WorkflowResponse {
	state.service.discontinue(&name, &body).await
}
