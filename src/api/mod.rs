use crate::workflow::model::WorkflowResponse;
use crate::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};

mod peers;
mod worklists;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new()
		.merge(worklists::routes())
		.merge(peers::routes());

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}

/// Failed operations are answered with 200 as well; callers inspect `success`.
impl IntoResponse for WorkflowResponse {
	fn into_response(self) -> Response {
		(StatusCode::OK, Json(self)).into_response()
	}
}
