//! The inference-request surface of §6's "Inference Request API": enqueue/get/list/cancel against
//! the Inference Request Store (§4.F) — everything else about that external API (auth, admin
//! views) is out of scope per §1.

use crate::error::AdapterError;
use crate::types::{EnqueueInferenceRequest, RequestState};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/inference-requests", post(enqueue).get(list))
		.route("/inference-requests/{id}", get(get_request).delete(cancel))
}

#[derive(Serialize)]
struct ValidationErrorBody {
	errors: Vec<String>,
}

impl IntoResponse for AdapterError {
	fn into_response(self) -> Response {
		match self {
			Self::ValidationFailed(errors) => {
				(StatusCode::BAD_REQUEST, Json(ValidationErrorBody { errors })).into_response()
			}
			Self::PolicyReject(reason) => (StatusCode::FORBIDDEN, reason).into_response(),
			Self::Cancelled => StatusCode::ACCEPTED.into_response(),
			Self::TransientIo(_) | Self::TransientRemote(_) | Self::StagingFull(_) => {
				(StatusCode::SERVICE_UNAVAILABLE, self.to_string()).into_response()
			}
			Self::ConfigInvalid(_) | Self::PermanentRemote(_) => {
				(StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
			}
		}
	}
}

async fn enqueue(State(state): State<AppState>, Json(body): Json<EnqueueInferenceRequest>) -> Response {
	match state.store.enqueue(body) {
		Ok(request) => (StatusCode::CREATED, Json(request)).into_response(),
		Err(err) => AdapterError::from(err).into_response(),
	}
}

async fn get_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
	match state.store.get(id) {
		Ok(Some(request)) => Json(request).into_response(),
		Ok(None) => StatusCode::NOT_FOUND.into_response(),
		Err(err) => AdapterError::from(err).into_response(),
	}
}

#[derive(Deserialize)]
struct ListQuery {
	state: RequestState,
}

async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
	match state.store.scan_by_state(query.state) {
		Ok(requests) => Json(requests).into_response(),
		Err(err) => AdapterError::from(err).into_response(),
	}
}

/// Cancels a still-`Queued` request outright (§4.F), or best-effort-signals a cancellation token
/// for one already `InProcess` (§4.G "Cancellation").
async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
	match state.store.cancel_if_queued(id) {
		Ok(true) => StatusCode::NO_CONTENT.into_response(),
		Ok(false) => {
			state.cancellations.cancel(id);
			StatusCode::ACCEPTED.into_response()
		}
		Err(err) => AdapterError::from(err).into_response(),
	}
}
