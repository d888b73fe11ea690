use crate::AppState;
use axum::Router;

mod home;
mod inference_requests;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new().merge(home::routes()).merge(inference_requests::routes());

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}
