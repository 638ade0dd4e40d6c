pub mod handlers;
pub mod responses;

use axum::routing::get;
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/connections/{id}/sync",
            get(handlers::get_sync_status).post(handlers::start_sync),
        )
        .route("/connections/{id}/bulk-jobs", get(handlers::list_bulk_jobs))
}
