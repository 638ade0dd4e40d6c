use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lumen_common::error::LumenError;
use lumen_sync::SyncError;

pub enum ApiError {
    Lumen(LumenError),
    Sync(SyncError),
}

impl From<LumenError> for ApiError {
    fn from(err: LumenError) -> Self {
        Self::Lumen(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::Lumen(err) => match err {
                LumenError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
                LumenError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                LumenError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
                other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
            },
            Self::Sync(err) => match err {
                SyncError::AlreadyRunning { .. } => (StatusCode::CONFLICT, err.to_string()),
                SyncError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
                SyncError::QuickSyncFailed(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
                SyncError::Storage(inner) => (StatusCode::INTERNAL_SERVER_ERROR, inner.to_string()),
                SyncError::Interrupted(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_db::connections::models::SyncStatus;
    use lumen_sync::FetchError;
    use uuid::Uuid;

    #[test]
    fn sync_errors_map_to_http_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (
                ApiError::from(SyncError::AlreadyRunning {
                    connection_id: id,
                    status: SyncStatus::QuickSyncRunning,
                }),
                StatusCode::CONFLICT,
            ),
            (ApiError::from(SyncError::NotFound(id)), StatusCode::NOT_FOUND),
            (
                ApiError::from(SyncError::QuickSyncFailed(FetchError::Permanent {
                    status: None,
                    body: "bad request".into(),
                })),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::from(SyncError::Interrupted("task panicked".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(LumenError::Database("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_and_message().0, expected);
        }
    }
}
