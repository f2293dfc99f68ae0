use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hamlet_pool::{Error, ErrorKind};
use serde_json::json;

/// A pool error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UnknownEndpoint { .. } => StatusCode::NOT_FOUND,
            Error::PoolExhausted { .. } | Error::AcquireTimeout { .. } | Error::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::DispatchTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::HandlerError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::HandlerDisconnected { .. } => StatusCode::BAD_GATEWAY,
            Error::SpawnFailure { .. } | Error::InvalidConfig { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable, machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match &self.0 {
            Error::UnknownEndpoint { .. } => "unknown_endpoint",
            Error::SpawnFailure { .. } => "spawn_failure",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::AcquireTimeout { .. } => "acquire_timeout",
            Error::DispatchTimeout { .. } => "dispatch_timeout",
            Error::HandlerError { .. } => "handler_error",
            Error::HandlerDisconnected { .. } => "handler_disconnected",
            Error::ShuttingDown => "shutting_down",
            Error::InvalidConfig { .. } => "invalid_config",
        }
    }

    pub const fn kind_label(&self) -> &'static str {
        match self.0.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Handler => "handler",
            ErrorKind::Internal => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.0.to_string(),
                "retryable": self.0.is_retryable(),
            }
        });
        if let Error::HandlerError { failure, .. } = &self.0 {
            body["error"]["handler"] = json!(failure);
        }
        (status, Json(body)).into_response()
    }
}
