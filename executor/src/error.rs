use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Stable error identifiers surfaced on the wire as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GeneralUnknown,
    GeneralRouteNotFound,
    GeneralUnauthorized,
    ExecutionBadRequest,
    ExecutionTimeout,
    ExecutionBadJson,
    RuntimeNotFound,
    RuntimeConflict,
    RuntimeFailed,
    RuntimeTimeout,
    LogsTimeout,
    CommandTimeout,
    CommandFailed,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::GeneralUnknown => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::GeneralRouteNotFound => StatusCode::NOT_FOUND,
            ErrorKind::GeneralUnauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::ExecutionBadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ExecutionBadJson => StatusCode::BAD_REQUEST,
            ErrorKind::RuntimeNotFound => StatusCode::NOT_FOUND,
            ErrorKind::RuntimeConflict => StatusCode::CONFLICT,
            ErrorKind::RuntimeFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::RuntimeTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::LogsTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::CommandTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::CommandFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::GeneralUnknown, message)
    }

    pub fn route_not_found() -> Self {
        Self::new(ErrorKind::GeneralRouteNotFound, "Route not found")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionBadRequest, message)
    }

    pub fn bad_json(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionBadJson, message)
    }

    pub fn execution_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionTimeout, message)
    }

    pub fn runtime_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeNotFound, message)
    }

    pub fn runtime_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeConflict, message)
    }

    pub fn runtime_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeFailed, message)
    }

    pub fn runtime_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeTimeout, message)
    }

    pub fn logs_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LogsTimeout, message)
    }

    pub fn command_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandTimeout, message)
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandFailed, message)
    }
}

/// HTTP status code reported by the cluster API server, if this is an API
/// error at all.
pub fn kube_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub fn is_kube_not_found(err: &kube::Error) -> bool {
    kube_error_code(err) == Some(404)
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: ErrorKind,
    message: String,
    code: u16,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        tracing::error!(kind = ?self.kind, message = %self.message, "request failed");
        let body = ErrorBody {
            kind: self.kind,
            message: self.message,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_stable_identifiers() {
        let cases = [
            (ErrorKind::GeneralUnknown, "general_unknown"),
            (ErrorKind::ExecutionBadRequest, "execution_bad_request"),
            (ErrorKind::RuntimeConflict, "runtime_conflict"),
            (ErrorKind::LogsTimeout, "logs_timeout"),
            (ErrorKind::CommandFailed, "command_failed"),
        ];
        for (kind, expected) in cases {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(expected.into())
            );
        }
    }

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        assert_eq!(
            ErrorKind::RuntimeTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ErrorKind::ExecutionTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ErrorKind::RuntimeConflict.status(), StatusCode::CONFLICT);
    }
}
