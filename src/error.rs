//! Error codes and JSON error responses for the dashboard API

use crate::settings::SettingsError;
use crate::supervisor::SupervisorError;
use crate::workspace::WorkspaceError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No such route
    NotFound,
    /// Malformed request body or parameters
    BadRequest,
    /// Instance id not registered
    UnknownInstance,
    /// The server instance cannot be removed
    ReservedInstance,
    /// Config file does not exist
    FileNotFound,
    /// Config file already exists
    FileExists,
    /// File name or path outside the managed directories
    InvalidPath,
    /// Settings file unreadable or unwritable
    SettingsError,
    /// Anything else
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::UnknownInstance => StatusCode::NOT_FOUND,
            ApiErrorCode::ReservedInstance => StatusCode::CONFLICT,
            ApiErrorCode::FileNotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::FileExists => StatusCode::CONFLICT,
            ApiErrorCode::InvalidPath => StatusCode::FORBIDDEN,
            ApiErrorCode::SettingsError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Dashboard-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::UnknownInstance => "UNKNOWN_INSTANCE",
            ApiErrorCode::ReservedInstance => "RESERVED_INSTANCE",
            ApiErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ApiErrorCode::FileExists => "FILE_EXISTS",
            ApiErrorCode::InvalidPath => "INVALID_PATH",
            ApiErrorCode::SettingsError => "SETTINGS_ERROR",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&SupervisorError> for ApiErrorCode {
    fn from(err: &SupervisorError) -> Self {
        match err {
            SupervisorError::UnknownInstance(_) => ApiErrorCode::UnknownInstance,
            SupervisorError::ReservedInstance(_) => ApiErrorCode::ReservedInstance,
            SupervisorError::Settings(e) => e.into(),
        }
    }
}

impl From<&SettingsError> for ApiErrorCode {
    fn from(err: &SettingsError) -> Self {
        match err {
            SettingsError::Io { .. } | SettingsError::Parse { .. } => ApiErrorCode::SettingsError,
            SettingsError::InvalidInstanceId(_)
            | SettingsError::MissingInstanceName
            | SettingsError::UnderivableInstanceId => ApiErrorCode::BadRequest,
        }
    }
}

impl From<&WorkspaceError> for ApiErrorCode {
    fn from(err: &WorkspaceError) -> Self {
        match err {
            WorkspaceError::NotFound(_) => ApiErrorCode::FileNotFound,
            WorkspaceError::AlreadyExists(_) => ApiErrorCode::FileExists,
            WorkspaceError::InvalidName(_)
            | WorkspaceError::OutsideDirectory(_)
            | WorkspaceError::InvalidDirectory(_) => ApiErrorCode::InvalidPath,
            WorkspaceError::Io { .. } => ApiErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Dashboard-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Dashboard-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Error response for any domain error that maps to an [`ApiErrorCode`]
pub fn error_response<'a, E>(err: &'a E) -> Response<Full<Bytes>>
where
    E: std::fmt::Display,
    ApiErrorCode: From<&'a E>,
{
    json_error_response(ApiErrorCode::from(err), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ApiErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiErrorCode::UnknownInstance.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiErrorCode::ReservedInstance.status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiErrorCode::InvalidPath.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ApiErrorCode::UnknownInstance, "unknown instance: office");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_INSTANCE\""));
        assert!(json.contains("\"message\":\"unknown instance: office\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ApiErrorCode::FileExists, "file already exists: a.toml");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Dashboard-Error").unwrap(), "FILE_EXISTS");
    }

    #[test]
    fn test_domain_error_mapping() {
        let err = SupervisorError::ReservedInstance("frps".to_string());
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::ReservedInstance);

        let err = WorkspaceError::InvalidName("../x".to_string());
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let err = SupervisorError::Settings(SettingsError::MissingInstanceName);
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::BadRequest);
    }
}
