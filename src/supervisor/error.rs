//! Kernel supervision error type. Variants are kept distinct so the IPC
//! handlers can map each one to a matching HTTP status code.

use std::path::PathBuf;

use axum::http::StatusCode;

use super::state_machine::State;

/// Errors raised while validating, starting or supervising the kernel.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("Kernel executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Kernel file cannot be opened, please ensure there's a file instead of a folder: {}", .0.display())]
    NotReadable(PathBuf),

    #[error("Kernel assets path is not valid: {}", .0.display())]
    MissingAssets(PathBuf),

    #[error("No geoip.dat in assets path")]
    MissingGeoIp,

    #[error("No geosite.dat in assets path")]
    MissingGeoSite,

    #[error("Kernel failed with an exit code: {}", exit_code_label(.0))]
    VersionCheckFailed(Option<i32>),

    #[error("Kernel returns empty string")]
    EmptyVersionOutput,

    #[error("Timeout after {secs}s: {operation}")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Configuration error: {0}")]
    ConfigTestFailed(String),

    #[error("Kernel build variant '{0}' is not allowed; set WARDEN_ALLOW_XRAY_CORE to accept it")]
    UnsupportedVariant(&'static str),

    #[error("Invalid kernel instance status: expected Stopped, found {0:?}")]
    InvalidState(State),

    #[error("Failed to spawn kernel: {0}")]
    SpawnFailed(String),

    #[error("Supervisor task is no longer running")]
    SupervisorGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    /// HTTP status mapping for the IPC layer
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::NotReadable(_) => StatusCode::NOT_FOUND,
            Self::MissingAssets(_) | Self::MissingGeoIp | Self::MissingGeoSite => {
                StatusCode::PRECONDITION_FAILED
            }
            Self::ConfigTestFailed(_) | Self::UnsupportedVariant(_) | Self::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::VersionCheckFailed(_)
            | Self::EmptyVersionOutput
            | Self::SpawnFailed(_)
            | Self::SupervisorGone
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotReadable(_) => "NOT_READABLE",
            Self::MissingAssets(_) => "MISSING_ASSETS",
            Self::MissingGeoIp => "MISSING_GEOIP",
            Self::MissingGeoSite => "MISSING_GEOSITE",
            Self::VersionCheckFailed(_) => "VERSION_CHECK_FAILED",
            Self::EmptyVersionOutput => "EMPTY_VERSION_OUTPUT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConfigTestFailed(_) => "CONFIG_TEST_FAILED",
            Self::UnsupportedVariant(_) => "UNSUPPORTED_VARIANT",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::SupervisorGone => "SUPERVISOR_GONE",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// Lets axum handlers return `KernelError` directly
impl axum::response::IntoResponse for KernelError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
