//! Pipeline verdict

use envoy_types::pb::envoy::r#type::v3::StatusCode;
use serde_json::{Map, Value};
use tonic::Code;

/// Header carrying the denial reason back to the proxy
pub const REASON_HEADER: &str = "X-Ext-Auth-Reason";

/// Final verdict of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    /// `Ok` allows; anything else denies
    pub code: Code,
    /// Human-readable reason
    pub message: String,
    /// Response headers, in order; duplicates allowed
    pub headers: Vec<(String, String)>,
    /// Dynamic metadata for the proxy
    pub metadata: Map<String, Value>,
}

impl AuthResult {
    /// Allow with no headers or metadata
    pub fn allow() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
            headers: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Deny with a code and reason
    pub fn deny(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            headers: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Whether the request is allowed
    pub fn success(&self) -> bool {
        self.code == Code::Ok
    }

    /// HTTP status the proxy answers a denial with
    pub fn http_status(&self) -> StatusCode {
        http_status_for(self.code)
    }
}

/// Map a denial code to the HTTP status shown to the client
///
/// Codes outside the table map to 403.
pub fn http_status_for(code: Code) -> StatusCode {
    match code {
        Code::FailedPrecondition => StatusCode::BadRequest,
        Code::NotFound => StatusCode::NotFound,
        Code::Unauthenticated => StatusCode::Unauthorized,
        Code::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::Forbidden,
    }
}
