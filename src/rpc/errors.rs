use serde::{Deserialize, Serialize};

// ============================================================================
// Outbound Call Errors
// ============================================================================

/// Failure of one outbound call, tagged by cause.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection to broker failed: {0}")]
    Connection(String),

    #[error("Broker not ready: {0}")]
    BrokerNotReady(String),

    #[error("Remote service error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Circuit breaker open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("Unexpected call failure: {0}")]
    Unknown(String),
}

impl CallError {
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        CallError::Remote {
            status,
            message: message.into(),
        }
    }

    pub fn circuit_open(dependency: impl Into<String>) -> Self {
        CallError::CircuitOpen {
            dependency: dependency.into(),
        }
    }
}

/// Error body a remote service puts on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl From<RemoteErrorBody> for CallError {
    fn from(body: RemoteErrorBody) -> Self {
        match body.status {
            Some(status) => CallError::Remote {
                status,
                message: body.message,
            },
            None => CallError::Unknown(body.message),
        }
    }
}

// ============================================================================
// Local Service Errors
// ============================================================================

/// The stable set of error kinds callers see at the service boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::Unauthorized(_) => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::RequestTimeout(_) => 408,
            ServiceError::Internal(_) => 500,
            ServiceError::ServiceUnavailable(_) => 503,
            ServiceError::GatewayTimeout(_) => 504,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::BadRequest(m)
            | ServiceError::Unauthorized(m)
            | ServiceError::Forbidden(m)
            | ServiceError::NotFound(m)
            | ServiceError::RequestTimeout(m)
            | ServiceError::Internal(m)
            | ServiceError::ServiceUnavailable(m)
            | ServiceError::GatewayTimeout(m) => m,
        }
    }
}
