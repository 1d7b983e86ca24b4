use super::errors::{CallError, ServiceError};

/// Message used whenever the cause must not leak to the caller
pub const UNAVAILABLE_MESSAGE: &str = "Service temporarily unavailable";

/// Map a failed outbound call to the local error kind callers see.
///
/// Recognized remote statuses keep their message. Transport-level failures
/// become ServiceUnavailable, a spent timeout budget becomes GatewayTimeout,
/// and anything else falls back to a generic ServiceUnavailable.
pub fn translate(error: &CallError) -> ServiceError {
    match error {
        CallError::Remote { status, message } => match status {
            400 => ServiceError::BadRequest(message.clone()),
            401 => ServiceError::Unauthorized(message.clone()),
            403 => ServiceError::Forbidden(message.clone()),
            404 => ServiceError::NotFound(message.clone()),
            408 => ServiceError::RequestTimeout(message.clone()),
            500 => ServiceError::Internal(message.clone()),
            503 => ServiceError::ServiceUnavailable(message.clone()),
            504 => ServiceError::GatewayTimeout(message.clone()),
            other => {
                tracing::debug!(status = other, "Unrecognized remote status, masking");
                ServiceError::ServiceUnavailable(UNAVAILABLE_MESSAGE.to_string())
            }
        },
        CallError::Timeout(message) => ServiceError::GatewayTimeout(message.clone()),
        CallError::Connection(_) | CallError::BrokerNotReady(_) => {
            ServiceError::ServiceUnavailable("Unable to reach dependent service".to_string())
        }
        CallError::CircuitOpen { dependency } => ServiceError::ServiceUnavailable(format!(
            "{} is temporarily unavailable",
            dependency
        )),
        CallError::Unknown(_) => ServiceError::ServiceUnavailable(UNAVAILABLE_MESSAGE.to_string()),
    }
}

impl From<CallError> for ServiceError {
    fn from(error: CallError) -> Self {
        translate(&error)
    }
}
