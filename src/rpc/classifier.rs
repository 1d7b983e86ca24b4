use super::errors::CallError;
use crate::utils::IsTransient;

/// Whether a failed call is worth retrying.
///
/// Timeouts, refused/unreachable broker connections and broker-not-ready
/// conditions are transient. Structured remote errors, open circuits and
/// anything unclassified are not.
pub fn is_retriable(error: &CallError) -> bool {
    matches!(
        error,
        CallError::Timeout(_) | CallError::Connection(_) | CallError::BrokerNotReady(_)
    )
}

impl IsTransient for CallError {
    fn is_transient(&self) -> bool {
        is_retriable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_conditions_are_retriable() {
        assert!(is_retriable(&CallError::Timeout("get_user".into())));
        assert!(is_retriable(&CallError::Connection("connection refused".into())));
        assert!(is_retriable(&CallError::BrokerNotReady("transport not connected".into())));
    }

    #[test]
    fn test_application_errors_are_not_retriable() {
        assert!(!is_retriable(&CallError::remote(404, "not found")));
        assert!(!is_retriable(&CallError::remote(503, "down for maintenance")));
        assert!(!is_retriable(&CallError::circuit_open("users")));
        assert!(!is_retriable(&CallError::Unknown("weird".into())));
    }
}
