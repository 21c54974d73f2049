//! Passive health checking (failure detection from proxied traffic).
//!
//! # Design Decisions
//! - Connection errors and timeouts are failures
//! - 502, 503 and 504 are failures (the instance could not serve)
//! - Everything else, including 4xx and 500, is a success for health purposes

use axum::http::StatusCode;

use crate::health::state::Outcome;

/// Classify a forwarded attempt. `None` means no response was received.
pub fn classify(status: Option<StatusCode>) -> Outcome {
    match status {
        None => Outcome::Failure,
        Some(StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT) => {
            Outcome::Failure
        }
        Some(_) => Outcome::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify(None), Outcome::Failure);
        assert_eq!(classify(Some(StatusCode::SERVICE_UNAVAILABLE)), Outcome::Failure);
        assert_eq!(classify(Some(StatusCode::GATEWAY_TIMEOUT)), Outcome::Failure);
        assert_eq!(classify(Some(StatusCode::OK)), Outcome::Success);
        assert_eq!(classify(Some(StatusCode::NOT_FOUND)), Outcome::Success);
        assert_eq!(classify(Some(StatusCode::INTERNAL_SERVER_ERROR)), Outcome::Success);
    }
}
