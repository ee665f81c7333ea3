//! Responses the layer produces itself.

use axum_core::body::Body;
use axum_core::response::Response;
use b402::GateError;
use b402::challenge::Challenge;
use http::header::CONTENT_TYPE;
use http::{HeaderName, HeaderValue, StatusCode};
use serde_json::json;

use crate::constants::{ACCESS_CONTROL_EXPOSE_HEADERS, PAYMENT_REQUIRED_DETAIL};

fn json_response(status: StatusCode, detail: &str) -> Response {
    let body = json!({ "detail": detail }).to_string();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// `402 Payment Required` carrying the challenge headers.
///
/// The body is the same for every denial; only the headers differ.
#[must_use]
pub fn challenge_response(challenge: &Challenge) -> Response {
    let mut response = json_response(StatusCode::PAYMENT_REQUIRED, PAYMENT_REQUIRED_DETAIL);
    let headers = response.headers_mut();
    let mut exposed = Vec::new();
    for (name, value) in challenge.headers() {
        let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            tracing::warn!(header = name, "Dropping challenge header with invalid value");
            continue;
        };
        headers.insert(header_name, header_value);
        exposed.push(name);
    }
    if let Ok(value) = HeaderValue::from_str(&exposed.join(", ")) {
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
    }
    response
}

/// `500` for configuration defects, `503` for unavailable stores.
#[must_use]
pub fn error_response(err: &GateError) -> Response {
    match err {
        GateError::Configuration(_) => {
            tracing::error!(error = %err, "x402 gate misconfigured");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Payment gateway misconfigured",
            )
        }
        GateError::Store(_) => {
            tracing::error!(error = %err, "x402 gate storage unavailable");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Payment service temporarily unavailable",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use b402::error::{ConfigError, StoreError};

    #[test]
    fn test_error_status_codes() {
        let config = error_response(&GateError::Configuration(ConfigError::MissingPayTo));
        assert_eq!(config.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let store = error_response(&GateError::Store(StoreError::Backend("down".into())));
        assert_eq!(store.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(store.headers()[CONTENT_TYPE], "application/json");
    }
}
