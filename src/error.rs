//! Error handling and JSON error responses for the gateway edge

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error categories surfaced at the HTTP edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Missing or invalid Host header in request
    MissingHostHeader,
    /// No route registered for the requested host
    UnknownHost,
    /// Session valid but a required role is missing
    Forbidden,
    /// OIDC callback carried an invalid state or code
    InvalidCallback,
    /// Failed to dial the backend container
    UpstreamConnect,
    /// Backend did not answer within the deadline
    UpstreamTimeout,
    /// Internal gateway error
    Internal,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            GatewayErrorCode::Forbidden => StatusCode::FORBIDDEN,
            GatewayErrorCode::InvalidCallback => StatusCode::BAD_REQUEST,
            GatewayErrorCode::UpstreamConnect => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used as the `error` field of the JSON body
    pub fn label(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "Bad Request",
            GatewayErrorCode::UnknownHost => "Not Found",
            GatewayErrorCode::Forbidden => "Forbidden",
            GatewayErrorCode::InvalidCallback => "Bad Request",
            GatewayErrorCode::UpstreamConnect => "Bad Gateway",
            GatewayErrorCode::UpstreamTimeout => "Gateway Timeout",
            GatewayErrorCode::Internal => "Internal Server Error",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code.label(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","message":"{}"}}"#,
                self.error,
                self.message.replace('"', "\\\"")
            )
        })
    }
}

/// Build a JSON error response for the given error category
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorBody::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_table() {
        assert_eq!(
            GatewayErrorCode::UnknownHost.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayErrorCode::Forbidden.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayErrorCode::UpstreamConnect.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayErrorCode::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayErrorCode::InvalidCallback.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn forbidden_body_shape() {
        let body = ErrorBody::new(
            GatewayErrorCode::Forbidden,
            "You do not have the required roles to access this resource",
        );
        let json = body.to_json();

        assert!(json.contains("\"error\":\"Forbidden\""));
        assert!(json.contains("required roles"));
    }

    #[test]
    fn response_headers_and_status() {
        let response = json_error_response(GatewayErrorCode::UpstreamTimeout, "upstream timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
