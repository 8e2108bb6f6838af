use thiserror::Error;

/// Type alias for Result with CategorizerError
pub type Result<T> = std::result::Result<T, CategorizerError>;

/// Error types for the categorization pipeline
#[derive(Error, Debug)]
pub enum CategorizerError {
    /// Bad input to a pipeline entry point, rejected before any provider call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Authentication failed or credentials are missing
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Forbidden (403) without a rate-limit reason
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Provider returned a 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Message payload could not be interpreted
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Label-related errors
    #[error("Label error: {0}")]
    LabelError(String),

    /// Classification provider returned something unusable
    #[error("Classification error: {0}")]
    ClassificationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Run was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Any other provider API error
    #[error("API error: {0}")]
    ApiError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Coarse error taxonomy used for retry and propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Auth,
    RateLimited,
    Transient,
    Permanent,
}

impl CategorizerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CategorizerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CategorizerError::AuthError(_) | CategorizerError::Forbidden(_) => ErrorKind::Auth,
            CategorizerError::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            CategorizerError::NetworkError(_) | CategorizerError::ServerError { .. } => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Permanent,
        }
    }

    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::RateLimited | ErrorKind::Transient)
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Server-suggested wait, if any
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            CategorizerError::RateLimitExceeded { retry_after } => {
                Some(std::time::Duration::from_secs(*retry_after))
            }
            _ => None,
        }
    }

    /// Map an HTTP status plus Google error reason onto an error variant
    fn from_status(status: u16, message: String, reason: Option<&str>, retry_after: u64) -> Self {
        let rate_limited = reason
            .map(|r| r.contains("RateLimitExceeded") || r.contains("rateLimitExceeded"))
            .unwrap_or(false);

        match status {
            429 => CategorizerError::RateLimitExceeded { retry_after },
            403 if rate_limited => CategorizerError::RateLimitExceeded { retry_after },
            400 => CategorizerError::BadRequest(message),
            401 => CategorizerError::AuthError(message),
            403 => CategorizerError::Forbidden(message),
            404 => CategorizerError::NotFound(message),
            409 => CategorizerError::Conflict(message),
            500..=599 => CategorizerError::ServerError { status, message },
            _ => CategorizerError::ApiError(format!("HTTP {}: {}", status, message)),
        }
    }
}

const DEFAULT_RETRY_AFTER: u64 = 5;

/// Parse the Retry-After header from an HTTP response
///
/// Accepts delay-seconds (`"120"`) or an HTTP date. Missing, invalid or past
/// values fall back to 5 seconds.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    let Some(value) = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|at| at.duration_since(std::time::SystemTime::now()).ok())
        .map(|d| d.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Pull status, message and first reason out of a Google JSON error body
///
/// `{"error": {"code": 403, "message": "...", "errors": [{"reason": "..."}]}}`
fn parse_google_error_body(value: &serde_json::Value) -> Option<(u16, String, Option<String>)> {
    let error = value.get("error")?;
    let code = error.get("code")?.as_u64()? as u16;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("no message")
        .to_string();
    let reason = error
        .get("errors")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("reason"))
        .and_then(|r| r.as_str())
        .map(str::to_string);
    Some((code, message, reason))
}

impl From<google_gmail1::Error> for CategorizerError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let message = status.canonical_reason().unwrap_or("Unknown").to_string();
                CategorizerError::from_status(
                    status.as_u16(),
                    message,
                    None,
                    parse_retry_after_header(response),
                )
            }
            // The client library hands back parsed JSON error bodies here
            google_gmail1::Error::BadRequest(ref value) => match parse_google_error_body(value) {
                Some((code, message, reason)) => CategorizerError::from_status(
                    code,
                    message,
                    reason.as_deref(),
                    DEFAULT_RETRY_AFTER,
                ),
                None => CategorizerError::BadRequest(value.to_string()),
            },
            google_gmail1::Error::MissingToken(ref err) => {
                CategorizerError::AuthError(format!("No access token: {}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                CategorizerError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => CategorizerError::NetworkError(err.to_string()),
            google_gmail1::Error::Cancelled => {
                CategorizerError::Cancelled("request cancelled by delegate".to_string())
            }
            _ => CategorizerError::ApiError(error.to_string()),
        }
    }
}

impl From<async_openai::error::OpenAIError> for CategorizerError {
    fn from(error: async_openai::error::OpenAIError) -> Self {
        use async_openai::error::OpenAIError;

        match error {
            OpenAIError::Reqwest(err) => {
                if err.status().map(|s| s.is_server_error()).unwrap_or(true) {
                    CategorizerError::NetworkError(format!("OpenAI request failed: {}", err))
                } else {
                    CategorizerError::ApiError(format!("OpenAI request failed: {}", err))
                }
            }
            OpenAIError::ApiError(api) => {
                let detail = format!("{:?}", api).to_lowercase();
                if detail.contains("rate_limit") {
                    CategorizerError::RateLimitExceeded {
                        retry_after: DEFAULT_RETRY_AFTER,
                    }
                } else if detail.contains("invalid_api_key") || detail.contains("incorrect api key") {
                    CategorizerError::AuthError(api.message)
                } else if detail.contains("server_error") || detail.contains("overloaded") {
                    CategorizerError::ServerError {
                        status: 500,
                        message: api.message,
                    }
                } else {
                    CategorizerError::ClassificationError(api.message)
                }
            }
            OpenAIError::JSONDeserialize(err) => CategorizerError::ClassificationError(format!(
                "Could not decode completion response: {}",
                err
            )),
            OpenAIError::InvalidArgument(msg) => CategorizerError::BadRequest(msg),
            other => CategorizerError::ClassificationError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rate_limit = CategorizerError::RateLimitExceeded { retry_after: 5 };
        assert!(rate_limit.is_transient());
        assert_eq!(rate_limit.kind(), ErrorKind::RateLimited);

        let server_error = CategorizerError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(server_error.is_transient());

        let network_error = CategorizerError::NetworkError("Connection timeout".to_string());
        assert!(network_error.is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        let bad_request = CategorizerError::BadRequest("Invalid query".to_string());
        assert!(bad_request.is_permanent());
        assert_eq!(bad_request.kind(), ErrorKind::Permanent);

        let conflict = CategorizerError::Conflict("Label name exists".to_string());
        assert_eq!(conflict.kind(), ErrorKind::Permanent);

        let auth = CategorizerError::AuthError("expired".to_string());
        assert!(auth.is_permanent());
        assert_eq!(auth.kind(), ErrorKind::Auth);

        let invalid = CategorizerError::InvalidArgument("max_messages".to_string());
        assert_eq!(invalid.kind(), ErrorKind::InvalidArgument);
        assert!(!invalid.is_transient());
    }

    #[test]
    fn test_status_mapping() {
        let e = CategorizerError::from_status(429, "Too Many".into(), None, 7);
        assert_eq!(e.retry_after(), Some(std::time::Duration::from_secs(7)));

        let e = CategorizerError::from_status(403, "quota".into(), Some("userRateLimitExceeded"), 5);
        assert!(matches!(e, CategorizerError::RateLimitExceeded { .. }));

        let e = CategorizerError::from_status(403, "scope".into(), Some("insufficientPermissions"), 5);
        assert!(matches!(e, CategorizerError::Forbidden(_)));

        let e = CategorizerError::from_status(401, "expired".into(), None, 5);
        assert!(matches!(e, CategorizerError::AuthError(_)));

        let e = CategorizerError::from_status(409, "exists".into(), None, 5);
        assert!(matches!(e, CategorizerError::Conflict(_)));

        let e = CategorizerError::from_status(502, "gateway".into(), None, 5);
        assert!(e.is_transient());

        let e = CategorizerError::from_status(418, "teapot".into(), None, 5);
        assert!(matches!(e, CategorizerError::ApiError(_)));
    }

    #[test]
    fn test_google_error_body_is_classified() {
        let body = serde_json::json!({
            "error": {
                "code": 409,
                "message": "Label name exists or conflicts",
                "errors": [{"reason": "conflict"}]
            }
        });
        let err = CategorizerError::from(google_gmail1::Error::BadRequest(body));
        assert!(matches!(err, CategorizerError::Conflict(ref m) if m.contains("exists")));

        let body = serde_json::json!({"unexpected": true});
        let err = CategorizerError::from(google_gmail1::Error::BadRequest(body));
        assert!(matches!(err, CategorizerError::BadRequest(_)));
    }

    #[test]
    fn test_error_display() {
        let error = CategorizerError::RateLimitExceeded { retry_after: 10 };
        let display = format!("{}", error);
        assert!(display.contains("Rate limit exceeded"));
        assert!(display.contains("10 seconds"));

        let auth_error = CategorizerError::AuthError("Invalid token".to_string());
        assert!(auth_error.to_string().contains("Authentication failed"));
    }

    #[test]
    fn test_parse_retry_after_header_integer() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response
            .headers_mut()
            .insert("retry-after", hyper::header::HeaderValue::from_static("120"));

        assert_eq!(parse_retry_after_header(&response), 120);
    }

    #[test]
    fn test_parse_retry_after_header_missing_or_invalid() {
        let response = hyper::Response::builder().status(429).body(()).unwrap();
        assert_eq!(parse_retry_after_header(&response), DEFAULT_RETRY_AFTER);

        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response
            .headers_mut()
            .insert("retry-after", hyper::header::HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after_header(&response), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_parse_retry_after_header_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let future_time = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&httpdate::fmt_http_date(future_time)).unwrap(),
        );

        let retry_after = parse_retry_after_header(&response);
        assert!((58..=61).contains(&retry_after), "Expected ~60, got {}", retry_after);
    }

    #[test]
    fn test_parse_retry_after_header_past_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let past_time = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&httpdate::fmt_http_date(past_time)).unwrap(),
        );

        assert_eq!(parse_retry_after_header(&response), DEFAULT_RETRY_AFTER);
    }
}
