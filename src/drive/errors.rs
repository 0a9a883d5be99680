//! Drive API Error Types
//!
//! Structured error handling for Google Drive and Sheets API operations.
//! Maps HTTP status codes to specific error variants for health tracking.

/// Drive API error types
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Authentication expired, access token needs refresh")]
    AuthExpired,

    #[error("Rate limited by the Drive API")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl DriveError {
    /// Whether this error points at the connection rather than the request
    pub fn is_network(&self) -> bool {
        matches!(self, DriveError::Network(_) | DriveError::Timeout)
    }

    /// Whether the remote side is pushing back on request volume
    pub fn is_throttled(&self) -> bool {
        matches!(self, DriveError::RateLimited | DriveError::Server(_, _))
    }

    /// Create a DriveError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => DriveError::AuthExpired,
            403 => DriveError::Forbidden(body.to_string()),
            404 => DriveError::NotFound(body.to_string()),
            408 => DriveError::Timeout,
            429 => DriveError::RateLimited,
            500..=599 => DriveError::Server(status, body.to_string()),
            _ => DriveError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for DriveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DriveError::Timeout
        } else if e.is_decode() {
            DriveError::Decode(e.to_string())
        } else if e.is_connect() || e.is_request() {
            DriveError::Network(e.to_string())
        } else {
            DriveError::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(DriveError::from_status(401, ""), DriveError::AuthExpired));
        assert!(matches!(DriveError::from_status(404, "gone"), DriveError::NotFound(b) if b == "gone"));
        assert!(matches!(DriveError::from_status(429, ""), DriveError::RateLimited));
        assert!(matches!(DriveError::from_status(503, "x"), DriveError::Server(503, _)));
        assert!(matches!(DriveError::from_status(418, "teapot"), DriveError::Request(_)));
    }

    #[test]
    fn test_classification() {
        assert!(DriveError::Timeout.is_network());
        assert!(!DriveError::RateLimited.is_network());
        assert!(DriveError::RateLimited.is_throttled());
        assert!(DriveError::Server(500, String::new()).is_throttled());
        assert!(!DriveError::Forbidden(String::new()).is_throttled());
    }
}
