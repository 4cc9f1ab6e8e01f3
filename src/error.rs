use crate::auth::AuthError;
use std::path::PathBuf;

/// Errors produced by calls against the APS REST endpoints.
#[derive(Debug)]
pub enum ApiError {
    /// No usable bearer token.
    Auth(AuthError),
    /// The request never produced a response (connect, timeout, TLS).
    Transport { url: String, source: reqwest::Error },
    /// The service answered with a non-success status.
    Http { status: u16, url: String, body: String },
    /// The response body was not the JSON we expected.
    Decode {
        url: String,
        body: String,
        source: serde_json::Error,
    },
    /// Reading or writing a local file failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The request or response violated an SDK-level contract.
    Invalid(String),
}

impl ApiError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// HTTP status, when the service produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Auth(e) => write!(f, "authorization unavailable: {e}"),
            ApiError::Transport { url, source } => {
                write!(f, "request to {url} failed: {source}")
            }
            ApiError::Http { status, url, body } => {
                if body.is_empty() {
                    write!(f, "HTTP {status} from {url}")
                } else {
                    write!(f, "HTTP {status} from {url}: {body}")
                }
            }
            ApiError::Decode { url, source, .. } => {
                write!(f, "unexpected response from {url}: {source}")
            }
            ApiError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            ApiError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Auth(e) => Some(e),
            ApiError::Transport { source, .. } => Some(source),
            ApiError::Decode { source, .. } => Some(source),
            ApiError::Io { source, .. } => Some(source),
            ApiError::Http { .. } | ApiError::Invalid(_) => None,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ApiError {
        ApiError::Http {
            status,
            url: "https://example.test/x".to_string(),
            body: String::new(),
        }
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(http(500).is_transient());
        assert!(http(503).is_transient());
        assert!(http(429).is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        assert!(!http(400).is_transient());
        assert!(!http(404).is_transient());
        assert!(!ApiError::Auth(AuthError::Missing).is_transient());
        assert!(!ApiError::Invalid("nope".into()).is_transient());
    }

    #[test]
    fn test_http_display_includes_body() {
        let err = ApiError::Http {
            status: 400,
            url: "https://example.test/workitems".to_string(),
            body: r#"{"diagnostic":"activity not found"}"#.to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP 400"));
        assert!(msg.contains("activity not found"));
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn test_io_display_includes_path() {
        let err = ApiError::Io {
            path: PathBuf::from("/tmp/missing.zip"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("/tmp/missing.zip"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
