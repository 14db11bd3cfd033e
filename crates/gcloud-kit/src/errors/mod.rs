use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GcloudError {
    /// A backend was used without its settings section.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key, client-secret or token file is missing, unreadable or malformed.
    #[error("Credential error: {0}")]
    Credential(String),

    /// The OAuth2 authorization-code exchange failed or was refused.
    #[error("Authorization flow error: {0}")]
    AuthorizationFlow(String),

    #[error("{service} error ({status}): {message}")]
    Remote {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service}: not found: {resource}")]
    NotFound { service: String, resource: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock conflict: {path}")]
    LockConflict { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, GcloudError>;

impl GcloudError {
    /// Build the error for a non-success HTTP response.
    ///
    /// 404 becomes [`GcloudError::NotFound`]; everything else is a
    /// [`GcloudError::Remote`] carrying the Google error message when the body
    /// is the usual `{"error": {"message": ...}}` envelope.
    pub fn from_response(service: &str, resource: &str, status: u16, body: &str) -> Self {
        if status == 404 {
            return GcloudError::NotFound {
                service: service.to_string(),
                resource: resource.to_string(),
            };
        }
        GcloudError::Remote {
            service: service.to_string(),
            status,
            message: remote_message(body),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GcloudError::NotFound { .. })
    }

    /// True for failures reported by (or while reaching) the remote service.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            GcloudError::Remote { .. } | GcloudError::NotFound { .. } | GcloudError::Http(_)
        )
    }
}

/// Extract `error.message` from a Google JSON error body, falling back to the
/// raw body text.
fn remote_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error").and_then(|e| match e {
                serde_json::Value::String(s) => Some(s.clone()),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string),
            })
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_404_maps_to_not_found() {
        let err = GcloudError::from_response("storage", "b/o", 404, "");
        assert!(err.is_not_found());
        assert!(err.is_remote());
        assert_eq!(err.to_string(), "storage: not found: b/o");
    }

    #[test]
    fn test_google_error_envelope_message() {
        let body = r#"{"error":{"code":403,"message":"caller lacks permission","status":"PERMISSION_DENIED"}}"#;
        match GcloudError::from_response("pubsub", "projects/p/topics/t", 403, body) {
            GcloudError::Remote {
                service,
                status,
                message,
            } => {
                assert_eq!(service, "pubsub");
                assert_eq!(status, 403);
                assert_eq!(message, "caller lacks permission");
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_oauth_style_error_string() {
        let body = r#"{"error":"invalid_grant","error_description":"Bad Request"}"#;
        let err = GcloudError::from_response("oauth2", "token", 400, body);
        assert_eq!(err.to_string(), "oauth2 error (400): invalid_grant");
    }

    #[test]
    fn test_plain_text_body_kept() {
        let err = GcloudError::from_response("tasks", "q", 500, "  upstream exploded \n");
        assert_eq!(err.to_string(), "tasks error (500): upstream exploded");
    }

    #[test]
    fn test_local_errors_are_not_remote() {
        assert!(!GcloudError::Config("x".into()).is_remote());
        assert!(!GcloudError::Credential("x".into()).is_remote());
        assert!(!GcloudError::InvalidArgument("x".into()).is_not_found());
    }
}
