use reqwest::StatusCode;
use serde::Deserialize;
use sqlx::Error as SqlxError;
use thiserror::Error as ThisError;

use crate::permissions::Role;

/// Every failure the sync layer can surface. `Display` is the user-facing message.
#[derive(Debug, ThisError)]
pub enum VaultError {
    #[error("{0} is required")]
    EmptyField(&'static str),

    #[error("members can only be invited as contributor or viewer, not {0}")]
    InvalidInviteRole(Role),

    #[error("you are already a member of this vault")]
    InviteSelf,

    #[error("User not found. They must sign up first. ({0})")]
    InviteeNotFound(String),

    #[error("a {role} cannot {action}")]
    Forbidden { role: Role, action: &'static str },

    #[error("not signed in")]
    Unauthenticated,

    #[error("no vault selected")]
    MissingVaultId,

    #[error("permission denied: {0}")]
    PolicyDenied(String),

    #[error("{0}")]
    Constraint(String),

    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: &'static str, column: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] SqlxError),

    #[error("{message}")]
    Upstream { status: StatusCode, message: String },

    #[error("Ractor error: {0}")]
    RactorError(String),
}

/// Errors worth another attempt after a short backoff.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for VaultError {
    fn is_retryable(&self) -> bool {
        match self {
            VaultError::Reqwest(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            VaultError::Upstream { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            VaultError::Database(e) => {
                matches!(e, SqlxError::PoolTimedOut | SqlxError::Io(_) | SqlxError::PoolClosed)
            }
            _ => false,
        }
    }
}

impl VaultError {
    /// Build an error from a non-2xx REST response body.
    pub(crate) fn upstream(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<RestErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| match status.canonical_reason() {
                Some(reason) => format!("{} {}", status.as_u16(), reason),
                None => format!("upstream returned {}", status.as_u16()),
            });
        VaultError::Upstream { status, message }
    }
}

/// PostgREST-style error payload.
#[derive(Deserialize, Debug)]
struct RestErrorBody {
    message: Option<String>,
    #[allow(dead_code)]
    code: Option<String>,
    #[allow(dead_code)]
    details: Option<String>,
    #[allow(dead_code)]
    hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_prefers_body_message() {
        let err = VaultError::upstream(
            StatusCode::CONFLICT,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint","details":null,"hint":null}"#,
        );
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn upstream_falls_back_to_status_reason() {
        let err = VaultError::upstream(StatusCode::BAD_GATEWAY, "<html>oops</html>");
        assert_eq!(err.to_string(), "502 Bad Gateway");
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_errors_read_as_messages() {
        assert_eq!(VaultError::EmptyField("title").to_string(), "title is required");
        let forbidden = VaultError::Forbidden {
            role: Role::Viewer,
            action: "add sources",
        };
        assert_eq!(forbidden.to_string(), "a viewer cannot add sources");
    }
}
