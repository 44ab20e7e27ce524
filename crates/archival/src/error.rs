//! Archival error types

use thiserror::Error;
use uuid::Uuid;

use crate::ai::AiError;
use crate::platform::PlatformError;

pub type ArchivalResult<T> = Result<T, ArchivalError>;

#[derive(Debug, Error)]
pub enum ArchivalError {
    #[error("No {provider} integration found for team {team_id}")]
    TenantNotFound { provider: String, team_id: String },

    #[error("Organization {0} has no members to attribute the archive to")]
    NoMembers(Uuid),

    #[error("Chat platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("AI provider error: {0}")]
    Ai(#[from] AiError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid archival job: {0}")]
    InvalidJob(String),
}

impl ArchivalError {
    /// Whether the archival job should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchivalError::TenantNotFound { .. }
            | ArchivalError::NoMembers(_)
            | ArchivalError::InvalidJob(_) => false,
            ArchivalError::Platform(e) => e.is_retryable(),
            ArchivalError::Ai(e) => e.is_retryable(),
            ArchivalError::Database(_) => true,
        }
    }
}

impl From<sqlx::Error> for ArchivalError {
    fn from(e: sqlx::Error) -> Self {
        ArchivalError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_and_membership_failures_are_permanent() {
        let err = ArchivalError::TenantNotFound {
            provider: "slack".into(),
            team_id: "T1".into(),
        };
        assert!(!err.is_retryable());
        assert!(!ArchivalError::NoMembers(Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn classification_follows_the_source_error() {
        assert!(ArchivalError::Ai(AiError::Timeout).is_retryable());
        assert!(!ArchivalError::Ai(AiError::Http {
            status: 400,
            body: "bad input".into()
        })
        .is_retryable());
        assert!(ArchivalError::Platform(PlatformError::RateLimited).is_retryable());
        assert!(!ArchivalError::Platform(PlatformError::Unauthorized("invalid_auth".into()))
            .is_retryable());
        assert!(ArchivalError::Database("connection reset".into()).is_retryable());
    }
}
