use crate::guardrail::GuardrailViolation;
use crate::policy::{ReleaseBlocker, Violation};
use thiserror::Error;

/// Coarse classification callers branch on instead of matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected, user-facing rule failure (unsigned contract, unverified milestone, ...).
    BusinessRule,
    /// Policy boundary: automation restriction, missing human confirmation, dispute freeze.
    Guardrail,
    NotFound,
    Unauthorized,
    /// Lost a race against a concurrent writer or hit a uniqueness constraint.
    Conflict,
    /// External collaborator (payment rail, text generator) failed or timed out.
    Collaborator,
    Infrastructure,
}

/// BuildGate core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("RELEASE_BLOCKED: {reason}")]
    ReleaseBlocked {
        blocker: ReleaseBlocker,
        reason: String,
    },

    #[error("{}: {message}", .violation.code())]
    Guardrail {
        violation: GuardrailViolation,
        message: String,
    },

    #[error("Policy violations: {}", render_violations(.0))]
    Violations(Vec<Violation>),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid {entity} transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Collaborator '{collaborator}' failed: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReleaseBlocked { blocker, .. } => blocker.kind(),
            Self::Guardrail { .. } => ErrorKind::Guardrail,
            Self::Violations(_) | Self::InvalidTransition { .. } => ErrorKind::BusinessRule,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Collaborator { .. } => ErrorKind::Collaborator,
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| format!("{}: {}", violation.kind.code(), violation.message))
        .collect::<Vec<_>>()
        .join("; ")
}
