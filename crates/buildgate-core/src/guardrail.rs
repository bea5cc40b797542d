use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Action classes no automated caller may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestrictedAction {
    SubmitPermit,
    ReleaseFunds,
    SignContract,
    ResolveDispute,
}

impl RestrictedAction {
    pub const ALL: [RestrictedAction; 4] = [
        Self::SubmitPermit,
        Self::ReleaseFunds,
        Self::SignContract,
        Self::ResolveDispute,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubmitPermit => "SUBMIT_PERMIT",
            Self::ReleaseFunds => "RELEASE_FUNDS",
            Self::SignContract => "SIGN_CONTRACT",
            Self::ResolveDispute => "RESOLVE_DISPUTE",
        }
    }

    /// Match an action name after trimming and upper-casing it.
    pub fn from_action(action: &str) -> Option<Self> {
        let normalized = action.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|restricted| restricted.as_str() == normalized)
    }
}

/// Guardrail failures. Distinct from business-rule violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardrailViolation {
    AutomationRestricted(RestrictedAction),
    HumanApprovalRequired,
}

impl GuardrailViolation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AutomationRestricted(_) => "AUTOMATION_ACTION_BLOCKED",
            Self::HumanApprovalRequired => "ESCROW_RELEASE_REQUIRES_HUMAN_APPROVAL",
        }
    }
}

/// Deny-list check every automated code path runs before executing an action.
pub fn check_automation_action(action: &str) -> Result<(), CoreError> {
    match RestrictedAction::from_action(action) {
        Some(restricted) => {
            warn!(action = %restricted.as_str(), "automated caller attempted restricted action");
            Err(CoreError::Guardrail {
                violation: GuardrailViolation::AutomationRestricted(restricted),
                message: format!(
                    "{} must be performed by a human",
                    restricted.as_str()
                ),
            })
        }
        None => Ok(()),
    }
}
