use crate::error::{CoreError, ErrorKind};
use crate::repository::ProjectRepository;
use crate::types::{
    CloseoutStatus, EscrowAgreement, InviteStatus, Milestone, ProjectState, ProjectStatus,
    TransactionStatus, TransactionType, VerificationStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Rule identifiers surfaced to callers in `[{type, message}]` violation lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    ContractNotSigned,
    DesignNotApproved,
    ReadinessIncomplete,
    ProjectNotCompleted,
    CloseoutIncomplete,
    FinalPaymentNotReleased,
    InviteNotPending,
    InviteExpired,
}

impl ViolationKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::ContractNotSigned => "CONTRACT_NOT_SIGNED",
            Self::DesignNotApproved => "DESIGN_NOT_APPROVED",
            Self::ReadinessIncomplete => "READINESS_INCOMPLETE",
            Self::ProjectNotCompleted => "PROJECT_NOT_COMPLETED",
            Self::CloseoutIncomplete => "CLOSEOUT_INCOMPLETE",
            Self::FinalPaymentNotReleased => "FINAL_PAYMENT_NOT_RELEASED",
            Self::InviteNotPending => "INVITE_NOT_PENDING",
            Self::InviteExpired => "INVITE_EXPIRED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// First failing condition of the escrow release gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseBlocker {
    EscrowNotFound,
    DisputeFreeze,
    MilestoneNotFound,
    VerificationIncomplete,
    PayeeAccountMissing,
    MilestoneAlreadyReleased,
}

impl ReleaseBlocker {
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::EscrowNotFound | Self::MilestoneNotFound => ErrorKind::NotFound,
            Self::DisputeFreeze => ErrorKind::Guardrail,
            Self::VerificationIncomplete
            | Self::PayeeAccountMissing
            | Self::MilestoneAlreadyReleased => ErrorKind::BusinessRule,
        }
    }
}

/// Escrow gate result. `reason` and `blocker` are set exactly when `allowed` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker: Option<ReleaseBlocker>,
}

impl ReleaseDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            blocker: None,
        }
    }

    pub fn block(blocker: ReleaseBlocker, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            blocker: Some(blocker),
        }
    }

    /// Convert a blocked decision into the `RELEASE_BLOCKED` error.
    pub fn into_result(self) -> Result<(), CoreError> {
        match (self.allowed, self.blocker) {
            (true, _) => Ok(()),
            (false, blocker) => Err(CoreError::ReleaseBlocked {
                blocker: blocker.unwrap_or(ReleaseBlocker::VerificationIncomplete),
                reason: self.reason.unwrap_or_default(),
            }),
        }
    }
}

/// Permit submission rules. Accumulates every violation in a fixed order.
pub fn evaluate_permit_submission(state: &ProjectState) -> Vec<Violation> {
    let mut violations = Vec::new();

    if !state.has_signed_contract() {
        violations.push(Violation::new(
            ViolationKind::ContractNotSigned,
            "Project requires at least one fully signed contract",
        ));
    }

    if !state.has_permit_approved_design() {
        violations.push(Violation::new(
            ViolationKind::DesignNotApproved,
            "Project requires a design version approved for permit",
        ));
    }

    let incomplete = state.incomplete_required_items();
    if !incomplete.is_empty() {
        let titles = incomplete
            .iter()
            .map(|item| item.title.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        violations.push(Violation::new(
            ViolationKind::ReadinessIncomplete,
            format!("Required readiness items incomplete: {titles}"),
        ));
    }

    violations
}

/// Review submission rules. Accumulates every violation in a fixed order.
pub fn evaluate_review_submission(state: &ProjectState) -> Vec<Violation> {
    let mut violations = Vec::new();

    if state.project.status != ProjectStatus::Completed {
        violations.push(Violation::new(
            ViolationKind::ProjectNotCompleted,
            format!(
                "Project must be COMPLETED before review (currently {})",
                state.project.status
            ),
        ));
    }

    match &state.closeout {
        None => violations.push(Violation::new(
            ViolationKind::CloseoutIncomplete,
            "Project closeout has not been started",
        )),
        Some(closeout) if closeout.status != CloseoutStatus::Completed => {
            violations.push(Violation::new(
                ViolationKind::CloseoutIncomplete,
                format!("Project closeout is {}", closeout.status),
            ))
        }
        Some(_) => {}
    }

    let final_payment_released = state
        .closeout
        .as_ref()
        .map(|closeout| closeout.final_payment_released)
        .unwrap_or(false);
    if !final_payment_released {
        violations.push(Violation::new(
            ViolationKind::FinalPaymentNotReleased,
            "Final escrow payment has not been released",
        ));
    }

    violations
}

/// Escrow release rules, evaluated in order and short-circuiting on the first failure.
///
/// A milestone attached to a different escrow is reported as not found for this one.
pub fn evaluate_escrow_release(
    escrow_id: &str,
    milestone_id: &str,
    escrow: Option<&EscrowAgreement>,
    dispute_active: bool,
    milestone: Option<&Milestone>,
    already_released: bool,
) -> ReleaseDecision {
    if escrow.is_none() {
        return ReleaseDecision::block(
            ReleaseBlocker::EscrowNotFound,
            format!("escrow agreement {escrow_id} not found"),
        );
    }

    if dispute_active {
        return ReleaseDecision::block(
            ReleaseBlocker::DisputeFreeze,
            "escrow is frozen while the project has an active dispute",
        );
    }

    let milestone = match milestone.filter(|milestone| milestone.escrow_id == escrow_id) {
        Some(milestone) => milestone,
        None => {
            return ReleaseDecision::block(
                ReleaseBlocker::MilestoneNotFound,
                format!("milestone {milestone_id} not found for escrow {escrow_id}"),
            )
        }
    };

    if already_released {
        return ReleaseDecision::block(
            ReleaseBlocker::MilestoneAlreadyReleased,
            format!("milestone {} has already been released", milestone.id),
        );
    }

    let unverified = milestone
        .verification_items
        .iter()
        .filter(|item| item.status != VerificationStatus::Verified)
        .count();
    if unverified > 0 {
        return ReleaseDecision::block(
            ReleaseBlocker::VerificationIncomplete,
            format!(
                "{unverified} verification item(s) on milestone {} are not verified",
                milestone.id
            ),
        );
    }

    ReleaseDecision::allow()
}

/// Stateless gate front-end that reads current state through the repository.
///
/// Gates always read the underlying entities, never a cached feature snapshot.
#[derive(Clone)]
pub struct PolicyGate {
    repo: Arc<dyn ProjectRepository>,
}

impl PolicyGate {
    pub fn new(repo: Arc<dyn ProjectRepository>) -> Self {
        Self { repo }
    }

    pub async fn check_permit_submission(
        &self,
        project_id: &str,
    ) -> Result<Vec<Violation>, CoreError> {
        let state = self.repo.project_state(project_id).await?;
        let violations = evaluate_permit_submission(&state);
        debug!(
            project_id = %project_id,
            violations = violations.len(),
            "permit submission gate evaluated"
        );
        Ok(violations)
    }

    pub async fn check_review_submission(
        &self,
        project_id: &str,
    ) -> Result<Vec<Violation>, CoreError> {
        let state = self.repo.project_state(project_id).await?;
        let violations = evaluate_review_submission(&state);
        debug!(
            project_id = %project_id,
            violations = violations.len(),
            "review submission gate evaluated"
        );
        Ok(violations)
    }

    pub async fn check_escrow_release(
        &self,
        escrow_id: &str,
        milestone_id: &str,
    ) -> Result<ReleaseDecision, CoreError> {
        let escrow = self.repo.escrow(escrow_id).await?;
        let dispute_active = match &escrow {
            Some(escrow) => self.repo.has_active_dispute(&escrow.project_id).await?,
            None => false,
        };
        let milestone = if escrow.is_some() && !dispute_active {
            self.repo.milestone(milestone_id).await?
        } else {
            None
        };
        let already_released = match &milestone {
            Some(_) => self
                .repo
                .transactions_for_milestone(milestone_id)
                .await?
                .iter()
                .any(|transaction| {
                    transaction.kind == TransactionType::Release
                        && transaction.status == TransactionStatus::Completed
                }),
            None => false,
        };

        let decision = evaluate_escrow_release(
            escrow_id,
            milestone_id,
            escrow.as_ref(),
            dispute_active,
            milestone.as_ref(),
            already_released,
        );
        debug!(
            escrow_id = %escrow_id,
            milestone_id = %milestone_id,
            allowed = decision.allowed,
            "escrow release gate evaluated"
        );
        Ok(decision)
    }

    /// Self-registration check for an invited contractor.
    ///
    /// A missing token is an authorization failure and an unknown token is not-found.
    /// A PENDING invite past its expiry is flipped to EXPIRED with a conditional write,
    /// so concurrent or repeated checks perform the write at most once.
    pub async fn check_contractor_registration(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Violation>, CoreError> {
        let token = match token.map(str::trim).filter(|token| !token.is_empty()) {
            Some(token) => token,
            None => {
                return Err(CoreError::Unauthorized(
                    "registration requires an invite token".to_string(),
                ))
            }
        };

        let invite = self
            .repo
            .invite_by_token(token)
            .await?
            .ok_or_else(|| CoreError::not_found("invite", "<token>"))?;

        match invite.status {
            InviteStatus::Pending if invite.expires_at <= now => {
                let flipped = self.repo.expire_invite(&invite.id).await?;
                if flipped {
                    info!(
                        invite_id = %invite.id,
                        project_id = %invite.project_id,
                        "expired subcontractor invite"
                    );
                }
                Ok(vec![Violation::new(
                    ViolationKind::InviteExpired,
                    format!("Invite expired at {}", invite.expires_at.to_rfc3339()),
                )])
            }
            InviteStatus::Pending => Ok(Vec::new()),
            InviteStatus::Expired => Ok(vec![Violation::new(
                ViolationKind::InviteExpired,
                format!("Invite expired at {}", invite.expires_at.to_rfc3339()),
            )]),
            InviteStatus::Accepted => Ok(vec![Violation::new(
                ViolationKind::InviteNotPending,
                "Invite has already been used",
            )]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ContractAgreement, ContractStatus, DesignStatus, DesignVersion, Project,
        ProjectCloseout, ReadinessChecklist, ReadinessItem, ReadinessStatus, VerificationItem,
        MilestoneStatus,
    };

    fn state() -> ProjectState {
        ProjectState::new(Project {
            id: "p1".to_string(),
            owner_id: "owner".to_string(),
            name: "Kitchen".to_string(),
            status: ProjectStatus::Contracting,
            complexity: None,
            category: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    fn milestone(escrow_id: &str, statuses: &[VerificationStatus]) -> Milestone {
        Milestone {
            id: "m1".to_string(),
            project_id: "p1".to_string(),
            escrow_id: escrow_id.to_string(),
            title: "Foundation".to_string(),
            amount_cents: 250_000,
            status: MilestoneStatus::Submitted,
            due_date: None,
            verification_items: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| VerificationItem {
                    id: format!("v{i}"),
                    title: format!("check {i}"),
                    status: *status,
                    receipts: Vec::new(),
                })
                .collect(),
        }
    }

    fn escrow() -> EscrowAgreement {
        EscrowAgreement {
            id: "e1".to_string(),
            project_id: "p1".to_string(),
            status: crate::types::EscrowStatus::Funded,
            funded_amount_cents: 1_000_000,
            payee_account: Some("acct_1".to_string()),
        }
    }

    #[test]
    fn empty_project_accumulates_all_permit_violations() {
        let mut state = state();
        state.readiness = Some(ReadinessChecklist {
            id: "c1".to_string(),
            project_id: "p1".to_string(),
            items: vec![ReadinessItem {
                id: "r1".to_string(),
                title: "Soil report".to_string(),
                required: true,
                status: ReadinessStatus::Pending,
            }],
        });

        let kinds: Vec<_> = evaluate_permit_submission(&state)
            .into_iter()
            .map(|violation| violation.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::ContractNotSigned,
                ViolationKind::DesignNotApproved,
                ViolationKind::ReadinessIncomplete,
            ]
        );
    }

    #[test]
    fn partially_signed_contract_does_not_count() {
        let mut state = state();
        state.contracts.push(ContractAgreement {
            id: "k1".to_string(),
            project_id: "p1".to_string(),
            title: "Main".to_string(),
            status: ContractStatus::PartiallySigned,
        });
        state.designs.push(DesignVersion {
            id: "d1".to_string(),
            project_id: "p1".to_string(),
            version: 1,
            status: DesignStatus::ApprovedForPermit,
        });

        let violations = evaluate_permit_submission(&state);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::ContractNotSigned);
    }

    #[test]
    fn review_requires_completed_closeout_and_final_payment() {
        let mut state = state();
        state.project.status = ProjectStatus::Completed;
        state.closeout = Some(ProjectCloseout {
            project_id: "p1".to_string(),
            status: CloseoutStatus::Completed,
            final_payment_released: false,
        });

        let violations = evaluate_review_submission(&state);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::FinalPaymentNotReleased);

        state.closeout = None;
        state.project.status = ProjectStatus::Closeout;
        let codes: Vec<_> = evaluate_review_submission(&state)
            .into_iter()
            .map(|violation| violation.kind.code())
            .collect();
        assert_eq!(
            codes,
            vec![
                "PROJECT_NOT_COMPLETED",
                "CLOSEOUT_INCOMPLETE",
                "FINAL_PAYMENT_NOT_RELEASED"
            ]
        );
    }

    #[test]
    fn escrow_gate_short_circuits_in_order() {
        let milestone = milestone("e1", &[VerificationStatus::Pending]);

        let decision = evaluate_escrow_release("e1", "m1", None, true, Some(&milestone), false);
        assert_eq!(decision.blocker, Some(ReleaseBlocker::EscrowNotFound));

        let escrow = escrow();
        let decision = evaluate_escrow_release(
            "e1",
            "m1",
            Some(&escrow),
            true,
            Some(&milestone),
            false,
        );
        assert_eq!(decision.blocker, Some(ReleaseBlocker::DisputeFreeze));
        assert!(decision.reason.as_deref().unwrap_or("").contains("dispute"));

        let decision = evaluate_escrow_release("e1", "m1", Some(&escrow), false, None, false);
        assert_eq!(decision.blocker, Some(ReleaseBlocker::MilestoneNotFound));

        let decision = evaluate_escrow_release(
            "e1",
            "m1",
            Some(&escrow),
            false,
            Some(&milestone),
            false,
        );
        assert_eq!(decision.blocker, Some(ReleaseBlocker::VerificationIncomplete));
    }

    #[test]
    fn milestone_from_another_escrow_is_not_found() {
        let escrow = escrow();
        let foreign = milestone("e2", &[VerificationStatus::Verified]);
        let decision = evaluate_escrow_release(
            "e1",
            "m1",
            Some(&escrow),
            false,
            Some(&foreign),
            false,
        );
        assert!(!decision.allowed);
        assert_eq!(decision.blocker, Some(ReleaseBlocker::MilestoneNotFound));
    }

    #[test]
    fn verified_milestone_is_released() {
        let escrow = escrow();
        let milestone = milestone(
            "e1",
            &[VerificationStatus::Verified, VerificationStatus::Verified],
        );
        let decision = evaluate_escrow_release(
            "e1",
            "m1",
            Some(&escrow),
            false,
            Some(&milestone),
            false,
        );
        assert_eq!(decision, ReleaseDecision::allow());
        assert!(decision.into_result().is_ok());
    }

    #[test]
    fn released_milestone_is_not_released_again() {
        let escrow = escrow();
        let milestone = milestone("e1", &[VerificationStatus::Verified]);
        let decision = evaluate_escrow_release(
            "e1",
            "m1",
            Some(&escrow),
            false,
            Some(&milestone),
            true,
        );
        assert_eq!(decision.blocker, Some(ReleaseBlocker::MilestoneAlreadyReleased));
        let err = decision.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
    }

    #[test]
    fn violation_serializes_as_type_and_message() {
        let violation = Violation::new(ViolationKind::InviteExpired, "gone");
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "INVITE_EXPIRED", "message": "gone"})
        );
    }
}
