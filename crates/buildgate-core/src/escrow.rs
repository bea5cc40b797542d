use crate::error::CoreError;
use crate::guardrail::GuardrailViolation;
use crate::payment::PaymentRail;
use crate::policy::{PolicyGate, ReleaseBlocker};
use crate::repository::ProjectRepository;
use crate::sinks::{AuditRecord, AuditTrail, Notifier};
use crate::types::{
    new_id, EscrowTransaction, EventType, ProjectEvent, TransactionStatus, TransactionType,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TRANSACTION: &str = "escrow_transaction";

/// Human approval of a release. `confirmed_by_human` must be explicitly `true`;
/// an absent field deserializes to `false` and is refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub transaction_id: String,
    pub approved_by: String,
    #[serde(default)]
    pub confirmed_by_human: bool,
}

/// Release lifecycle: PENDING -> APPROVED -> COMPLETED, with REJECTED reachable from
/// PENDING and APPROVED. Every persisted step is a single repository write.
#[derive(Clone)]
pub struct EscrowReleaseMachine {
    repo: Arc<dyn ProjectRepository>,
    gate: PolicyGate,
    rail: Arc<dyn PaymentRail>,
    audit: AuditTrail,
    notifier: Notifier,
    payment_timeout: Duration,
}

impl EscrowReleaseMachine {
    pub fn new(
        repo: Arc<dyn ProjectRepository>,
        rail: Arc<dyn PaymentRail>,
        audit: AuditTrail,
        notifier: Notifier,
        payment_timeout: Duration,
    ) -> Self {
        Self {
            gate: PolicyGate::new(repo.clone()),
            repo,
            rail,
            audit,
            notifier,
            payment_timeout,
        }
    }

    /// Open a PENDING release for a milestone after the escrow gate passes.
    pub async fn request_release(
        &self,
        escrow_id: &str,
        milestone_id: &str,
        requested_by: &str,
    ) -> Result<EscrowTransaction, CoreError> {
        let decision = self.gate.check_escrow_release(escrow_id, milestone_id).await?;
        if !decision.allowed {
            warn!(
                escrow_id = %escrow_id,
                milestone_id = %milestone_id,
                reason = decision.reason.as_deref().unwrap_or(""),
                "escrow release blocked"
            );
            decision.into_result()?;
        }

        let escrow = self
            .repo
            .escrow(escrow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("escrow", escrow_id))?;
        let milestone = self
            .repo
            .milestone(milestone_id)
            .await?
            .ok_or_else(|| CoreError::not_found("milestone", milestone_id))?;

        let now = Utc::now();
        let transaction = EscrowTransaction {
            id: new_id(),
            escrow_id: escrow.id.clone(),
            milestone_id: Some(milestone.id.clone()),
            kind: TransactionType::Release,
            status: TransactionStatus::Pending,
            amount_cents: milestone.amount_cents,
            requested_by: requested_by.to_string(),
            approved_by: None,
            approved_at: None,
            completed_at: None,
            rejected_by: None,
            rejection_reason: None,
            external_transfer_id: None,
            version: 0,
            created_at: now,
        };
        let event = ProjectEvent::new(
            escrow.project_id.clone(),
            EventType::EscrowReleaseRequested,
            json!({
                "transaction_id": transaction.id,
                "escrow_id": escrow.id,
                "milestone_id": milestone.id,
                "amount_cents": transaction.amount_cents,
            }),
        )
        .with_actor(requested_by);

        self.repo.create_release(&transaction, &event).await?;

        info!(
            transaction_id = %transaction.id,
            escrow_id = %escrow.id,
            milestone_id = %milestone.id,
            amount_cents = transaction.amount_cents,
            "escrow release requested"
        );

        self.audit
            .emit(
                AuditRecord::new("ESCROW_RELEASE_REQUESTED", TRANSACTION)
                    .by(requested_by)
                    .on(&transaction.id)
                    .with_change(None, serde_json::to_value(&transaction).ok())
                    .with_metadata(json!({ "milestone_id": milestone.id })),
            )
            .await;

        if let Some(project) = self.repo.project(&escrow.project_id).await? {
            self.notifier
                .send(
                    &project.owner_id,
                    "ESCROW_RELEASE_REQUESTED",
                    "Escrow release requested",
                    format!(
                        "A release of {} cents was requested for milestone \"{}\".",
                        transaction.amount_cents, milestone.title
                    ),
                )
                .await;
        }

        Ok(transaction)
    }

    /// Approve a release and settle it through the payment rail.
    ///
    /// The transaction is claimed with a compare-and-swap before any money moves, so two
    /// concurrent approvals cannot both reach the rail. A failed or timed-out payment
    /// leaves the transaction APPROVED for a later human retry.
    pub async fn approve_release(
        &self,
        request: ApprovalRequest,
    ) -> Result<EscrowTransaction, CoreError> {
        if !request.confirmed_by_human {
            warn!(
                transaction_id = %request.transaction_id,
                approved_by = %request.approved_by,
                "release approval refused without human confirmation"
            );
            return Err(CoreError::Guardrail {
                violation: GuardrailViolation::HumanApprovalRequired,
                message: "escrow releases must be explicitly confirmed by a human approver"
                    .to_string(),
            });
        }

        let transaction = self.load_release(&request.transaction_id).await?;
        if !transaction
            .status
            .can_transition_to(TransactionStatus::Approved)
        {
            return Err(CoreError::invalid_transition(
                TRANSACTION,
                &transaction.id,
                transaction.status,
                TransactionStatus::Approved,
            ));
        }
        ensure_no_payment_in_flight(&transaction)?;

        let escrow = self
            .repo
            .escrow(&transaction.escrow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("escrow", &transaction.escrow_id))?;
        if self.repo.has_active_dispute(&escrow.project_id).await? {
            return Err(CoreError::ReleaseBlocked {
                blocker: ReleaseBlocker::DisputeFreeze,
                reason: "escrow is frozen while the project has an active dispute".to_string(),
            });
        }
        let payee = escrow
            .payee_account
            .clone()
            .filter(|account| !account.trim().is_empty())
            .ok_or_else(|| CoreError::ReleaseBlocked {
                blocker: ReleaseBlocker::PayeeAccountMissing,
                reason: format!("escrow {} has no payee account configured", escrow.id),
            })?;

        let mut claim = transaction.clone();
        claim.status = TransactionStatus::Approved;
        claim.approved_by = Some(request.approved_by.clone());
        claim.approved_at = Some(Utc::now());
        let claimed = self
            .repo
            .update_transaction(&claim, transaction.version, None)
            .await?;

        let description = format!(
            "BuildGate escrow release {} (milestone {})",
            claimed.id,
            claimed.milestone_id.as_deref().unwrap_or("-")
        );
        let transfer = tokio::time::timeout(
            self.payment_timeout,
            self.rail.transfer(&payee, claimed.amount_cents, &description),
        )
        .await;
        let transfer_id = match transfer {
            Ok(Ok(transfer_id)) => transfer_id,
            Ok(Err(err)) => {
                return Err(self.payment_failed(&claimed, err.to_string()).await);
            }
            Err(_) => {
                let message = format!(
                    "transfer timed out after {}ms",
                    self.payment_timeout.as_millis()
                );
                return Err(self.payment_failed(&claimed, message).await);
            }
        };

        let mut completed = claimed.clone();
        completed.status = TransactionStatus::Completed;
        completed.completed_at = Some(Utc::now());
        completed.external_transfer_id = Some(transfer_id.clone());
        let event = ProjectEvent::new(
            escrow.project_id.clone(),
            EventType::EscrowReleaseApproved,
            json!({
                "transaction_id": completed.id,
                "escrow_id": escrow.id,
                "milestone_id": completed.milestone_id,
                "amount_cents": completed.amount_cents,
                "transfer_id": transfer_id,
            }),
        )
        .with_actor(&request.approved_by);

        let completed = match self
            .repo
            .update_transaction(&completed, claimed.version, Some(&event))
            .await
        {
            Ok(completed) => completed,
            Err(err) => {
                error!(
                    transaction_id = %claimed.id,
                    transfer_id = %transfer_id,
                    error = %err,
                    "funds transferred but completion was not recorded"
                );
                return Err(err);
            }
        };

        info!(
            transaction_id = %completed.id,
            approved_by = %request.approved_by,
            transfer_id = %transfer_id,
            rail = self.rail.rail(),
            amount_cents = completed.amount_cents,
            "escrow release completed"
        );

        self.audit
            .emit(
                AuditRecord::new("ESCROW_RELEASE_APPROVED", TRANSACTION)
                    .by(&request.approved_by)
                    .on(&completed.id)
                    .with_change(
                        serde_json::to_value(&transaction).ok(),
                        serde_json::to_value(&completed).ok(),
                    )
                    .with_metadata(json!({ "transfer_id": transfer_id, "rail": self.rail.rail() })),
            )
            .await;
        self.notifier
            .send(
                &completed.requested_by,
                "ESCROW_RELEASE_APPROVED",
                "Escrow release approved",
                format!(
                    "Your release of {} cents has been approved and paid.",
                    completed.amount_cents
                ),
            )
            .await;

        Ok(completed)
    }

    /// Reject an open release, freeing its milestone for a new request.
    pub async fn reject_release(
        &self,
        transaction_id: &str,
        rejected_by: &str,
        reason: &str,
    ) -> Result<EscrowTransaction, CoreError> {
        let transaction = self.load_release(transaction_id).await?;
        if !transaction
            .status
            .can_transition_to(TransactionStatus::Rejected)
        {
            return Err(CoreError::invalid_transition(
                TRANSACTION,
                &transaction.id,
                transaction.status,
                TransactionStatus::Rejected,
            ));
        }
        ensure_no_payment_in_flight(&transaction)?;

        let escrow = self
            .repo
            .escrow(&transaction.escrow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("escrow", &transaction.escrow_id))?;

        let mut rejected = transaction.clone();
        rejected.status = TransactionStatus::Rejected;
        rejected.rejected_by = Some(rejected_by.to_string());
        rejected.rejection_reason = Some(reason.to_string());
        let event = ProjectEvent::new(
            escrow.project_id.clone(),
            EventType::EscrowReleaseRejected,
            json!({
                "transaction_id": rejected.id,
                "milestone_id": rejected.milestone_id,
                "reason": reason,
            }),
        )
        .with_actor(rejected_by);
        let rejected = self
            .repo
            .update_transaction(&rejected, transaction.version, Some(&event))
            .await?;

        info!(
            transaction_id = %rejected.id,
            rejected_by = %rejected_by,
            "escrow release rejected"
        );

        self.audit
            .emit(
                AuditRecord::new("ESCROW_RELEASE_REJECTED", TRANSACTION)
                    .by(rejected_by)
                    .on(&rejected.id)
                    .with_metadata(json!({ "reason": reason })),
            )
            .await;
        self.notifier
            .send(
                &rejected.requested_by,
                "ESCROW_RELEASE_REJECTED",
                "Escrow release rejected",
                format!("Your release request was rejected: {reason}"),
            )
            .await;

        Ok(rejected)
    }

    /// Operator recovery for a claim left behind by a transfer that never reported back,
    /// for example after a crash between the claim and the completion write.
    ///
    /// The operator must first confirm with the rail that no transfer went out. Clearing
    /// the claim lets a later human approval retry the payment, or a rejection free the
    /// milestone.
    pub async fn clear_payment_claim(
        &self,
        transaction_id: &str,
        cleared_by: &str,
        reason: &str,
    ) -> Result<EscrowTransaction, CoreError> {
        let transaction = self.load_release(transaction_id).await?;
        let claimed_at = match transaction.approved_at {
            Some(at) if transaction.status == TransactionStatus::Approved => at,
            _ => {
                return Err(CoreError::invalid_transition(
                    TRANSACTION,
                    &transaction.id,
                    transaction.status,
                    "claim cleared",
                ))
            }
        };

        let mut cleared = transaction.clone();
        cleared.approved_at = None;
        let cleared = self
            .repo
            .update_transaction(&cleared, transaction.version, None)
            .await?;

        warn!(
            transaction_id = %cleared.id,
            cleared_by = %cleared_by,
            claimed_at = %claimed_at,
            reason = %reason,
            "escrow payment claim cleared by operator"
        );
        self.audit
            .emit(
                AuditRecord::new("ESCROW_RELEASE_CLAIM_CLEARED", TRANSACTION)
                    .by(cleared_by)
                    .on(&cleared.id)
                    .with_metadata(json!({
                        "reason": reason,
                        "claimed_at": claimed_at,
                        "approved_by": cleared.approved_by,
                    })),
            )
            .await;

        Ok(cleared)
    }

    async fn load_release(&self, transaction_id: &str) -> Result<EscrowTransaction, CoreError> {
        let transaction = self
            .repo
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| CoreError::not_found(TRANSACTION, transaction_id))?;
        if transaction.kind != TransactionType::Release {
            return Err(CoreError::invalid_transition(
                TRANSACTION,
                &transaction.id,
                transaction.kind,
                "RELEASE workflow",
            ));
        }
        Ok(transaction)
    }

    /// Record a failed transfer. The claim is released so a later approval may retry.
    async fn payment_failed(&self, transaction: &EscrowTransaction, message: String) -> CoreError {
        let mut released = transaction.clone();
        released.approved_at = None;
        if let Err(err) = self
            .repo
            .update_transaction(&released, transaction.version, None)
            .await
        {
            error!(
                transaction_id = %transaction.id,
                error = %err,
                "failed to release approval claim after payment failure"
            );
        }
        warn!(
            transaction_id = %transaction.id,
            rail = self.rail.rail(),
            error = %message,
            "escrow payment failed; transaction left APPROVED for retry"
        );
        self.audit
            .emit(
                AuditRecord::new("ESCROW_RELEASE_PAYMENT_FAILED", TRANSACTION)
                    .on(&transaction.id)
                    .with_metadata(json!({ "rail": self.rail.rail(), "error": message })),
            )
            .await;
        CoreError::collaborator(self.rail.rail(), message)
    }
}

/// An APPROVED release with `approved_at` set is owned by an approval whose transfer has
/// not finished yet.
fn ensure_no_payment_in_flight(transaction: &EscrowTransaction) -> Result<(), CoreError> {
    if transaction.status == TransactionStatus::Approved && transaction.approved_at.is_some() {
        return Err(CoreError::Conflict(format!(
            "escrow transaction {} has a payment in flight",
            transaction.id
        )));
    }
    Ok(())
}
