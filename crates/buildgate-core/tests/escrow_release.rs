mod common;

use buildgate_core::{
    ApprovalRequest, CoreError, Dispute, DisputeStatus, ErrorKind, EventType, GuardrailViolation,
    ProjectRepository, ProjectStatus, ReleaseBlocker, TransactionStatus,
};
use common::{escrow_id, harness_with, milestone_id, ready_project, CountingRail, HarnessBuilder};
use std::time::Duration;

fn approval(transaction_id: &str, confirmed: bool) -> ApprovalRequest {
    ApprovalRequest {
        transaction_id: transaction_id.to_string(),
        approved_by: "owner-approver".to_string(),
        confirmed_by_human: confirmed,
    }
}

fn open_dispute(project_id: &str) -> Dispute {
    Dispute {
        id: format!("d-{project_id}"),
        project_id: project_id.to_string(),
        status: DisputeStatus::Open,
        reason: "Cracked slab".to_string(),
    }
}

#[tokio::test]
async fn approval_without_human_confirmation_is_refused() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    let err = escrow
        .approve_release(approval(&pending.id, false))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Guardrail {
            violation: GuardrailViolation::HumanApprovalRequired,
            ..
        }
    ));
    assert!(err
        .to_string()
        .starts_with("ESCROW_RELEASE_REQUIRES_HUMAN_APPROVAL"));
    assert_eq!(h.rail.calls(), 0);

    let stored = h.repo.transaction(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
    assert_eq!(stored.approved_by, None);
}

#[test]
fn missing_confirmation_field_deserializes_as_unconfirmed() {
    let request: ApprovalRequest =
        serde_json::from_str(r#"{"transaction_id":"t1","approved_by":"u1"}"#).unwrap();
    assert!(!request.confirmed_by_human);
}

#[tokio::test]
async fn confirmed_approval_pays_once_and_completes() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(pending.amount_cents, 1_250_000);

    let completed = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap();
    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(completed.approved_by.as_deref(), Some("owner-approver"));
    assert_eq!(completed.external_transfer_id.as_deref(), Some("tr_1"));
    assert!(completed.completed_at.is_some());
    assert_eq!(h.rail.calls(), 1);

    let events: Vec<EventType> = h
        .repo
        .events("p1")
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        events,
        vec![
            EventType::EscrowReleaseRequested,
            EventType::EscrowReleaseApproved,
        ]
    );

    let actions = h.audit.actions().await;
    assert_eq!(
        actions,
        vec![
            "ESCROW_RELEASE_REQUESTED".to_string(),
            "ESCROW_RELEASE_APPROVED".to_string(),
        ]
    );
    assert!(h.audit.verify_chain().await);

    let sent = h.notifications.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].user_id, "owner-p1");
    assert_eq!(sent[1].user_id, "contractor-1");
    assert_eq!(sent[1].kind, "ESCROW_RELEASE_APPROVED");
}

#[tokio::test]
async fn completed_release_cannot_be_approved_again() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();
    escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap();

    let err = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
    assert_eq!(h.rail.calls(), 1);
}

#[tokio::test]
async fn dispute_blocks_release_requests() {
    let mut state = ready_project("p1", ProjectStatus::Construction);
    state.disputes.push(open_dispute("p1"));
    let h = harness_with(vec![state]).await;

    let err = h
        .engine
        .escrow()
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ReleaseBlocked {
            blocker: ReleaseBlocker::DisputeFreeze,
            ..
        }
    ));
    assert!(err.to_string().starts_with("RELEASE_BLOCKED"));
    assert!(err.to_string().contains("dispute"));
    assert!(h.repo.events("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn dispute_opened_after_request_blocks_approval() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    h.repo
        .update_project("p1", |state| state.disputes.push(open_dispute("p1")))
        .await
        .unwrap();

    let err = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guardrail);
    assert_eq!(h.rail.calls(), 0);
    let stored = h.repo.transaction(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn missing_payee_account_blocks_approval() {
    let mut state = ready_project("p1", ProjectStatus::Construction);
    if let Some(escrow) = state.escrow.as_mut() {
        escrow.payee_account = None;
    }
    let h = harness_with(vec![state]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    let err = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ReleaseBlocked {
            blocker: ReleaseBlocker::PayeeAccountMissing,
            ..
        }
    ));
    assert_eq!(h.rail.calls(), 0);
}

#[tokio::test]
async fn a_milestone_holds_one_open_release() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    let err = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_release_requests_open_exactly_one_transaction() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;

    let mut handles = Vec::new();
    for n in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .escrow()
                .request_release(&escrow_id("p1"), &milestone_id("p1"), &format!("c-{n}"))
                .await
        }));
    }

    let mut opened = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => opened += 1,
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::Conflict, "unexpected error {err}");
                conflicts += 1;
            }
        }
    }
    assert_eq!(opened, 1);
    assert_eq!(conflicts, 7);

    let open = h
        .repo
        .transactions_for_milestone(&milestone_id("p1"))
        .await
        .unwrap()
        .into_iter()
        .filter(|transaction| transaction.status.is_open())
        .count();
    assert_eq!(open, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_move_money_once() {
    let h = HarnessBuilder::new()
        .project(ready_project("p1", ProjectStatus::Construction))
        .rail(CountingRail::with_latency(Duration::from_millis(50)))
        .build()
        .await;
    let pending = h
        .engine
        .escrow()
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = h.engine.clone();
        let id = pending.id.clone();
        handles.push(tokio::spawn(async move {
            engine.escrow().approve_release(approval(&id, true)).await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(transaction) => {
                assert_eq!(transaction.status, TransactionStatus::Completed);
                completed += 1;
            }
            Err(err) => assert!(
                matches!(
                    err.kind(),
                    ErrorKind::Conflict | ErrorKind::BusinessRule
                ),
                "unexpected error {err}"
            ),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(h.rail.calls(), 1);
}

#[tokio::test]
async fn failed_payment_leaves_release_approved_for_retry() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    h.rail.set_failing(true);
    let err = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Collaborator);

    let stored = h.repo.transaction(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Approved);
    assert_eq!(stored.approved_at, None);
    assert_eq!(stored.external_transfer_id, None);
    assert!(h
        .audit
        .actions()
        .await
        .contains(&"ESCROW_RELEASE_PAYMENT_FAILED".to_string()));

    h.rail.set_failing(false);
    let completed = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap();
    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(h.rail.calls(), 1);
}

#[tokio::test]
async fn payment_timeout_is_a_collaborator_failure() {
    let h = HarnessBuilder::new()
        .project(ready_project("p1", ProjectStatus::Construction))
        .rail(CountingRail::with_latency(Duration::from_millis(500)))
        .payment_timeout(Duration::from_millis(20))
        .build()
        .await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    let err = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Collaborator);
    assert!(err.to_string().contains("timed out"));
    let stored = h.repo.transaction(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Approved);
}

#[tokio::test]
async fn rejection_frees_the_milestone_for_a_new_request() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let first = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    let rejected = escrow
        .reject_release(&first.id, "owner-p1", "Receipts missing")
        .await
        .unwrap();
    assert_eq!(rejected.status, TransactionStatus::Rejected);
    assert_eq!(rejected.rejected_by.as_deref(), Some("owner-p1"));
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Receipts missing"));

    let err = escrow
        .approve_release(approval(&first.id, true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    let second = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(h.rail.calls(), 0);

    let events = h.repo.events("p1").await.unwrap();
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::EscrowReleaseRejected));
}

#[tokio::test]
async fn paid_milestone_cannot_be_released_twice() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let first = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();
    escrow
        .approve_release(approval(&first.id, true))
        .await
        .unwrap();

    let decision = h
        .engine
        .policy()
        .check_escrow_release(&escrow_id("p1"), &milestone_id("p1"))
        .await
        .unwrap();
    assert_eq!(decision.blocker, Some(ReleaseBlocker::MilestoneAlreadyReleased));

    let err = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ReleaseBlocked {
            blocker: ReleaseBlocker::MilestoneAlreadyReleased,
            ..
        }
    ));
    assert_eq!(h.rail.calls(), 1);

    let releases = h
        .repo
        .transactions_for_milestone(&milestone_id("p1"))
        .await
        .unwrap();
    assert_eq!(releases.len(), 1);
}

#[tokio::test]
async fn operator_can_clear_a_claim_left_by_a_crashed_transfer() {
    let h = harness_with(vec![ready_project("p1", ProjectStatus::Construction)]).await;
    let escrow = h.engine.escrow();
    let pending = escrow
        .request_release(&escrow_id("p1"), &milestone_id("p1"), "contractor-1")
        .await
        .unwrap();

    // The claim write landed but the process died before the transfer reported back.
    let mut stranded = pending.clone();
    stranded.status = TransactionStatus::Approved;
    stranded.approved_by = Some("owner-approver".to_string());
    stranded.approved_at = Some(chrono::Utc::now());
    h.repo
        .update_transaction(&stranded, pending.version, None)
        .await
        .unwrap();

    let err = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = escrow
        .reject_release(&pending.id, "owner-p1", "Stuck")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let cleared = escrow
        .clear_payment_claim(&pending.id, "ops-1", "rail shows no transfer")
        .await
        .unwrap();
    assert_eq!(cleared.status, TransactionStatus::Approved);
    assert_eq!(cleared.approved_at, None);
    assert!(h
        .audit
        .actions()
        .await
        .contains(&"ESCROW_RELEASE_CLAIM_CLEARED".to_string()));

    let err = escrow
        .clear_payment_claim(&pending.id, "ops-1", "again")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    let completed = escrow
        .approve_release(approval(&pending.id, true))
        .await
        .unwrap();
    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(h.rail.calls(), 1);
}
