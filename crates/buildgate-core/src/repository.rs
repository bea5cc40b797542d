use crate::error::CoreError;
use crate::features::FeatureSnapshot;
use crate::policy::ReleaseBlocker;
use crate::recommend::Recommendation;
use crate::scoring::ModelScore;
use crate::types::{
    EscrowAgreement, EscrowTransaction, Milestone, Project, ProjectEvent, ProjectState,
    ProjectStatus, RecommendationStatus, SubcontractorInvite, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outputs of one processed event, committed together with the processed marker.
#[derive(Debug, Clone)]
pub struct EventOutputs {
    pub snapshot: FeatureSnapshot,
    pub score: Option<ModelScore>,
    pub recommendation: Option<Recommendation>,
}

/// Error for a release request whose milestone slot is held by a release in `status`.
pub(crate) fn release_slot_taken(
    transaction: &EscrowTransaction,
    status: TransactionStatus,
) -> CoreError {
    let milestone_id = transaction.milestone_id.as_deref().unwrap_or("-");
    if status == TransactionStatus::Completed {
        CoreError::ReleaseBlocked {
            blocker: ReleaseBlocker::MilestoneAlreadyReleased,
            reason: format!("milestone {milestone_id} has already been released"),
        }
    } else {
        CoreError::Conflict(format!("milestone {milestone_id} already has an open release"))
    }
}

/// Transactional boundary to the store that owns project, escrow and event state.
///
/// Every mutating method is a single atomic read-modify-write. The core never performs
/// check-then-write sequences across two calls for anything guarded by an invariant:
///
/// - `create_release` holds the milestone's single release slot (any release that is not
///   REJECTED) and re-checks the dispute freeze inside the same critical section.
/// - `update_transaction` is a compare-and-swap on `EscrowTransaction::version`.
/// - `expire_invite` only flips PENDING invites.
/// - `complete_event` flips `features_extracted` and inserts the outputs together.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Load the consistent per-project view used by gates and feature extraction.
    async fn project_state(&self, project_id: &str) -> Result<ProjectState, CoreError>;

    async fn project(&self, project_id: &str) -> Result<Option<Project>, CoreError>;

    /// Move a project from `expected` to `next` and append `event` in one write.
    /// `Conflict` when the stored status is no longer `expected`.
    async fn update_project_status(
        &self,
        project_id: &str,
        expected: ProjectStatus,
        next: ProjectStatus,
        event: &ProjectEvent,
    ) -> Result<Project, CoreError>;

    /// Projects that are neither COMPLETED nor CANCELLED, ordered by id.
    async fn active_project_ids(&self) -> Result<Vec<String>, CoreError>;

    async fn escrow(&self, escrow_id: &str) -> Result<Option<EscrowAgreement>, CoreError>;

    async fn milestone(&self, milestone_id: &str) -> Result<Option<Milestone>, CoreError>;

    async fn has_active_dispute(&self, project_id: &str) -> Result<bool, CoreError>;

    async fn invite_by_token(&self, token: &str)
        -> Result<Option<SubcontractorInvite>, CoreError>;

    /// Flip a PENDING invite to EXPIRED. Returns `false` when the invite was not PENDING.
    async fn expire_invite(&self, invite_id: &str) -> Result<bool, CoreError>;

    /// Insert a PENDING release and its request event atomically.
    ///
    /// Fails with `Conflict` when the milestone already has an open (PENDING/APPROVED)
    /// release, with `ReleaseBlocked(MilestoneAlreadyReleased)` when a release of it has
    /// COMPLETED, and with `ReleaseBlocked(DisputeFreeze)` when a dispute became active
    /// after the caller's gate check.
    async fn create_release(
        &self,
        transaction: &EscrowTransaction,
        event: &ProjectEvent,
    ) -> Result<(), CoreError>;

    async fn transaction(&self, transaction_id: &str)
        -> Result<Option<EscrowTransaction>, CoreError>;

    async fn transactions_for_milestone(
        &self,
        milestone_id: &str,
    ) -> Result<Vec<EscrowTransaction>, CoreError>;

    /// Persist `updated` only if the stored version still equals `expected_version`,
    /// appending `event` in the same write. Returns the stored row with its new version.
    async fn update_transaction(
        &self,
        updated: &EscrowTransaction,
        expected_version: i64,
        event: Option<&ProjectEvent>,
    ) -> Result<EscrowTransaction, CoreError>;

    async fn append_event(&self, event: &ProjectEvent) -> Result<(), CoreError>;

    async fn event(&self, event_id: &str) -> Result<Option<ProjectEvent>, CoreError>;

    async fn events(&self, project_id: &str) -> Result<Vec<ProjectEvent>, CoreError>;

    /// Mark an event processed and insert its outputs. `Conflict` if already processed.
    async fn complete_event(&self, event_id: &str, outputs: &EventOutputs)
        -> Result<(), CoreError>;

    async fn insert_snapshot(&self, snapshot: &FeatureSnapshot) -> Result<(), CoreError>;

    async fn snapshots(&self, project_id: &str) -> Result<Vec<FeatureSnapshot>, CoreError>;

    async fn insert_score(&self, score: &ModelScore) -> Result<(), CoreError>;

    async fn scores(&self, project_id: &str) -> Result<Vec<ModelScore>, CoreError>;

    async fn insert_recommendation(&self, recommendation: &Recommendation)
        -> Result<(), CoreError>;

    async fn recommendation(
        &self,
        recommendation_id: &str,
    ) -> Result<Option<Recommendation>, CoreError>;

    async fn recommendations(&self, project_id: &str)
        -> Result<Vec<Recommendation>, CoreError>;

    /// Move an ACTIVE recommendation to `status`. Returns `false` when it was not ACTIVE.
    async fn transition_recommendation(
        &self,
        recommendation_id: &str,
        status: RecommendationStatus,
    ) -> Result<bool, CoreError>;

    /// Expire every ACTIVE recommendation whose `expires_at` is before `now`.
    async fn expire_recommendations(&self, now: DateTime<Utc>) -> Result<u64, CoreError>;
}
