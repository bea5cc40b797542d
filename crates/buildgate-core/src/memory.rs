use crate::error::CoreError;
use crate::features::FeatureSnapshot;
use crate::policy::ReleaseBlocker;
use crate::recommend::Recommendation;
use crate::repository::{release_slot_taken, EventOutputs, ProjectRepository};
use crate::scoring::ModelScore;
use crate::types::{
    EscrowAgreement, EscrowTransaction, EventType, InviteStatus, Milestone, Project,
    ProjectEvent, ProjectState, ProjectStatus, RecommendationStatus, SubcontractorInvite,
    TransactionType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Seed data for the in-memory backend.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryFixture {
    #[serde(default)]
    pub projects: Vec<ProjectState>,
    #[serde(default)]
    pub invites: Vec<SubcontractorInvite>,
    #[serde(default)]
    pub transactions: Vec<EscrowTransaction>,
    #[serde(default)]
    pub events: Vec<ProjectEvent>,
}

#[derive(Debug, Default)]
struct MemoryState {
    projects: BTreeMap<String, ProjectState>,
    invites: BTreeMap<String, SubcontractorInvite>,
    transactions: BTreeMap<String, EscrowTransaction>,
    events: Vec<ProjectEvent>,
    snapshots: Vec<FeatureSnapshot>,
    scores: Vec<ModelScore>,
    recommendations: Vec<Recommendation>,
}

impl MemoryState {
    fn escrow(&self, escrow_id: &str) -> Option<&EscrowAgreement> {
        self.projects
            .values()
            .filter_map(|state| state.escrow.as_ref())
            .find(|escrow| escrow.id == escrow_id)
    }

    fn milestone(&self, milestone_id: &str) -> Option<&Milestone> {
        self.projects
            .values()
            .flat_map(|state| state.milestones.iter())
            .find(|milestone| milestone.id == milestone_id)
    }

    fn dispute_active(&self, project_id: &str) -> bool {
        self.projects
            .get(project_id)
            .map(ProjectState::has_active_dispute)
            .unwrap_or(false)
    }

    fn push_event(&mut self, event: &ProjectEvent) {
        if event.event_type == EventType::StatusChange {
            if let Some(state) = self.projects.get_mut(&event.project_id) {
                state.status_change_count += 1;
            }
        }
        self.events.push(event.clone());
    }
}

/// Process-local repository. Each mutating call runs under one write lock, which makes
/// every gate-then-write operation a single critical section.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: MemoryFixture) -> Self {
        let mut state = MemoryState::default();
        for project in fixture.projects {
            state.projects.insert(project.project.id.clone(), project);
        }
        for invite in fixture.invites {
            state.invites.insert(invite.id.clone(), invite);
        }
        for transaction in fixture.transactions {
            state
                .transactions
                .insert(transaction.id.clone(), transaction);
        }
        // Counts follow the seeded events, as the Postgres backend derives them.
        for project in state.projects.values_mut() {
            project.status_change_count = 0;
        }
        for event in &fixture.events {
            state.push_event(event);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load a JSON [`MemoryFixture`] from disk.
    pub async fn load_fixture(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::Storage(format!("fixture read failed for {}: {e}", path.display()))
        })?;
        let fixture: MemoryFixture = serde_json::from_str(&raw)?;
        Ok(Self::from_fixture(fixture))
    }

    pub async fn insert_project(&self, project: ProjectState) {
        self.state
            .write()
            .await
            .projects
            .insert(project.project.id.clone(), project);
    }

    pub async fn insert_invite(&self, invite: SubcontractorInvite) {
        self.state
            .write()
            .await
            .invites
            .insert(invite.id.clone(), invite);
    }

    /// Apply an out-of-band change to a project's related records.
    pub async fn update_project<F>(&self, project_id: &str, change: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut ProjectState),
    {
        let mut guard = self.state.write().await;
        let state = guard
            .projects
            .get_mut(project_id)
            .ok_or_else(|| CoreError::not_found("project", project_id))?;
        change(state);
        Ok(())
    }

    pub async fn invite(&self, invite_id: &str) -> Option<SubcontractorInvite> {
        self.state.read().await.invites.get(invite_id).cloned()
    }
}

#[async_trait]
impl ProjectRepository for MemoryRepository {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn project_state(&self, project_id: &str) -> Result<ProjectState, CoreError> {
        self.state
            .read()
            .await
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("project", project_id))
    }

    async fn project(&self, project_id: &str) -> Result<Option<Project>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .projects
            .get(project_id)
            .map(|state| state.project.clone()))
    }

    async fn update_project_status(
        &self,
        project_id: &str,
        expected: ProjectStatus,
        next: ProjectStatus,
        event: &ProjectEvent,
    ) -> Result<Project, CoreError> {
        let mut guard = self.state.write().await;
        let state = guard
            .projects
            .get_mut(project_id)
            .ok_or_else(|| CoreError::not_found("project", project_id))?;
        if state.project.status != expected {
            return Err(CoreError::Conflict(format!(
                "project {project_id} moved to {} concurrently",
                state.project.status
            )));
        }
        state.project.status = next;
        state.project.updated_at = Utc::now();
        let project = state.project.clone();
        guard.push_event(event);
        Ok(project)
    }

    async fn active_project_ids(&self) -> Result<Vec<String>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .projects
            .values()
            .filter(|state| state.project.status.is_active())
            .map(|state| state.project.id.clone())
            .collect())
    }

    async fn escrow(&self, escrow_id: &str) -> Result<Option<EscrowAgreement>, CoreError> {
        Ok(self.state.read().await.escrow(escrow_id).cloned())
    }

    async fn milestone(&self, milestone_id: &str) -> Result<Option<Milestone>, CoreError> {
        Ok(self.state.read().await.milestone(milestone_id).cloned())
    }

    async fn has_active_dispute(&self, project_id: &str) -> Result<bool, CoreError> {
        Ok(self.state.read().await.dispute_active(project_id))
    }

    async fn invite_by_token(
        &self,
        token: &str,
    ) -> Result<Option<SubcontractorInvite>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .invites
            .values()
            .find(|invite| invite.token == token)
            .cloned())
    }

    async fn expire_invite(&self, invite_id: &str) -> Result<bool, CoreError> {
        let mut guard = self.state.write().await;
        match guard.invites.get_mut(invite_id) {
            Some(invite) if invite.status == InviteStatus::Pending => {
                invite.status = InviteStatus::Expired;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::not_found("invite", invite_id)),
        }
    }

    async fn create_release(
        &self,
        transaction: &EscrowTransaction,
        event: &ProjectEvent,
    ) -> Result<(), CoreError> {
        let mut guard = self.state.write().await;

        let project_id = guard
            .escrow(&transaction.escrow_id)
            .map(|escrow| escrow.project_id.clone())
            .ok_or_else(|| CoreError::not_found("escrow", &transaction.escrow_id))?;
        if guard.dispute_active(&project_id) {
            return Err(CoreError::ReleaseBlocked {
                blocker: ReleaseBlocker::DisputeFreeze,
                reason: "escrow is frozen while the project has an active dispute".to_string(),
            });
        }

        let held = guard
            .transactions
            .values()
            .filter(|existing| {
                existing.kind == TransactionType::Release
                    && existing.milestone_id == transaction.milestone_id
            })
            .map(|existing| existing.status)
            .find(|status| status.holds_milestone());
        if let Some(status) = held {
            return Err(release_slot_taken(transaction, status));
        }

        guard
            .transactions
            .insert(transaction.id.clone(), transaction.clone());
        guard.push_event(event);
        Ok(())
    }

    async fn transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<EscrowTransaction>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .get(transaction_id)
            .cloned())
    }

    async fn transactions_for_milestone(
        &self,
        milestone_id: &str,
    ) -> Result<Vec<EscrowTransaction>, CoreError> {
        let mut transactions: Vec<_> = self
            .state
            .read()
            .await
            .transactions
            .values()
            .filter(|transaction| transaction.milestone_id.as_deref() == Some(milestone_id))
            .cloned()
            .collect();
        transactions.sort_by_key(|transaction| transaction.created_at);
        Ok(transactions)
    }

    async fn update_transaction(
        &self,
        updated: &EscrowTransaction,
        expected_version: i64,
        event: Option<&ProjectEvent>,
    ) -> Result<EscrowTransaction, CoreError> {
        let mut guard = self.state.write().await;
        let stored = guard
            .transactions
            .get_mut(&updated.id)
            .ok_or_else(|| CoreError::not_found("escrow_transaction", &updated.id))?;
        if stored.version != expected_version {
            return Err(CoreError::Conflict(format!(
                "escrow transaction {} was modified concurrently (version {} != {})",
                updated.id, stored.version, expected_version
            )));
        }

        let mut next = updated.clone();
        next.version = expected_version + 1;
        *stored = next.clone();
        if let Some(event) = event {
            guard.push_event(event);
        }
        Ok(next)
    }

    async fn append_event(&self, event: &ProjectEvent) -> Result<(), CoreError> {
        let mut guard = self.state.write().await;
        if guard.events.iter().any(|existing| existing.id == event.id) {
            return Err(CoreError::Conflict(format!("event {} already exists", event.id)));
        }
        guard.push_event(event);
        Ok(())
    }

    async fn event(&self, event_id: &str) -> Result<Option<ProjectEvent>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .find(|event| event.id == event_id)
            .cloned())
    }

    async fn events(&self, project_id: &str) -> Result<Vec<ProjectEvent>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|event| event.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outputs: &EventOutputs,
    ) -> Result<(), CoreError> {
        let mut guard = self.state.write().await;
        let event = guard
            .events
            .iter_mut()
            .find(|event| event.id == event_id)
            .ok_or_else(|| CoreError::not_found("event", event_id))?;
        if event.features_extracted {
            return Err(CoreError::Conflict(format!(
                "event {event_id} was already processed"
            )));
        }
        event.features_extracted = true;

        guard.snapshots.push(outputs.snapshot.clone());
        if let Some(score) = &outputs.score {
            guard.scores.push(score.clone());
        }
        if let Some(recommendation) = &outputs.recommendation {
            guard.recommendations.push(recommendation.clone());
        }
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &FeatureSnapshot) -> Result<(), CoreError> {
        self.state.write().await.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn snapshots(&self, project_id: &str) -> Result<Vec<FeatureSnapshot>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .snapshots
            .iter()
            .filter(|snapshot| snapshot.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_score(&self, score: &ModelScore) -> Result<(), CoreError> {
        self.state.write().await.scores.push(score.clone());
        Ok(())
    }

    async fn scores(&self, project_id: &str) -> Result<Vec<ModelScore>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .scores
            .iter()
            .filter(|score| score.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> Result<(), CoreError> {
        self.state
            .write()
            .await
            .recommendations
            .push(recommendation.clone());
        Ok(())
    }

    async fn recommendation(
        &self,
        recommendation_id: &str,
    ) -> Result<Option<Recommendation>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .recommendations
            .iter()
            .find(|recommendation| recommendation.id == recommendation_id)
            .cloned())
    }

    async fn recommendations(
        &self,
        project_id: &str,
    ) -> Result<Vec<Recommendation>, CoreError> {
        Ok(self
            .state
            .read()
            .await
            .recommendations
            .iter()
            .filter(|recommendation| recommendation.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn transition_recommendation(
        &self,
        recommendation_id: &str,
        status: RecommendationStatus,
    ) -> Result<bool, CoreError> {
        let mut guard = self.state.write().await;
        match guard
            .recommendations
            .iter_mut()
            .find(|recommendation| recommendation.id == recommendation_id)
        {
            Some(recommendation) if recommendation.status == RecommendationStatus::Active => {
                recommendation.status = status;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::not_found("recommendation", recommendation_id)),
        }
    }

    async fn expire_recommendations(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut guard = self.state.write().await;
        let mut expired = 0;
        for recommendation in guard.recommendations.iter_mut() {
            if recommendation.status == RecommendationStatus::Active
                && recommendation.expires_at < now
            {
                recommendation.status = RecommendationStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
