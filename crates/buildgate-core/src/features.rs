use crate::error::CoreError;
use crate::repository::ProjectRepository;
use crate::types::{
    new_id, ContractStatus, DesignStatus, MilestoneStatus, PermitStatus, ProjectState,
    ProjectStatus, ReadinessStatus, SnapshotReason, TeamRole,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Bumped whenever a feature is added, removed or redefined.
pub const FEATURE_VERSION: &str = "buildgate-features-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineFeatures {
    pub days_since_creation: i64,
    pub days_since_update: i64,
    pub current_phase: ProjectStatus,
    pub status_change_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialFeatures {
    pub total_milestones: u32,
    pub completed_milestones: u32,
    pub milestone_completion_ratio: f64,
    pub escrow_funded: bool,
    pub escrow_funded_amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamFeatures {
    pub member_count: u32,
    pub has_contractor: bool,
    pub has_project_manager: bool,
    pub has_designer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFeatures {
    pub readiness_progress: f64,
    pub design_version_count: u32,
    pub approved_design_count: u32,
    pub permit_set_count: u32,
    pub approved_permit_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFeatures {
    pub overdue_milestones: u32,
    pub contracts_not_signed: u32,
    pub designs_not_approved: u32,
    pub incomplete_required_readiness: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFeatures {
    pub timeline: TimelineFeatures,
    pub financial: FinancialFeatures,
    pub team: TeamFeatures,
    pub progress: ProgressFeatures,
    pub risk: RiskFeatures,
}

/// Immutable record of one extractor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub id: String,
    pub project_id: String,
    pub reason: SnapshotReason,
    pub feature_version: String,
    pub features: ProjectFeatures,
    pub source_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn count<T>(items: &[T], predicate: impl Fn(&T) -> bool) -> u32 {
    items.iter().filter(|item| predicate(item)).count() as u32
}

fn ratio(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(whole)
    }
}

/// Pure feature function over one consistent project view.
///
/// Only `state` and `as_of` are read, so identical inputs give identical features.
pub fn extract_features(state: &ProjectState, as_of: DateTime<Utc>) -> ProjectFeatures {
    let project = &state.project;

    let total_milestones = state.milestones.len() as u32;
    let completed_milestones = count(&state.milestones, |milestone| milestone.status.is_done());
    let overdue_milestones = count(&state.milestones, |milestone| {
        !milestone.status.is_done()
            && milestone.status != MilestoneStatus::Verified
            && milestone.due_date.map(|due| due < as_of).unwrap_or(false)
    });

    let readiness_items = state.readiness_items();
    let readiness_done = count(readiness_items, |item| {
        item.status == ReadinessStatus::Completed
    });

    let approved_design_count = count(&state.designs, |design| {
        matches!(
            design.status,
            DesignStatus::Approved | DesignStatus::ApprovedForPermit
        )
    });

    ProjectFeatures {
        timeline: TimelineFeatures {
            days_since_creation: (as_of - project.created_at).num_days().max(0),
            days_since_update: (as_of - project.updated_at).num_days().max(0),
            current_phase: project.status,
            status_change_count: state.status_change_count,
        },
        financial: FinancialFeatures {
            total_milestones,
            completed_milestones,
            milestone_completion_ratio: ratio(completed_milestones, total_milestones),
            escrow_funded: state
                .escrow
                .as_ref()
                .map(|escrow| escrow.is_funded())
                .unwrap_or(false),
            escrow_funded_amount_cents: state
                .escrow
                .as_ref()
                .map(|escrow| escrow.funded_amount_cents)
                .unwrap_or(0),
        },
        team: TeamFeatures {
            member_count: state.team.len() as u32,
            has_contractor: state
                .team
                .iter()
                .any(|member| member.role == TeamRole::Contractor),
            has_project_manager: state
                .team
                .iter()
                .any(|member| member.role == TeamRole::ProjectManager),
            has_designer: state
                .team
                .iter()
                .any(|member| matches!(member.role, TeamRole::Designer | TeamRole::Architect)),
        },
        progress: ProgressFeatures {
            readiness_progress: ratio(readiness_done, readiness_items.len() as u32),
            design_version_count: state.designs.len() as u32,
            approved_design_count,
            permit_set_count: state.permits.len() as u32,
            approved_permit_count: count(&state.permits, |permit| {
                permit.status == PermitStatus::Approved
            }),
        },
        risk: RiskFeatures {
            overdue_milestones,
            contracts_not_signed: count(&state.contracts, |contract| {
                contract.status != ContractStatus::FullySigned
            }),
            designs_not_approved: state.designs.len() as u32 - approved_design_count,
            incomplete_required_readiness: state.incomplete_required_items().len() as u32,
        },
    }
}

/// Reads project state through the repository and produces feature snapshots.
#[derive(Clone)]
pub struct FeatureExtractor {
    repo: Arc<dyn ProjectRepository>,
}

impl FeatureExtractor {
    pub fn new(repo: Arc<dyn ProjectRepository>) -> Self {
        Self { repo }
    }

    /// Build a snapshot without persisting it.
    pub async fn capture(
        &self,
        project_id: &str,
        reason: SnapshotReason,
        as_of: DateTime<Utc>,
    ) -> Result<FeatureSnapshot, CoreError> {
        let state = self.repo.project_state(project_id).await?;
        let features = extract_features(&state, as_of);
        Ok(FeatureSnapshot {
            id: new_id(),
            project_id: project_id.to_string(),
            reason,
            feature_version: FEATURE_VERSION.to_string(),
            features,
            source_event_id: None,
            created_at: as_of,
        })
    }

    /// Extract and persist one snapshot as of now.
    pub async fn extract(
        &self,
        project_id: &str,
        reason: SnapshotReason,
    ) -> Result<FeatureSnapshot, CoreError> {
        self.extract_at(project_id, reason, Utc::now()).await
    }

    pub async fn extract_at(
        &self,
        project_id: &str,
        reason: SnapshotReason,
        as_of: DateTime<Utc>,
    ) -> Result<FeatureSnapshot, CoreError> {
        let snapshot = self.capture(project_id, reason, as_of).await?;
        self.repo.insert_snapshot(&snapshot).await?;
        debug!(
            project_id = %project_id,
            snapshot_id = %snapshot.id,
            reason = %reason,
            "feature snapshot persisted"
        );
        Ok(snapshot)
    }
}
