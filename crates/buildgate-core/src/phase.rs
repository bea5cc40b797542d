use crate::error::CoreError;
use crate::guardrail::{check_automation_action, RestrictedAction};
use crate::policy::{evaluate_permit_submission, Violation};
use crate::repository::ProjectRepository;
use crate::sinks::{AuditRecord, AuditTrail};
use crate::types::{EventType, Project, ProjectEvent, ProjectState, ProjectStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Who asked for a phase change. Automated callers go through the guardrail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Initiator {
    Human(String),
    Automation(String),
}

impl Initiator {
    pub fn id(&self) -> &str {
        match self {
            Self::Human(id) | Self::Automation(id) => id,
        }
    }
}

fn crosses_permit_boundary(current: ProjectStatus, target: ProjectStatus) -> bool {
    let permit_rank = ProjectStatus::Permitting.sequence_rank();
    match target.sequence_rank() {
        Some(target_rank) => {
            Some(target_rank) >= permit_rank
                && current
                    .sequence_rank()
                    .map_or(true, |rank| Some(rank) < permit_rank)
        }
        None => false,
    }
}

/// Structural check: forward along the phase sequence, or into ON_HOLD/CANCELLED.
/// Terminal phases never move. Leaving ON_HOLD resumes at `held_from` or later; with no
/// recorded hold origin any main-sequence phase is accepted.
pub fn check_transition_shape(
    project_id: &str,
    current: ProjectStatus,
    target: ProjectStatus,
    held_from: Option<ProjectStatus>,
) -> Result<(), CoreError> {
    let floor = held_from.and_then(ProjectStatus::sequence_rank);
    let allowed = !current.is_terminal()
        && current != target
        && match (current.sequence_rank(), target.sequence_rank()) {
            (_, None) => true,
            (None, Some(to)) => floor.map_or(true, |floor| to >= floor),
            (Some(from), Some(to)) => to > from,
        };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::invalid_transition(
            "project",
            project_id,
            current,
            target,
        ))
    }
}

/// Phase a project was in when it last went ON_HOLD, read from its newest STATUS_CHANGE
/// event. `None` unless that event moved it into ON_HOLD.
pub fn held_from(events: &[ProjectEvent]) -> Option<ProjectStatus> {
    let last = events
        .iter()
        .rev()
        .find(|event| event.event_type == EventType::StatusChange)?;
    let to = last.payload.get("to")?.as_str()?;
    if ProjectStatus::parse(to)? != ProjectStatus::OnHold {
        return None;
    }
    ProjectStatus::parse(last.payload.get("from")?.as_str()?)
}

/// Violations blocking `target`, after the structural check has passed.
pub fn evaluate_transition(state: &ProjectState, target: ProjectStatus) -> Vec<Violation> {
    if crosses_permit_boundary(state.project.status, target) {
        evaluate_permit_submission(state)
    } else {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct PhaseGuard {
    repo: Arc<dyn ProjectRepository>,
    audit: AuditTrail,
}

impl PhaseGuard {
    pub fn new(repo: Arc<dyn ProjectRepository>, audit: AuditTrail) -> Self {
        Self { repo, audit }
    }

    /// Dry-run: the violations a transition to `target` would hit right now.
    pub async fn check(
        &self,
        project_id: &str,
        target: ProjectStatus,
    ) -> Result<Vec<Violation>, CoreError> {
        let state = self.repo.project_state(project_id).await?;
        let held = self.held_from(&state).await?;
        check_transition_shape(project_id, state.project.status, target, held)?;
        Ok(evaluate_transition(&state, target))
    }

    /// Validate and persist a phase change, appending a STATUS_CHANGE event.
    pub async fn transition(
        &self,
        project_id: &str,
        target: ProjectStatus,
        initiator: &Initiator,
    ) -> Result<Project, CoreError> {
        let state = self.repo.project_state(project_id).await?;
        let current = state.project.status;
        let held = self.held_from(&state).await?;
        check_transition_shape(project_id, current, target, held)?;

        if matches!(initiator, Initiator::Automation(_)) && crosses_permit_boundary(current, target)
        {
            check_automation_action(RestrictedAction::SubmitPermit.as_str())?;
        }

        let violations = evaluate_transition(&state, target);
        if !violations.is_empty() {
            warn!(
                project_id = %project_id,
                from = %current,
                to = %target,
                violations = violations.len(),
                "phase transition blocked"
            );
            return Err(CoreError::Violations(violations));
        }

        let event = ProjectEvent::new(
            project_id,
            EventType::StatusChange,
            json!({ "from": current, "to": target }),
        )
        .with_actor(initiator.id());
        let project = self
            .repo
            .update_project_status(project_id, current, target, &event)
            .await?;

        info!(
            project_id = %project_id,
            from = %current,
            to = %target,
            initiator = %initiator.id(),
            "project phase changed"
        );
        self.audit
            .emit(
                AuditRecord::new("PROJECT_STATUS_CHANGED", "project")
                    .by(initiator.id())
                    .on(project_id)
                    .with_change(
                        Some(json!({ "status": current })),
                        Some(json!({ "status": target })),
                    ),
            )
            .await;

        Ok(project)
    }

    async fn held_from(&self, state: &ProjectState) -> Result<Option<ProjectStatus>, CoreError> {
        if state.project.status != ProjectStatus::OnHold {
            return Ok(None);
        }
        let events = self.repo.events(&state.project.id).await?;
        Ok(held_from(&events))
    }
}
