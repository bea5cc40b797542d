use crate::error::CoreError;
use crate::features::FeatureExtractor;
use crate::recommend::RecommendationGenerator;
use crate::repository::{EventOutputs, ProjectRepository};
use crate::scoring::RiskScorer;
use crate::types::{EventType, SnapshotReason};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event types whose state change can move the risk score.
pub fn triggers_scoring(event_type: &EventType) -> bool {
    matches!(
        event_type,
        EventType::ContractSigned
            | EventType::DesignApproved
            | EventType::ReadinessItemCompleted
            | EventType::StatusChange
    )
}

/// Event types that warrant a fresh next-best-action.
pub fn triggers_recommendation(event_type: &EventType) -> bool {
    matches!(
        event_type,
        EventType::ProjectCreated
            | EventType::StatusChange
            | EventType::MilestoneOverdue
            | EventType::PaymentDelayed
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    AlreadyProcessed,
    Processed {
        snapshot_id: String,
        score_id: Option<String>,
        recommendation_id: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// Consumes project events exactly once. Never raises and never retries.
#[derive(Clone)]
pub struct EventProcessor {
    repo: Arc<dyn ProjectRepository>,
    extractor: FeatureExtractor,
    scorer: RiskScorer,
    recommender: RecommendationGenerator,
}

impl EventProcessor {
    pub fn new(
        repo: Arc<dyn ProjectRepository>,
        extractor: FeatureExtractor,
        scorer: RiskScorer,
        recommender: RecommendationGenerator,
    ) -> Self {
        Self {
            repo,
            extractor,
            scorer,
            recommender,
        }
    }

    pub async fn process(&self, event_id: &str) -> EventOutcome {
        match self.try_process(event_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(event_id = %event_id, error = %err, "event processing failed");
                EventOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn try_process(&self, event_id: &str) -> Result<EventOutcome, CoreError> {
        let event = self
            .repo
            .event(event_id)
            .await?
            .ok_or_else(|| CoreError::not_found("event", event_id))?;
        if event.features_extracted {
            debug!(event_id = %event_id, "event already processed");
            return Ok(EventOutcome::AlreadyProcessed);
        }

        let mut snapshot = self
            .extractor
            .capture(&event.project_id, SnapshotReason::Event, Utc::now())
            .await?;
        snapshot.source_event_id = Some(event.id.clone());

        let score = triggers_scoring(&event.event_type).then(|| self.scorer.evaluate(&snapshot));
        let recommendation = if triggers_recommendation(&event.event_type) {
            Some(self.recommender.build(&snapshot).await?)
        } else {
            None
        };

        let outputs = EventOutputs {
            snapshot,
            score,
            recommendation,
        };
        match self.repo.complete_event(&event.id, &outputs).await {
            Ok(()) => {}
            Err(CoreError::Conflict(_)) => {
                debug!(event_id = %event_id, "event completed by a concurrent processor");
                return Ok(EventOutcome::AlreadyProcessed);
            }
            Err(err) => return Err(err),
        }

        info!(
            event_id = %event.id,
            project_id = %event.project_id,
            event_type = %event.event_type,
            scored = outputs.score.is_some(),
            recommended = outputs.recommendation.is_some(),
            "event processed"
        );

        Ok(EventOutcome::Processed {
            snapshot_id: outputs.snapshot.id,
            score_id: outputs.score.map(|score| score.id),
            recommendation_id: outputs.recommendation.map(|recommendation| recommendation.id),
        })
    }
}
