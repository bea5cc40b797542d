use crate::error::CoreError;
use crate::features::{FeatureExtractor, FeatureSnapshot, ProjectFeatures};
use crate::repository::ProjectRepository;
use crate::types::{new_id, RecommendationStatus, SnapshotReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Persisted next-best-action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub project_id: String,
    pub snapshot_id: Option<String>,
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub reasoning: String,
    pub confidence: f64,
    pub estimated_impact: Option<String>,
    pub estimated_effort: Option<String>,
    pub strategy: String,
    pub status: RecommendationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Strategy output before it is attached to a project and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationDraft {
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub estimated_impact: Option<String>,
    #[serde(default)]
    pub estimated_effort: Option<String>,
}

#[async_trait]
pub trait RecommendationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn recommend(&self, snapshot: &FeatureSnapshot)
        -> Result<RecommendationDraft, CoreError>;
}

/// Deterministic default strategy. Always available.
#[derive(Debug, Default, Clone)]
pub struct RuleBasedStrategy;

impl RuleBasedStrategy {
    pub fn draft(features: &ProjectFeatures) -> RecommendationDraft {
        let risk = &features.risk;
        if risk.contracts_not_signed > 0 {
            RecommendationDraft {
                title: "Sign outstanding contracts".to_string(),
                description: "Get every party's signature on the open contract agreements."
                    .to_string(),
                priority: 9,
                reasoning: format!(
                    "{} contract(s) are not fully signed; permits cannot be submitted until one is.",
                    risk.contracts_not_signed
                ),
                confidence: 0.9,
                estimated_impact: Some("Unblocks permit submission".to_string()),
                estimated_effort: Some("LOW".to_string()),
            }
        } else if risk.designs_not_approved > 0 {
            RecommendationDraft {
                title: "Approve the design for permit".to_string(),
                description: "Review the latest design version and approve it for permit."
                    .to_string(),
                priority: 8,
                reasoning: format!(
                    "{} design version(s) are awaiting approval.",
                    risk.designs_not_approved
                ),
                confidence: 0.85,
                estimated_impact: Some("Unblocks permit submission".to_string()),
                estimated_effort: Some("MEDIUM".to_string()),
            }
        } else {
            RecommendationDraft {
                title: "Complete required readiness items".to_string(),
                description: "Close out the remaining required items on the readiness checklist."
                    .to_string(),
                priority: 7,
                reasoning: format!(
                    "{} required readiness item(s) remain; checklist is {:.0}% complete.",
                    risk.incomplete_required_readiness,
                    features.progress.readiness_progress * 100.0
                ),
                confidence: 0.8,
                estimated_impact: Some("Keeps the project on schedule".to_string()),
                estimated_effort: Some("MEDIUM".to_string()),
            }
        }
    }
}

#[async_trait]
impl RecommendationStrategy for RuleBasedStrategy {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    async fn recommend(
        &self,
        snapshot: &FeatureSnapshot,
    ) -> Result<RecommendationDraft, CoreError> {
        Ok(Self::draft(&snapshot.features))
    }
}

/// Prompt context handed to a text-generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationContext {
    pub project_id: String,
    pub feature_version: String,
    pub features: ProjectFeatures,
}

/// External text-generation collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn generate(&self, context: &GenerationContext)
        -> Result<RecommendationDraft, CoreError>;
}

/// Delegates to a [`TextGenerator`] under a timeout. Failures surface as errors.
pub struct GenerativeStrategy {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl GenerativeStrategy {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }
}

#[async_trait]
impl RecommendationStrategy for GenerativeStrategy {
    fn name(&self) -> &'static str {
        "generative"
    }

    async fn recommend(
        &self,
        snapshot: &FeatureSnapshot,
    ) -> Result<RecommendationDraft, CoreError> {
        let context = GenerationContext {
            project_id: snapshot.project_id.clone(),
            feature_version: snapshot.feature_version.clone(),
            features: snapshot.features.clone(),
        };
        let backend = self.generator.backend();
        let draft = tokio::time::timeout(self.timeout, self.generator.generate(&context))
            .await
            .map_err(|_| {
                CoreError::collaborator(
                    backend,
                    format!("generation timed out after {}ms", self.timeout.as_millis()),
                )
            })??;

        if draft.title.trim().is_empty() {
            return Err(CoreError::collaborator(
                backend,
                "generated recommendation has an empty title",
            ));
        }

        Ok(RecommendationDraft {
            priority: draft.priority.clamp(1, 10),
            confidence: draft.confidence.clamp(0.0, 1.0),
            ..draft
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Accepted,
    Rejected,
}

impl Resolution {
    fn status(self) -> RecommendationStatus {
        match self {
            Self::Accepted => RecommendationStatus::Accepted,
            Self::Rejected => RecommendationStatus::Rejected,
        }
    }
}

#[derive(Clone)]
pub struct RecommendationGenerator {
    repo: Arc<dyn ProjectRepository>,
    extractor: FeatureExtractor,
    strategy: Arc<dyn RecommendationStrategy>,
    ttl: chrono::Duration,
}

impl RecommendationGenerator {
    pub fn new(
        repo: Arc<dyn ProjectRepository>,
        strategy: Arc<dyn RecommendationStrategy>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            extractor: FeatureExtractor::new(repo.clone()),
            repo,
            strategy,
            ttl,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Build an ACTIVE recommendation for a snapshot without persisting it.
    pub async fn build(&self, snapshot: &FeatureSnapshot) -> Result<Recommendation, CoreError> {
        let draft = self.strategy.recommend(snapshot).await?;
        let now = Utc::now();
        Ok(Recommendation {
            id: new_id(),
            project_id: snapshot.project_id.clone(),
            snapshot_id: Some(snapshot.id.clone()),
            title: draft.title,
            description: draft.description,
            priority: draft.priority,
            reasoning: draft.reasoning,
            confidence: draft.confidence,
            estimated_impact: draft.estimated_impact,
            estimated_effort: draft.estimated_effort,
            strategy: self.strategy.name().to_string(),
            status: RecommendationStatus::Active,
            created_at: now,
            expires_at: now + self.ttl,
        })
    }

    /// Extract a fresh snapshot, then build and persist one recommendation from it.
    pub async fn generate(
        &self,
        project_id: &str,
        reason: SnapshotReason,
    ) -> Result<Recommendation, CoreError> {
        let snapshot = self.extractor.extract(project_id, reason).await?;
        let recommendation = self.build(&snapshot).await?;
        self.repo.insert_recommendation(&recommendation).await?;
        info!(
            project_id = %project_id,
            recommendation_id = %recommendation.id,
            priority = recommendation.priority,
            strategy = %recommendation.strategy,
            "recommendation generated"
        );
        Ok(recommendation)
    }

    /// Move an ACTIVE recommendation to ACCEPTED or REJECTED.
    pub async fn resolve(
        &self,
        recommendation_id: &str,
        resolution: Resolution,
    ) -> Result<Recommendation, CoreError> {
        let current = self
            .repo
            .recommendation(recommendation_id)
            .await?
            .ok_or_else(|| CoreError::not_found("recommendation", recommendation_id))?;

        let target = resolution.status();
        if !self
            .repo
            .transition_recommendation(recommendation_id, target)
            .await?
        {
            // Re-read so the error names the status that won.
            let status = self
                .repo
                .recommendation(recommendation_id)
                .await?
                .map(|recommendation| recommendation.status)
                .unwrap_or(current.status);
            warn!(
                recommendation_id = %recommendation_id,
                status = %status,
                "recommendation is no longer active"
            );
            return Err(CoreError::invalid_transition(
                "recommendation",
                recommendation_id,
                status,
                target,
            ));
        }

        Ok(Recommendation {
            status: target,
            ..current
        })
    }

    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let expired = self.repo.expire_recommendations(now).await?;
        if expired > 0 {
            info!(expired, "stale recommendations expired");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{
        FinancialFeatures, ProgressFeatures, RiskFeatures, TeamFeatures, TimelineFeatures,
        FEATURE_VERSION,
    };
    use crate::types::ProjectStatus;

    fn snapshot(contracts: u32, designs: u32, readiness: u32) -> FeatureSnapshot {
        FeatureSnapshot {
            id: "s1".to_string(),
            project_id: "p1".to_string(),
            reason: SnapshotReason::Manual,
            feature_version: FEATURE_VERSION.to_string(),
            features: ProjectFeatures {
                timeline: TimelineFeatures {
                    days_since_creation: 1,
                    days_since_update: 1,
                    current_phase: ProjectStatus::Design,
                    status_change_count: 0,
                },
                financial: FinancialFeatures {
                    total_milestones: 0,
                    completed_milestones: 0,
                    milestone_completion_ratio: 0.0,
                    escrow_funded: false,
                    escrow_funded_amount_cents: 0,
                },
                team: TeamFeatures {
                    member_count: 1,
                    has_contractor: false,
                    has_project_manager: false,
                    has_designer: false,
                },
                progress: ProgressFeatures {
                    readiness_progress: 0.25,
                    design_version_count: designs,
                    approved_design_count: 0,
                    permit_set_count: 0,
                    approved_permit_count: 0,
                },
                risk: RiskFeatures {
                    overdue_milestones: 0,
                    contracts_not_signed: contracts,
                    designs_not_approved: designs,
                    incomplete_required_readiness: readiness,
                },
            },
            source_event_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rules_fire_in_priority_order() {
        assert_eq!(RuleBasedStrategy::draft(&snapshot(1, 1, 1).features).priority, 9);
        assert_eq!(RuleBasedStrategy::draft(&snapshot(0, 1, 1).features).priority, 8);
        let fallback = RuleBasedStrategy::draft(&snapshot(0, 0, 2).features);
        assert_eq!(fallback.priority, 7);
        assert!(fallback.reasoning.contains("25%"));
    }

    struct SlowGenerator;

    #[async_trait]
    impl TextGenerator for SlowGenerator {
        fn backend(&self) -> &'static str {
            "slow"
        }

        async fn generate(
            &self,
            _context: &GenerationContext,
        ) -> Result<RecommendationDraft, CoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(CoreError::collaborator("slow", "unreachable"))
        }
    }

    struct EagerGenerator;

    #[async_trait]
    impl TextGenerator for EagerGenerator {
        fn backend(&self) -> &'static str {
            "eager"
        }

        async fn generate(
            &self,
            context: &GenerationContext,
        ) -> Result<RecommendationDraft, CoreError> {
            Ok(RecommendationDraft {
                title: format!("Call the GC on {}", context.project_id),
                description: "Schedule a site walk".to_string(),
                priority: 42,
                reasoning: "model output".to_string(),
                confidence: 1.7,
                estimated_impact: None,
                estimated_effort: None,
            })
        }
    }

    #[tokio::test]
    async fn generative_timeout_is_a_collaborator_error() {
        let strategy = GenerativeStrategy::new(Arc::new(SlowGenerator), Duration::from_millis(20));
        let err = strategy.recommend(&snapshot(0, 0, 0)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Collaborator);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn generative_output_is_clamped() {
        let strategy = GenerativeStrategy::new(Arc::new(EagerGenerator), Duration::from_secs(1));
        let draft = strategy.recommend(&snapshot(0, 0, 0)).await.unwrap();
        assert_eq!(draft.priority, 10);
        assert_eq!(draft.confidence, 1.0);
        assert_eq!(draft.title, "Call the GC on p1");
    }
}
