use crate::error::CoreError;
use crate::features::FeatureExtractor;
use crate::recommend::RecommendationGenerator;
use crate::repository::ProjectRepository;
use crate::scoring::RiskScorer;
use crate::types::SnapshotReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPass {
    /// Features and risk score for every active project.
    Daily,
    /// Recommendation for every active project.
    Weekly,
    /// Expire stale recommendations.
    Expire,
}

impl SweepPass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Expire => "expire",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub project_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub pass: SweepPass,
    pub processed: usize,
    pub failures: Vec<SweepFailure>,
    pub expired: u64,
}

impl SweepReport {
    fn new(pass: SweepPass) -> Self {
        Self {
            pass,
            processed: 0,
            failures: Vec::new(),
            expired: 0,
        }
    }

    fn record(&mut self, project_id: &str, result: Result<(), CoreError>) {
        match result {
            Ok(()) => self.processed += 1,
            Err(err) => {
                warn!(
                    pass = self.pass.as_str(),
                    project_id = %project_id,
                    error = %err,
                    "project failed during sweep"
                );
                self.failures.push(SweepFailure {
                    project_id: project_id.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
}

/// Scheduler-independent entry points over all active projects.
///
/// Projects are processed one at a time; a failing project is recorded and skipped.
#[derive(Clone)]
pub struct BatchProcessor {
    repo: Arc<dyn ProjectRepository>,
    extractor: FeatureExtractor,
    scorer: RiskScorer,
    recommender: RecommendationGenerator,
}

impl BatchProcessor {
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

    pub async fn run(&self, pass: SweepPass) -> Result<SweepReport, CoreError> {
        match pass {
            SweepPass::Daily => self.run_daily().await,
            SweepPass::Weekly => self.run_weekly().await,
            SweepPass::Expire => self.expire_recommendations(Utc::now()).await,
        }
    }

    pub async fn run_daily(&self) -> Result<SweepReport, CoreError> {
        let mut report = SweepReport::new(SweepPass::Daily);
        for project_id in self.repo.active_project_ids().await? {
            let result = async {
                let snapshot = self
                    .extractor
                    .extract(&project_id, SnapshotReason::Scheduled)
                    .await?;
                self.scorer.score(&snapshot).await?;
                Ok::<(), CoreError>(())
            }
            .await;
            report.record(&project_id, result);
        }
        info!(
            processed = report.processed,
            failed = report.failures.len(),
            "daily sweep finished"
        );
        Ok(report)
    }

    pub async fn run_weekly(&self) -> Result<SweepReport, CoreError> {
        let mut report = SweepReport::new(SweepPass::Weekly);
        for project_id in self.repo.active_project_ids().await? {
            let result = self
                .recommender
                .generate(&project_id, SnapshotReason::Scheduled)
                .await
                .map(|_| ());
            report.record(&project_id, result);
        }
        info!(
            processed = report.processed,
            failed = report.failures.len(),
            "weekly sweep finished"
        );
        Ok(report)
    }

    pub async fn expire_recommendations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, CoreError> {
        let mut report = SweepReport::new(SweepPass::Expire);
        report.expired = self.recommender.expire_stale(now).await?;
        Ok(report)
    }
}
