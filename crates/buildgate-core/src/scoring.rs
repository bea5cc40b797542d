use crate::error::CoreError;
use crate::features::{FeatureSnapshot, ProjectFeatures};
use crate::repository::ProjectRepository;
use crate::types::{new_id, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const MODEL_NAME: &str = "buildgate-risk-rules";
pub const MODEL_VERSION: &str = "1.0.0";
/// Rule-based scores carry a fixed confidence.
pub const RULE_CONFIDENCE: f64 = 0.75;

// Basis points: 10_000 == 1.0. Integer arithmetic keeps thresholds exact.
const BASE_BPS: i64 = 5_000;
const UNSIGNED_CONTRACT_BPS: i64 = 2_000;
const UNAPPROVED_DESIGN_BPS: i64 = 1_500;
const INCOMPLETE_READINESS_BPS: i64 = 1_000;
const READY_DISCOUNT_BPS: i64 = -1_500;
const READY_THRESHOLD_BPS: i64 = 8_000;
const HIGH_ABOVE_BPS: i64 = 7_000;
const MEDIUM_ABOVE_BPS: i64 = 4_000;
const MAX_BPS: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactor {
    pub factor: String,
    pub value: f64,
    /// Signed contribution to the score on the 0..1 scale.
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreExplanation {
    pub base: f64,
    pub factors: Vec<ScoreFactor>,
    pub raw_score: f64,
    pub clamped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score_bps: u16,
    pub risk_level: RiskLevel,
    pub explanation: ScoreExplanation,
}

impl RiskAssessment {
    pub fn score(&self) -> f64 {
        bps_to_f64(i64::from(self.score_bps))
    }
}

/// Persisted model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelScore {
    pub id: String,
    pub project_id: String,
    pub snapshot_id: Option<String>,
    pub model_name: String,
    pub model_version: String,
    pub score: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub explanation: ScoreExplanation,
    pub created_at: DateTime<Utc>,
}

fn bps_to_f64(bps: i64) -> f64 {
    bps as f64 / MAX_BPS as f64
}

pub fn risk_level_for(score_bps: i64) -> RiskLevel {
    if score_bps > HIGH_ABOVE_BPS {
        RiskLevel::High
    } else if score_bps > MEDIUM_ABOVE_BPS {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Deterministic, explainable risk rule over one feature set.
pub fn assess(features: &ProjectFeatures) -> RiskAssessment {
    let risk = &features.risk;
    let mut factors = Vec::new();
    let mut raw = BASE_BPS;

    let mut apply = |factor: &str, value: f64, delta_bps: i64| {
        raw += delta_bps;
        factors.push(ScoreFactor {
            factor: factor.to_string(),
            value,
            contribution: bps_to_f64(delta_bps),
        });
    };

    if risk.contracts_not_signed > 0 {
        apply(
            "contracts_not_signed",
            f64::from(risk.contracts_not_signed),
            UNSIGNED_CONTRACT_BPS,
        );
    }
    if risk.designs_not_approved > 0 {
        apply(
            "designs_not_approved",
            f64::from(risk.designs_not_approved),
            UNAPPROVED_DESIGN_BPS,
        );
    }
    if risk.incomplete_required_readiness > 0 {
        apply(
            "incomplete_required_readiness",
            f64::from(risk.incomplete_required_readiness),
            INCOMPLETE_READINESS_BPS * i64::from(risk.incomplete_required_readiness),
        );
    }
    // Compared in basis points, rounding the ratio to the nearest bp.
    let readiness_bps = (features.progress.readiness_progress * MAX_BPS as f64).round() as i64;
    if readiness_bps > READY_THRESHOLD_BPS {
        apply(
            "readiness_progress",
            features.progress.readiness_progress,
            READY_DISCOUNT_BPS,
        );
    }

    let clamped_bps = raw.clamp(0, MAX_BPS);
    RiskAssessment {
        score_bps: clamped_bps as u16,
        risk_level: risk_level_for(clamped_bps),
        explanation: ScoreExplanation {
            base: bps_to_f64(BASE_BPS),
            factors,
            raw_score: bps_to_f64(raw),
            clamped: clamped_bps != raw,
        },
    }
}

#[derive(Clone)]
pub struct RiskScorer {
    repo: Arc<dyn ProjectRepository>,
}

impl RiskScorer {
    pub fn new(repo: Arc<dyn ProjectRepository>) -> Self {
        Self { repo }
    }

    /// Build the score for a snapshot without persisting it.
    pub fn evaluate(&self, snapshot: &FeatureSnapshot) -> ModelScore {
        let assessment = assess(&snapshot.features);
        ModelScore {
            id: new_id(),
            project_id: snapshot.project_id.clone(),
            snapshot_id: Some(snapshot.id.clone()),
            model_name: MODEL_NAME.to_string(),
            model_version: MODEL_VERSION.to_string(),
            score: assessment.score(),
            risk_level: assessment.risk_level,
            confidence: RULE_CONFIDENCE,
            explanation: assessment.explanation,
            created_at: Utc::now(),
        }
    }

    pub async fn score(&self, snapshot: &FeatureSnapshot) -> Result<ModelScore, CoreError> {
        let score = self.evaluate(snapshot);
        self.repo.insert_score(&score).await?;
        info!(
            project_id = %score.project_id,
            score = score.score,
            risk_level = %score.risk_level,
            "risk score persisted"
        );
        Ok(score)
    }
}
