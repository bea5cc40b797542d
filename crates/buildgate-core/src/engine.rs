use crate::batch::BatchProcessor;
use crate::error::CoreError;
use crate::escrow::EscrowReleaseMachine;
use crate::events::EventProcessor;
use crate::features::FeatureExtractor;
use crate::guardrail;
use crate::payment::PaymentRail;
use crate::phase::PhaseGuard;
use crate::policy::PolicyGate;
use crate::recommend::{
    GenerativeStrategy, RecommendationGenerator, RecommendationStrategy, RuleBasedStrategy,
    TextGenerator,
};
use crate::repository::ProjectRepository;
use crate::scoring::RiskScorer;
use crate::sinks::{
    AuditSink, AuditTrail, NotificationSink, Notifier, TracingAuditSink, TracingNotificationSink,
};
use crate::storage::StorageConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    /// Upper bound on one payment-rail transfer.
    pub payment_timeout: Duration,
    /// Upper bound on one generative recommendation call.
    pub generation_timeout: Duration,
    /// How long a recommendation stays ACTIVE.
    pub recommendation_ttl: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            payment_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(20),
            recommendation_ttl: chrono::Duration::days(7),
        }
    }
}

/// External collaborators injected into the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub payment_rail: Arc<dyn PaymentRail>,
    pub text_generator: Option<Arc<dyn TextGenerator>>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub notification_sink: Arc<dyn NotificationSink>,
}

impl Collaborators {
    /// Log-backed audit and notification sinks, rule-based recommendations.
    pub fn new(payment_rail: Arc<dyn PaymentRail>) -> Self {
        Self {
            payment_rail,
            text_generator: None,
            audit_sink: Arc::new(TracingAuditSink),
            notification_sink: Arc::new(TracingNotificationSink),
        }
    }

    pub fn with_text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.text_generator = Some(generator);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notification_sink = sink;
        self
    }
}

/// Composition root: one repository, all gates and pipelines wired over it.
#[derive(Clone)]
pub struct BuildGateEngine {
    repo: Arc<dyn ProjectRepository>,
    gate: PolicyGate,
    phases: PhaseGuard,
    escrow: EscrowReleaseMachine,
    extractor: FeatureExtractor,
    scorer: RiskScorer,
    recommender: RecommendationGenerator,
    events: EventProcessor,
    batch: BatchProcessor,
}

impl BuildGateEngine {
    pub async fn bootstrap(
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, CoreError> {
        let repo = config.storage.bootstrap().await?;
        Ok(Self::with_repository(repo, &config, collaborators))
    }

    pub fn with_repository(
        repo: Arc<dyn ProjectRepository>,
        config: &EngineConfig,
        collaborators: Collaborators,
    ) -> Self {
        let audit = AuditTrail::new(collaborators.audit_sink);
        let notifier = Notifier::new(collaborators.notification_sink);

        let strategy: Arc<dyn RecommendationStrategy> = match collaborators.text_generator {
            Some(generator) => Arc::new(GenerativeStrategy::new(
                generator,
                config.generation_timeout,
            )),
            None => Arc::new(RuleBasedStrategy),
        };

        let extractor = FeatureExtractor::new(repo.clone());
        let scorer = RiskScorer::new(repo.clone());
        let recommender =
            RecommendationGenerator::new(repo.clone(), strategy, config.recommendation_ttl);
        let events = EventProcessor::new(
            repo.clone(),
            extractor.clone(),
            scorer.clone(),
            recommender.clone(),
        );
        let batch = BatchProcessor::new(
            repo.clone(),
            extractor.clone(),
            scorer.clone(),
            recommender.clone(),
        );
        let escrow = EscrowReleaseMachine::new(
            repo.clone(),
            collaborators.payment_rail,
            audit.clone(),
            notifier,
            config.payment_timeout,
        );

        info!(
            storage = repo.backend_label(),
            strategy = recommender.strategy_name(),
            "buildgate engine ready"
        );

        Self {
            gate: PolicyGate::new(repo.clone()),
            phases: PhaseGuard::new(repo.clone(), audit),
            repo,
            escrow,
            extractor,
            scorer,
            recommender,
            events,
            batch,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ProjectRepository> {
        &self.repo
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.gate
    }

    pub fn phases(&self) -> &PhaseGuard {
        &self.phases
    }

    pub fn escrow(&self) -> &EscrowReleaseMachine {
        &self.escrow
    }

    pub fn features(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn scorer(&self) -> &RiskScorer {
        &self.scorer
    }

    pub fn recommendations(&self) -> &RecommendationGenerator {
        &self.recommender
    }

    pub fn events(&self) -> &EventProcessor {
        &self.events
    }

    pub fn batch(&self) -> &BatchProcessor {
        &self.batch
    }

    /// Guardrail entry point for automated callers.
    pub fn check_automation_action(&self, action: &str) -> Result<(), CoreError> {
        guardrail::check_automation_action(action)
    }
}
