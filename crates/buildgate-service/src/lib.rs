#![deny(unsafe_code)]

use buildgate_adapters::{
    AlwaysFailPaymentRail, HttpGeneratorConfig, HttpTextGenerator, MockPaymentRail,
};
use buildgate_core::{
    BuildGateEngine, Collaborators, CoreError, EngineConfig, EventOutcome, MemoryRepository,
    PaymentRail, ProjectRepository, StorageConfig, SweepPass, SweepReport, TransactionStatus,
    Violation,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Rail that settles approved releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentRailMode {
    /// Local simulated transfers. Memory storage only.
    Mock,
    /// Every transfer fails, so approvals stay retryable until a real rail is wired in.
    Disabled,
}

impl PaymentRailMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Disabled => "disabled",
        }
    }

    /// Mock for the memory backend, disabled for anything persistent.
    pub fn default_for(storage: &StorageConfig) -> Self {
        match storage {
            StorageConfig::Memory => Self::Mock,
            _ => Self::Disabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub payment_rail: PaymentRailMode,
    /// JSON fixture seeding the memory backend.
    pub fixture: Option<PathBuf>,
    pub payment_timeout: Duration,
    /// Generative recommendations; rule-based when absent.
    pub generation: Option<HttpGeneratorConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            payment_rail: PaymentRailMode::Mock,
            fixture: None,
            payment_timeout: EngineConfig::default().payment_timeout,
            generation: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// One operator action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sweep(SweepPass),
    ProcessEvent { event_id: String },
    CheckAction { action: String },
    PermitGate { project_id: String },
    ReviewGate { project_id: String },
    ClearPaymentClaim {
        transaction_id: String,
        operator: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandOutput {
    Sweep(SweepReport),
    ProcessEvent {
        event_id: String,
        #[serde(flatten)]
        outcome: EventOutcome,
    },
    CheckAction {
        action: String,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Gate {
        gate: &'static str,
        project_id: String,
        allowed: bool,
        violations: Vec<Violation>,
    },
    ClearPaymentClaim {
        transaction_id: String,
        status: TransactionStatus,
        cleared_by: String,
    },
}

impl CommandOutput {
    /// Whether the command ran cleanly: no sweep failures, no failed event, nothing blocked.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Sweep(report) => report.failures.is_empty(),
            Self::ProcessEvent { outcome, .. } => !matches!(outcome, EventOutcome::Failed { .. }),
            Self::CheckAction { allowed, .. } | Self::Gate { allowed, .. } => *allowed,
            Self::ClearPaymentClaim { .. } => true,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<BuildGateEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let repo: Arc<dyn ProjectRepository> = match &config.fixture {
            Some(path) => {
                if config.storage != StorageConfig::Memory {
                    return Err(ServiceError::Config(format!(
                        "fixtures seed the memory backend only, storage is {}",
                        config.storage.label()
                    )));
                }
                let repo = MemoryRepository::load_fixture(path).await?;
                info!(fixture = %path.display(), "memory repository seeded from fixture");
                Arc::new(repo)
            }
            None => config.storage.bootstrap().await?,
        };
        Self::with_repository(repo, config)
    }

    pub fn with_repository(
        repo: Arc<dyn ProjectRepository>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        let rail: Arc<dyn PaymentRail> = match config.payment_rail {
            PaymentRailMode::Mock if config.storage != StorageConfig::Memory => {
                return Err(ServiceError::Config(format!(
                    "the mock payment rail is limited to memory storage, storage is {}",
                    config.storage.label()
                )))
            }
            PaymentRailMode::Mock => Arc::new(MockPaymentRail::new()),
            PaymentRailMode::Disabled => Arc::new(AlwaysFailPaymentRail::new(
                "disabled",
                "no payment rail is configured for this deployment",
            )),
        };
        info!(rail = config.payment_rail.label(), "payment rail selected");
        let mut collaborators = Collaborators::new(rail);
        if let Some(generation) = config.generation {
            let generator = HttpTextGenerator::new(generation)?;
            info!(endpoint = %generator.url(), "generative recommendations enabled");
            collaborators = collaborators.with_text_generator(Arc::new(generator));
        }

        let engine_config = EngineConfig {
            storage: config.storage,
            payment_timeout: config.payment_timeout,
            ..EngineConfig::default()
        };
        let engine = BuildGateEngine::with_repository(repo, &engine_config, collaborators);
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub async fn execute(&self, command: Command) -> Result<CommandOutput, ServiceError> {
        match command {
            Command::Sweep(pass) => {
                let report = self.engine.batch().run(pass).await?;
                info!(
                    pass = pass.as_str(),
                    processed = report.processed,
                    failures = report.failures.len(),
                    expired = report.expired,
                    "sweep finished"
                );
                Ok(CommandOutput::Sweep(report))
            }
            Command::ProcessEvent { event_id } => {
                let outcome = self.engine.events().process(&event_id).await;
                Ok(CommandOutput::ProcessEvent { event_id, outcome })
            }
            Command::CheckAction { action } => {
                match self.engine.check_automation_action(&action) {
                    Ok(()) => Ok(CommandOutput::CheckAction {
                        action,
                        allowed: true,
                        code: None,
                        message: None,
                    }),
                    Err(CoreError::Guardrail { violation, message }) => {
                        Ok(CommandOutput::CheckAction {
                            action,
                            allowed: false,
                            code: Some(violation.code().to_string()),
                            message: Some(message),
                        })
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Command::PermitGate { project_id } => {
                let violations = self
                    .engine
                    .policy()
                    .check_permit_submission(&project_id)
                    .await?;
                Ok(gate_output("permit_submission", project_id, violations))
            }
            Command::ReviewGate { project_id } => {
                let violations = self
                    .engine
                    .policy()
                    .check_review_submission(&project_id)
                    .await?;
                Ok(gate_output("review_submission", project_id, violations))
            }
            Command::ClearPaymentClaim {
                transaction_id,
                operator,
                reason,
            } => {
                let cleared = self
                    .engine
                    .escrow()
                    .clear_payment_claim(&transaction_id, &operator, &reason)
                    .await?;
                Ok(CommandOutput::ClearPaymentClaim {
                    transaction_id,
                    status: cleared.status,
                    cleared_by: operator,
                })
            }
        }
    }
}

fn gate_output(gate: &'static str, project_id: String, violations: Vec<Violation>) -> CommandOutput {
    CommandOutput::Gate {
        gate,
        project_id,
        allowed: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgate_core::{
        ErrorKind, Project, ProjectEvent, ProjectState, ProjectStatus, EventType, ViolationKind,
    };
    use chrono::Utc;
    use serde_json::json;

    fn project(id: &str, status: ProjectStatus) -> ProjectState {
        let now = Utc::now();
        ProjectState::new(Project {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            name: "Garage conversion".to_string(),
            status,
            complexity: None,
            category: Some("renovation".to_string()),
            created_at: now,
            updated_at: now,
        })
    }

    async fn service_with(projects: Vec<ProjectState>) -> (ServiceState, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        for state in projects {
            repo.insert_project(state).await;
        }
        let service = ServiceState::with_repository(repo.clone(), ServiceConfig::default())
            .expect("service");
        (service, repo)
    }

    #[tokio::test]
    async fn check_action_reports_guardrail_code() {
        let (service, _) = service_with(Vec::new()).await;

        let blocked = service
            .execute(Command::CheckAction {
                action: "release_funds".to_string(),
            })
            .await
            .unwrap();
        assert!(!blocked.is_success());
        let rendered = serde_json::to_value(&blocked).unwrap();
        assert_eq!(rendered["command"], "check_action");
        assert_eq!(rendered["code"], "AUTOMATION_ACTION_BLOCKED");

        let allowed = service
            .execute(Command::CheckAction {
                action: "SEND_REMINDER".to_string(),
            })
            .await
            .unwrap();
        assert!(allowed.is_success());
        assert!(serde_json::to_value(&allowed).unwrap().get("code").is_none());
    }

    #[tokio::test]
    async fn gates_list_violations_for_bare_project() {
        let (service, _) = service_with(vec![project("p-1", ProjectStatus::Planning)]).await;

        let permit = service
            .execute(Command::PermitGate {
                project_id: "p-1".to_string(),
            })
            .await
            .unwrap();
        match &permit {
            CommandOutput::Gate {
                allowed,
                violations,
                ..
            } => {
                assert!(!allowed);
                let kinds: Vec<_> = violations.iter().map(|v| v.kind).collect();
                assert_eq!(
                    kinds,
                    vec![ViolationKind::ContractNotSigned, ViolationKind::DesignNotApproved]
                );
            }
            other => panic!("unexpected output {other:?}"),
        }

        let review = service
            .execute(Command::ReviewGate {
                project_id: "p-1".to_string(),
            })
            .await
            .unwrap();
        let rendered = serde_json::to_value(&review).unwrap();
        assert_eq!(rendered["gate"], "review_submission");
        assert_eq!(rendered["violations"].as_array().unwrap().len(), 3);
        assert_eq!(rendered["violations"][0]["type"], "PROJECT_NOT_COMPLETED");
    }

    #[tokio::test]
    async fn gate_on_unknown_project_is_not_found() {
        let (service, _) = service_with(Vec::new()).await;
        let err = service
            .execute(Command::PermitGate {
                project_id: "missing".to_string(),
            })
            .await
            .unwrap_err();
        match err {
            ServiceError::Core(core) => assert_eq!(core.kind(), ErrorKind::NotFound),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn process_event_then_replay_is_already_processed() {
        let (service, repo) = service_with(vec![project("p-2", ProjectStatus::Design)]).await;
        let event = ProjectEvent::new("p-2", EventType::ContractSigned, json!({}));
        repo.append_event(&event).await.unwrap();

        let first = service
            .execute(Command::ProcessEvent {
                event_id: event.id.clone(),
            })
            .await
            .unwrap();
        assert!(first.is_success());
        let rendered = serde_json::to_value(&first).unwrap();
        assert_eq!(rendered["outcome"], "processed");

        let replay = service
            .execute(Command::ProcessEvent {
                event_id: event.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            replay,
            CommandOutput::ProcessEvent {
                event_id: event.id.clone(),
                outcome: EventOutcome::AlreadyProcessed,
            }
        );
    }

    #[tokio::test]
    async fn daily_sweep_covers_active_projects_only() {
        let (service, repo) = service_with(vec![
            project("p-3", ProjectStatus::Construction),
            project("p-4", ProjectStatus::Completed),
        ])
        .await;

        let output = service.execute(Command::Sweep(SweepPass::Daily)).await.unwrap();
        assert!(output.is_success());
        match output {
            CommandOutput::Sweep(report) => assert_eq!(report.processed, 1),
            other => panic!("unexpected output {other:?}"),
        }
        assert_eq!(repo.snapshots("p-3").await.unwrap().len(), 1);
        assert!(repo.snapshots("p-4").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fixture_requires_memory_storage() {
        let config = ServiceConfig {
            storage: StorageConfig::postgres("postgres://localhost/buildgate", 2),
            fixture: Some(PathBuf::from("fixture.json")),
            ..ServiceConfig::default()
        };
        let err = ServiceState::bootstrap(config).await.err().expect("config error");
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn mock_rail_is_refused_outside_memory_storage() {
        let storage = StorageConfig::postgres("postgres://localhost/buildgate", 2);
        assert_eq!(
            PaymentRailMode::default_for(&storage),
            PaymentRailMode::Disabled
        );
        assert_eq!(
            PaymentRailMode::default_for(&StorageConfig::Memory),
            PaymentRailMode::Mock
        );

        let repo: Arc<dyn ProjectRepository> = Arc::new(MemoryRepository::new());
        let config = ServiceConfig {
            storage: storage.clone(),
            payment_rail: PaymentRailMode::Mock,
            ..ServiceConfig::default()
        };
        let err = ServiceState::with_repository(repo.clone(), config)
            .err()
            .expect("config error");
        assert!(matches!(err, ServiceError::Config(_)));

        let config = ServiceConfig {
            storage,
            payment_rail: PaymentRailMode::Disabled,
            ..ServiceConfig::default()
        };
        assert!(ServiceState::with_repository(repo, config).is_ok());
    }

    #[tokio::test]
    async fn clearing_a_claim_on_an_unknown_transaction_is_not_found() {
        let (service, _) = service_with(Vec::new()).await;
        let err = service
            .execute(Command::ClearPaymentClaim {
                transaction_id: "tx-missing".to_string(),
                operator: "ops-1".to_string(),
                reason: "rail shows no transfer".to_string(),
            })
            .await
            .unwrap_err();
        match err {
            ServiceError::Core(core) => assert_eq!(core.kind(), ErrorKind::NotFound),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn bootstraps_from_fixture_file() {
        let path = std::env::temp_dir().join(format!("buildgate-{}.json", uuid::Uuid::new_v4()));
        let now = Utc::now().to_rfc3339();
        let fixture = json!({
            "projects": [{
                "project": {
                    "id": "p-fixture",
                    "owner_id": "owner-9",
                    "name": "Kitchen remodel",
                    "status": "PERMITTING",
                    "created_at": now,
                    "updated_at": now,
                }
            }]
        });
        tokio::fs::write(&path, fixture.to_string()).await.unwrap();

        let service = ServiceState::bootstrap(ServiceConfig {
            fixture: Some(path.clone()),
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        let output = service
            .execute(Command::PermitGate {
                project_id: "p-fixture".to_string(),
            })
            .await
            .unwrap();
        assert!(!output.is_success());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
