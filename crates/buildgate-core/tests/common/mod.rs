#![allow(dead_code)]

use async_trait::async_trait;
use buildgate_core::{
    BuildGateEngine, Collaborators, ContractAgreement, ContractStatus, CoreError, DesignStatus,
    DesignVersion, EngineConfig, EscrowAgreement, EscrowStatus, LedgerAuditSink,
    MemoryRepository, Milestone, MilestoneStatus, Notification, NotificationSink, PaymentRail,
    Project, ProjectState, ProjectStatus, ReadinessChecklist, ReadinessItem, ReadinessStatus,
    TextGenerator, VerificationItem, VerificationStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid timestamp")
}

pub fn escrow_id(project_id: &str) -> String {
    format!("esc-{project_id}")
}

pub fn milestone_id(project_id: &str) -> String {
    format!("ms-{project_id}")
}

/// A bare project with nothing signed, approved or funded.
pub fn bare_project(project_id: &str, status: ProjectStatus) -> ProjectState {
    ProjectState::new(Project {
        id: project_id.to_string(),
        owner_id: format!("owner-{project_id}"),
        name: format!("Project {project_id}"),
        status,
        complexity: Some("MEDIUM".to_string()),
        category: Some("residential".to_string()),
        created_at: t0(),
        updated_at: t0(),
    })
}

/// A project that passes every permit rule and has a funded escrow with one verified
/// milestone ready for release.
pub fn ready_project(project_id: &str, status: ProjectStatus) -> ProjectState {
    let mut state = bare_project(project_id, status);
    state.contracts.push(ContractAgreement {
        id: format!("ct-{project_id}"),
        project_id: project_id.to_string(),
        title: "General contract".to_string(),
        status: ContractStatus::FullySigned,
    });
    state.designs.push(DesignVersion {
        id: format!("dv-{project_id}"),
        project_id: project_id.to_string(),
        version: 1,
        status: DesignStatus::ApprovedForPermit,
    });
    state.readiness = Some(ReadinessChecklist {
        id: format!("rc-{project_id}"),
        project_id: project_id.to_string(),
        items: vec![
            readiness_item("survey", "Site survey", true, ReadinessStatus::Completed),
            readiness_item("soil", "Soil report", true, ReadinessStatus::Completed),
        ],
    });
    state.escrow = Some(EscrowAgreement {
        id: escrow_id(project_id),
        project_id: project_id.to_string(),
        status: EscrowStatus::Funded,
        funded_amount_cents: 5_000_000,
        payee_account: Some("acct_contractor_1".to_string()),
    });
    state.milestones.push(Milestone {
        id: milestone_id(project_id),
        project_id: project_id.to_string(),
        escrow_id: escrow_id(project_id),
        title: "Foundation".to_string(),
        amount_cents: 1_250_000,
        status: MilestoneStatus::Submitted,
        due_date: None,
        verification_items: vec![VerificationItem {
            id: format!("vi-{project_id}"),
            title: "Foundation inspection".to_string(),
            status: VerificationStatus::Verified,
            receipts: Vec::new(),
        }],
    });
    state
}

pub fn readiness_item(
    id: &str,
    title: &str,
    required: bool,
    status: ReadinessStatus,
) -> ReadinessItem {
    ReadinessItem {
        id: id.to_string(),
        title: title.to_string(),
        required,
        status,
    }
}

/// Payment rail that counts transfers and can be told to fail or stall.
#[derive(Debug, Default)]
pub struct CountingRail {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
    pub latency: Option<Duration>,
}

impl CountingRail {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentRail for CountingRail {
    fn rail(&self) -> &'static str {
        "counting"
    }

    async fn transfer(
        &self,
        _destination_account: &str,
        _amount_cents: i64,
        _description: &str,
    ) -> Result<String, CoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::collaborator(self.rail(), "rail unavailable"));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("tr_{n}"))
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), CoreError> {
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

pub struct Harness {
    pub engine: BuildGateEngine,
    pub repo: Arc<MemoryRepository>,
    pub rail: Arc<CountingRail>,
    pub audit: Arc<LedgerAuditSink>,
    pub notifications: Arc<RecordingNotifier>,
}

pub struct HarnessBuilder {
    projects: Vec<ProjectState>,
    rail: CountingRail,
    generator: Option<Arc<dyn TextGenerator>>,
    config: EngineConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            projects: Vec::new(),
            rail: CountingRail::default(),
            generator: None,
            config: EngineConfig {
                payment_timeout: Duration::from_secs(2),
                generation_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            },
        }
    }

    pub fn project(mut self, state: ProjectState) -> Self {
        self.projects.push(state);
        self
    }

    pub fn rail(mut self, rail: CountingRail) -> Self {
        self.rail = rail;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn payment_timeout(mut self, timeout: Duration) -> Self {
        self.config.payment_timeout = timeout;
        self
    }

    pub async fn build(self) -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        for state in self.projects {
            repo.insert_project(state).await;
        }
        let rail = Arc::new(self.rail);
        let audit = Arc::new(LedgerAuditSink::new());
        let notifications = Arc::new(RecordingNotifier::default());

        let mut collaborators = Collaborators::new(rail.clone())
            .with_audit_sink(audit.clone())
            .with_notification_sink(notifications.clone());
        if let Some(generator) = self.generator {
            collaborators = collaborators.with_text_generator(generator);
        }
        let engine = BuildGateEngine::with_repository(repo.clone(), &self.config, collaborators);

        Harness {
            engine,
            repo,
            rail,
            audit,
            notifications,
        }
    }
}

pub async fn harness_with(projects: Vec<ProjectState>) -> Harness {
    projects
        .into_iter()
        .fold(HarnessBuilder::new(), HarnessBuilder::project)
        .build()
        .await
}
