//! BuildGate core: policy gates, escrow release and the feature/score/recommendation
//! pipeline for gated construction projects.
//!
//! Every decision reads current state through [`ProjectRepository`]; every mutation that
//! depends on a gate is a single atomic repository operation.

#![deny(unsafe_code)]

pub mod batch;
pub mod engine;
pub mod error;
pub mod escrow;
pub mod events;
pub mod features;
pub mod guardrail;
pub mod ledger;
pub mod memory;
pub mod payment;
pub mod phase;
pub mod policy;
pub mod postgres;
pub mod recommend;
pub mod repository;
pub mod scoring;
pub mod sinks;
pub mod storage;
pub mod types;

pub use batch::{BatchProcessor, SweepFailure, SweepPass, SweepReport};
pub use engine::{BuildGateEngine, Collaborators, EngineConfig};
pub use error::{CoreError, ErrorKind};
pub use escrow::{ApprovalRequest, EscrowReleaseMachine};
pub use events::{EventOutcome, EventProcessor};
pub use features::{extract_features, FeatureExtractor, FeatureSnapshot, ProjectFeatures};
pub use guardrail::{check_automation_action, GuardrailViolation, RestrictedAction};
pub use ledger::{AuditLedger, LedgerAuditSink};
pub use memory::{MemoryFixture, MemoryRepository};
pub use payment::PaymentRail;
pub use phase::{Initiator, PhaseGuard};
pub use policy::{PolicyGate, ReleaseBlocker, ReleaseDecision, Violation, ViolationKind};
pub use postgres::PgRepository;
pub use recommend::{
    GenerationContext, GenerativeStrategy, Recommendation, RecommendationDraft,
    RecommendationGenerator, RecommendationStrategy, Resolution, RuleBasedStrategy,
    TextGenerator,
};
pub use repository::{EventOutputs, ProjectRepository};
pub use scoring::{assess, ModelScore, RiskAssessment, RiskScorer};
pub use sinks::{
    AuditRecord, AuditSink, AuditTrail, Notification, NotificationSink, Notifier,
    TracingAuditSink, TracingNotificationSink,
};
pub use storage::StorageConfig;
pub use types::*;
