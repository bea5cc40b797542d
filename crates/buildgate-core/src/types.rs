use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Declares a status enum whose wire form is the SCREAMING_SNAKE string persisted by the
/// owning store. `parse` is the inverse of `as_str` and is what storage decoders use.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Project phase. The main sequence is ordered; ON_HOLD and CANCELLED are side branches.
    ProjectStatus {
        Planning => "PLANNING",
        Design => "DESIGN",
        Readiness => "READINESS",
        Contracting => "CONTRACTING",
        Permitting => "PERMITTING",
        Construction => "CONSTRUCTION",
        Closeout => "CLOSEOUT",
        Completed => "COMPLETED",
        OnHold => "ON_HOLD",
        Cancelled => "CANCELLED",
    }
);

impl ProjectStatus {
    /// Position on the main phase sequence, `None` for side branches.
    pub fn sequence_rank(self) -> Option<u8> {
        match self {
            Self::Planning => Some(0),
            Self::Design => Some(1),
            Self::Readiness => Some(2),
            Self::Contracting => Some(3),
            Self::Permitting => Some(4),
            Self::Construction => Some(5),
            Self::Closeout => Some(6),
            Self::Completed => Some(7),
            Self::OnHold | Self::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Projects swept by the scheduled feature/score/recommendation passes.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

wire_enum!(ContractStatus {
    Draft => "DRAFT",
    Sent => "SENT",
    PartiallySigned => "PARTIALLY_SIGNED",
    FullySigned => "FULLY_SIGNED",
    Voided => "VOIDED",
});

wire_enum!(DesignStatus {
    Draft => "DRAFT",
    InReview => "IN_REVIEW",
    ChangesRequested => "CHANGES_REQUESTED",
    Approved => "APPROVED",
    ApprovedForPermit => "APPROVED_FOR_PERMIT",
    Superseded => "SUPERSEDED",
});

wire_enum!(ReadinessStatus {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Blocked => "BLOCKED",
});

wire_enum!(EscrowStatus {
    PendingDeposit => "PENDING_DEPOSIT",
    Funded => "FUNDED",
    Closed => "CLOSED",
});

wire_enum!(MilestoneStatus {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Submitted => "SUBMITTED",
    Verified => "VERIFIED",
    Completed => "COMPLETED",
    Paid => "PAID",
});

impl MilestoneStatus {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Paid)
    }
}

wire_enum!(VerificationStatus {
    Pending => "PENDING",
    Submitted => "SUBMITTED",
    Verified => "VERIFIED",
    Rejected => "REJECTED",
});

wire_enum!(TransactionType {
    Deposit => "DEPOSIT",
    Release => "RELEASE",
    Refund => "REFUND",
});

wire_enum!(
    /// Escrow transaction lifecycle. Forward-only; COMPLETED and REJECTED are terminal.
    TransactionStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        Completed => "COMPLETED",
        Rejected => "REJECTED",
    }
);

impl TransactionStatus {
    /// A transaction that still holds the milestone's single release slot.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }

    /// A release in any state but REJECTED keeps its milestone from being released again.
    pub fn holds_milestone(self) -> bool {
        self != Self::Rejected
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Approved, Self::Approved)
                | (Self::Approved, Self::Completed)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Rejected)
        )
    }
}

wire_enum!(DisputeStatus {
    Open => "OPEN",
    InReview => "IN_REVIEW",
    Resolved => "RESOLVED",
    Closed => "CLOSED",
});

impl DisputeStatus {
    /// Active disputes freeze every escrow release on the project.
    pub fn freezes_escrow(self) -> bool {
        matches!(self, Self::Open | Self::InReview)
    }
}

wire_enum!(CloseoutStatus {
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
});

wire_enum!(TeamRole {
    Owner => "OWNER",
    ProjectManager => "PROJECT_MANAGER",
    Contractor => "CONTRACTOR",
    Designer => "DESIGNER",
    Architect => "ARCHITECT",
    Subcontractor => "SUBCONTRACTOR",
    Consultant => "CONSULTANT",
});

wire_enum!(PermitStatus {
    Draft => "DRAFT",
    Submitted => "SUBMITTED",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

wire_enum!(InviteStatus {
    Pending => "PENDING",
    Accepted => "ACCEPTED",
    Expired => "EXPIRED",
});

wire_enum!(SnapshotReason {
    Scheduled => "SCHEDULED",
    Event => "EVENT",
    Manual => "MANUAL",
});

wire_enum!(RiskLevel {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
});

wire_enum!(
    /// Recommendation lifecycle. ACTIVE is the only non-terminal state.
    RecommendationStatus {
        Active => "ACTIVE",
        Expired => "EXPIRED",
        Accepted => "ACCEPTED",
        Rejected => "REJECTED",
    }
);

/// Project lifecycle event type. Unknown types from the owning system are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    ProjectCreated,
    StatusChange,
    ContractSigned,
    DesignApproved,
    ReadinessItemCompleted,
    MilestoneOverdue,
    PaymentDelayed,
    EscrowReleaseRequested,
    EscrowReleaseApproved,
    EscrowReleaseRejected,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ProjectCreated => "PROJECT_CREATED",
            Self::StatusChange => "STATUS_CHANGE",
            Self::ContractSigned => "CONTRACT_SIGNED",
            Self::DesignApproved => "DESIGN_APPROVED",
            Self::ReadinessItemCompleted => "READINESS_ITEM_COMPLETED",
            Self::MilestoneOverdue => "MILESTONE_OVERDUE",
            Self::PaymentDelayed => "PAYMENT_DELAYED",
            Self::EscrowReleaseRequested => "ESCROW_RELEASE_REQUESTED",
            Self::EscrowReleaseApproved => "ESCROW_RELEASE_APPROVED",
            Self::EscrowReleaseRejected => "ESCROW_RELEASE_REJECTED",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PROJECT_CREATED" => Self::ProjectCreated,
            "STATUS_CHANGE" => Self::StatusChange,
            "CONTRACT_SIGNED" => Self::ContractSigned,
            "DESIGN_APPROVED" => Self::DesignApproved,
            "READINESS_ITEM_COMPLETED" => Self::ReadinessItemCompleted,
            "MILESTONE_OVERDUE" => Self::MilestoneOverdue,
            "PAYMENT_DELAYED" => Self::PaymentDelayed,
            "ESCROW_RELEASE_REQUESTED" => Self::EscrowReleaseRequested,
            "ESCROW_RELEASE_APPROVED" => Self::EscrowReleaseApproved,
            "ESCROW_RELEASE_REJECTED" => Self::EscrowReleaseRejected,
            _ => Self::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub complexity: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: ContractStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignVersion {
    pub id: String,
    pub project_id: String,
    pub version: i32,
    pub status: DesignStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessItem {
    pub id: String,
    pub title: String,
    pub required: bool,
    pub status: ReadinessStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessChecklist {
    pub id: String,
    pub project_id: String,
    pub items: Vec<ReadinessItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowAgreement {
    pub id: String,
    pub project_id: String,
    pub status: EscrowStatus,
    pub funded_amount_cents: i64,
    /// Payment-rail destination for releases (the contractor's connected account).
    pub payee_account: Option<String>,
}

impl EscrowAgreement {
    pub fn is_funded(&self) -> bool {
        self.status == EscrowStatus::Funded || self.funded_amount_cents > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub description: String,
    pub amount_cents: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationItem {
    pub id: String,
    pub title: String,
    pub status: VerificationStatus,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub project_id: String,
    pub escrow_id: String,
    pub title: String,
    pub amount_cents: i64,
    pub status: MilestoneStatus,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verification_items: Vec<VerificationItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: String,
    pub escrow_id: String,
    pub milestone_id: Option<String>,
    pub kind: TransactionType,
    pub status: TransactionStatus,
    pub amount_cents: i64,
    pub requested_by: String,
    /// Set only by a human-confirmed approval.
    pub approved_by: Option<String>,
    /// Set while an approval owns the transfer; cleared again if the transfer fails.
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub external_transfer_id: Option<String>,
    /// Optimistic-concurrency counter, bumped by every persisted update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub project_id: String,
    pub status: DisputeStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCloseout {
    pub project_id: String,
    pub status: CloseoutStatus,
    pub final_payment_released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: String,
    pub role: TeamRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitSet {
    pub id: String,
    pub project_id: String,
    pub status: PermitStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEvent {
    pub id: String,
    pub project_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub actor_id: Option<String>,
    pub features_extracted: bool,
    pub created_at: DateTime<Utc>,
}

impl ProjectEvent {
    pub fn new(project_id: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.into(),
            event_type,
            payload,
            actor_id: None,
            features_extracted: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubcontractorInvite {
    pub id: String,
    pub token: String,
    pub project_id: String,
    pub email: String,
    pub status: InviteStatus,
    pub expires_at: DateTime<Utc>,
}

/// Everything the gates and the feature extractor read for one project, loaded in one
/// repository call so every decision sees a single consistent view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: Project,
    #[serde(default)]
    pub contracts: Vec<ContractAgreement>,
    #[serde(default)]
    pub designs: Vec<DesignVersion>,
    pub readiness: Option<ReadinessChecklist>,
    pub escrow: Option<EscrowAgreement>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub disputes: Vec<Dispute>,
    pub closeout: Option<ProjectCloseout>,
    #[serde(default)]
    pub team: Vec<TeamMember>,
    #[serde(default)]
    pub permits: Vec<PermitSet>,
    #[serde(default)]
    pub status_change_count: u32,
}

impl ProjectState {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            contracts: Vec::new(),
            designs: Vec::new(),
            readiness: None,
            escrow: None,
            milestones: Vec::new(),
            disputes: Vec::new(),
            closeout: None,
            team: Vec::new(),
            permits: Vec::new(),
            status_change_count: 0,
        }
    }

    pub fn readiness_items(&self) -> &[ReadinessItem] {
        self.readiness
            .as_ref()
            .map(|checklist| checklist.items.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_signed_contract(&self) -> bool {
        self.contracts
            .iter()
            .any(|contract| contract.status == ContractStatus::FullySigned)
    }

    pub fn has_permit_approved_design(&self) -> bool {
        self.designs
            .iter()
            .any(|design| design.status == DesignStatus::ApprovedForPermit)
    }

    pub fn incomplete_required_items(&self) -> Vec<&ReadinessItem> {
        self.readiness_items()
            .iter()
            .filter(|item| item.required && item.status != ReadinessStatus::Completed)
            .collect()
    }

    pub fn has_active_dispute(&self) -> bool {
        self.disputes
            .iter()
            .any(|dispute| dispute.status.freezes_escrow())
    }
}
