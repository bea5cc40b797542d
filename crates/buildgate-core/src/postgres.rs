use crate::error::CoreError;
use crate::features::{FeatureSnapshot, ProjectFeatures};
use crate::policy::ReleaseBlocker;
use crate::recommend::Recommendation;
use crate::repository::{release_slot_taken, EventOutputs, ProjectRepository};
use crate::scoring::{ModelScore, ScoreExplanation};
use crate::types::{
    CloseoutStatus, ContractAgreement, ContractStatus, Dispute, DisputeStatus, DesignStatus,
    DesignVersion, EscrowAgreement, EscrowStatus, EscrowTransaction, EventType, InviteStatus,
    Milestone, MilestoneStatus, PermitSet, PermitStatus, Project, ProjectCloseout, ProjectEvent,
    ProjectState, ProjectStatus, ReadinessChecklist, ReadinessItem, ReadinessStatus, Receipt,
    RecommendationStatus, RiskLevel, SnapshotReason, SubcontractorInvite, TeamMember, TeamRole,
    TransactionStatus, TransactionType, VerificationItem, VerificationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::collections::HashMap;
use tracing::debug;

const SCHEMA: &str = include_str!("../sql/schema.sql");

const PROJECT_COLUMNS: &str =
    "id, owner_id, name, status, complexity, category, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, escrow_id, milestone_id, type, status, amount_cents, \
     requested_by, approved_by, approved_at, completed_at, rejected_by, rejection_reason, \
     external_transfer_id, version, created_at";
const EVENT_COLUMNS: &str =
    "id, project_id, event_type, payload, actor_id, features_extracted, created_at";
const RECOMMENDATION_COLUMNS: &str = "id, project_id, snapshot_id, title, description, \
     priority, reasoning, confidence, estimated_impact, estimated_effort, strategy, status, \
     created_at, expires_at";

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> CoreError {
    move |e| CoreError::Storage(format!("postgres {context} failed: {e}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn col<'r, T>(row: &'r PgRow, column: &str) -> Result<T, CoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| CoreError::Storage(format!("postgres decode {column} failed: {e}")))
}

fn wire<E>(row: &PgRow, column: &str, parse: fn(&str) -> Option<E>) -> Result<E, CoreError> {
    let raw: String = col(row, column)?;
    parse(&raw)
        .ok_or_else(|| CoreError::Storage(format!("unknown {column} '{raw}' in postgres")))
}

fn project_from_row(row: &PgRow) -> Result<Project, CoreError> {
    Ok(Project {
        id: col(row, "id")?,
        owner_id: col(row, "owner_id")?,
        name: col(row, "name")?,
        status: wire(row, "status", ProjectStatus::parse)?,
        complexity: col(row, "complexity")?,
        category: col(row, "category")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<EscrowTransaction, CoreError> {
    Ok(EscrowTransaction {
        id: col(row, "id")?,
        escrow_id: col(row, "escrow_id")?,
        milestone_id: col(row, "milestone_id")?,
        kind: wire(row, "type", TransactionType::parse)?,
        status: wire(row, "status", TransactionStatus::parse)?,
        amount_cents: col(row, "amount_cents")?,
        requested_by: col(row, "requested_by")?,
        approved_by: col(row, "approved_by")?,
        approved_at: col(row, "approved_at")?,
        completed_at: col(row, "completed_at")?,
        rejected_by: col(row, "rejected_by")?,
        rejection_reason: col(row, "rejection_reason")?,
        external_transfer_id: col(row, "external_transfer_id")?,
        version: col(row, "version")?,
        created_at: col(row, "created_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<ProjectEvent, CoreError> {
    let event_type: String = col(row, "event_type")?;
    Ok(ProjectEvent {
        id: col(row, "id")?,
        project_id: col(row, "project_id")?,
        event_type: EventType::from(event_type),
        payload: col(row, "payload")?,
        actor_id: col(row, "actor_id")?,
        features_extracted: col(row, "features_extracted")?,
        created_at: col(row, "created_at")?,
    })
}

fn invite_from_row(row: &PgRow) -> Result<SubcontractorInvite, CoreError> {
    Ok(SubcontractorInvite {
        id: col(row, "id")?,
        token: col(row, "token")?,
        project_id: col(row, "project_id")?,
        email: col(row, "email")?,
        status: wire(row, "status", InviteStatus::parse)?,
        expires_at: col(row, "expires_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<FeatureSnapshot, CoreError> {
    let features: ProjectFeatures = serde_json::from_value(col(row, "feature_data")?)?;
    Ok(FeatureSnapshot {
        id: col(row, "id")?,
        project_id: col(row, "project_id")?,
        reason: wire(row, "snapshot_reason", SnapshotReason::parse)?,
        feature_version: col(row, "feature_version")?,
        features,
        source_event_id: col(row, "source_event_id")?,
        created_at: col(row, "created_at")?,
    })
}

fn score_from_row(row: &PgRow) -> Result<ModelScore, CoreError> {
    let explanation: ScoreExplanation = serde_json::from_value(col(row, "explanation")?)?;
    Ok(ModelScore {
        id: col(row, "id")?,
        project_id: col(row, "project_id")?,
        snapshot_id: col(row, "snapshot_id")?,
        model_name: col(row, "model_name")?,
        model_version: col(row, "model_version")?,
        score: col(row, "score")?,
        risk_level: wire(row, "risk_level", RiskLevel::parse)?,
        confidence: col(row, "confidence")?,
        explanation,
        created_at: col(row, "created_at")?,
    })
}

fn recommendation_from_row(row: &PgRow) -> Result<Recommendation, CoreError> {
    let priority: i16 = col(row, "priority")?;
    Ok(Recommendation {
        id: col(row, "id")?,
        project_id: col(row, "project_id")?,
        snapshot_id: col(row, "snapshot_id")?,
        title: col(row, "title")?,
        description: col(row, "description")?,
        priority: u8::try_from(priority).map_err(|_| {
            CoreError::Storage(format!("recommendation priority {priority} out of range"))
        })?,
        reasoning: col(row, "reasoning")?,
        confidence: col(row, "confidence")?,
        estimated_impact: col(row, "estimated_impact")?,
        estimated_effort: col(row, "estimated_effort")?,
        strategy: col(row, "strategy")?,
        status: wire(row, "status", RecommendationStatus::parse)?,
        created_at: col(row, "created_at")?,
        expires_at: col(row, "expires_at")?,
    })
}

/// Load milestones with their verification items and receipts, filtered on one
/// milestone column (`id` or `project_id`).
async fn load_milestones(
    conn: &mut PgConnection,
    filter_column: &'static str,
    value: &str,
) -> Result<Vec<Milestone>, CoreError> {
    let rows = sqlx::query(&format!(
        "SELECT id, project_id, escrow_id, title, amount_cents, status, due_date \
         FROM milestones WHERE {filter_column} = $1 ORDER BY id"
    ))
    .bind(value)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("load milestones"))?;

    let item_rows = sqlx::query(&format!(
        "SELECT vi.id, vi.milestone_id, vi.title, vi.status \
         FROM verification_items vi JOIN milestones m ON m.id = vi.milestone_id \
         WHERE m.{filter_column} = $1 ORDER BY vi.id"
    ))
    .bind(value)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("load verification items"))?;

    let receipt_rows = sqlx::query(&format!(
        "SELECT r.id, r.verification_item_id, r.description, r.amount_cents, r.uploaded_at \
         FROM receipts r \
         JOIN verification_items vi ON vi.id = r.verification_item_id \
         JOIN milestones m ON m.id = vi.milestone_id \
         WHERE m.{filter_column} = $1 ORDER BY r.uploaded_at, r.id"
    ))
    .bind(value)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("load receipts"))?;

    let mut receipts: HashMap<String, Vec<Receipt>> = HashMap::new();
    for row in &receipt_rows {
        let item_id: String = col(row, "verification_item_id")?;
        receipts.entry(item_id).or_default().push(Receipt {
            id: col(row, "id")?,
            description: col(row, "description")?,
            amount_cents: col(row, "amount_cents")?,
            uploaded_at: col(row, "uploaded_at")?,
        });
    }

    let mut items: HashMap<String, Vec<VerificationItem>> = HashMap::new();
    for row in &item_rows {
        let milestone_id: String = col(row, "milestone_id")?;
        let id: String = col(row, "id")?;
        items.entry(milestone_id).or_default().push(VerificationItem {
            receipts: receipts.remove(&id).unwrap_or_default(),
            id,
            title: col(row, "title")?,
            status: wire(row, "status", VerificationStatus::parse)?,
        });
    }

    let mut milestones = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = col(row, "id")?;
        milestones.push(Milestone {
            verification_items: items.remove(&id).unwrap_or_default(),
            id,
            project_id: col(row, "project_id")?,
            escrow_id: col(row, "escrow_id")?,
            title: col(row, "title")?,
            amount_cents: col(row, "amount_cents")?,
            status: wire(row, "status", MilestoneStatus::parse)?,
            due_date: col(row, "due_date")?,
        });
    }
    Ok(milestones)
}

async fn dispute_active_on(conn: &mut PgConnection, project_id: &str) -> Result<bool, CoreError> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM disputes WHERE project_id = $1 AND status IN ('OPEN', 'IN_REVIEW'))",
    )
    .bind(project_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err("dispute lookup"))
}

async fn insert_event_on(conn: &mut PgConnection, event: &ProjectEvent) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO project_events (
            id, project_id, event_type, payload, actor_id, features_extracted, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&event.id)
    .bind(&event.project_id)
    .bind(event.event_type.as_str())
    .bind(&event.payload)
    .bind(&event.actor_id)
    .bind(event.features_extracted)
    .bind(event.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CoreError::Conflict(format!("event {} already exists", event.id))
        } else {
            db_err("insert event")(e)
        }
    })?;
    Ok(())
}

async fn insert_snapshot_on(
    conn: &mut PgConnection,
    snapshot: &FeatureSnapshot,
) -> Result<(), CoreError> {
    let features = serde_json::to_value(&snapshot.features)?;
    sqlx::query(
        r#"
        INSERT INTO ml_feature_snapshots (
            id, project_id, snapshot_reason, feature_version, feature_data, source_event_id,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.project_id)
    .bind(snapshot.reason.as_str())
    .bind(&snapshot.feature_version)
    .bind(features)
    .bind(&snapshot.source_event_id)
    .bind(snapshot.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("insert snapshot"))?;
    Ok(())
}

async fn insert_score_on(conn: &mut PgConnection, score: &ModelScore) -> Result<(), CoreError> {
    let explanation = serde_json::to_value(&score.explanation)?;
    sqlx::query(
        r#"
        INSERT INTO model_scores (
            id, project_id, snapshot_id, model_name, model_version, score, risk_level,
            confidence, explanation, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&score.id)
    .bind(&score.project_id)
    .bind(&score.snapshot_id)
    .bind(&score.model_name)
    .bind(&score.model_version)
    .bind(score.score)
    .bind(score.risk_level.as_str())
    .bind(score.confidence)
    .bind(explanation)
    .bind(score.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("insert score"))?;
    Ok(())
}

async fn insert_recommendation_on(
    conn: &mut PgConnection,
    recommendation: &Recommendation,
) -> Result<(), CoreError> {
    sqlx::query(&format!(
        "INSERT INTO recommendations ({RECOMMENDATION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
    ))
    .bind(&recommendation.id)
    .bind(&recommendation.project_id)
    .bind(&recommendation.snapshot_id)
    .bind(&recommendation.title)
    .bind(&recommendation.description)
    .bind(i16::from(recommendation.priority))
    .bind(&recommendation.reasoning)
    .bind(recommendation.confidence)
    .bind(&recommendation.estimated_impact)
    .bind(&recommendation.estimated_effort)
    .bind(&recommendation.strategy)
    .bind(recommendation.status.as_str())
    .bind(recommendation.created_at)
    .bind(recommendation.expires_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("insert recommendation"))?;
    Ok(())
}

/// PostgreSQL-backed repository. Multi-statement operations run in one database
/// transaction; the open-release invariant is also held by a partial unique index.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Storage(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create core-owned tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), CoreError> {
        for statement in SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
        {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err("schema create"))?;
        }
        debug!("postgres schema ensured");
        Ok(())
    }

    async fn load_state(
        conn: &mut PgConnection,
        project_id: &str,
    ) -> Result<ProjectState, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(project_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("load project"))?
        .ok_or_else(|| CoreError::not_found("project", project_id))?;
        let mut state = ProjectState::new(project_from_row(&row)?);

        for row in sqlx::query(
            "SELECT id, project_id, title, status FROM contract_agreements WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load contracts"))?
        {
            state.contracts.push(ContractAgreement {
                id: col(&row, "id")?,
                project_id: col(&row, "project_id")?,
                title: col(&row, "title")?,
                status: wire(&row, "status", ContractStatus::parse)?,
            });
        }

        for row in sqlx::query(
            "SELECT id, project_id, version, status FROM design_versions WHERE project_id = $1 ORDER BY version",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load designs"))?
        {
            state.designs.push(DesignVersion {
                id: col(&row, "id")?,
                project_id: col(&row, "project_id")?,
                version: col(&row, "version")?,
                status: wire(&row, "status", DesignStatus::parse)?,
            });
        }

        let checklist = sqlx::query("SELECT id FROM readiness_checklists WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err("load readiness checklist"))?;
        if let Some(checklist) = checklist {
            let checklist_id: String = col(&checklist, "id")?;
            let mut items = Vec::new();
            for row in sqlx::query(
                "SELECT id, title, required, status FROM readiness_items WHERE checklist_id = $1 ORDER BY position, id",
            )
            .bind(&checklist_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err("load readiness items"))?
            {
                items.push(ReadinessItem {
                    id: col(&row, "id")?,
                    title: col(&row, "title")?,
                    required: col(&row, "required")?,
                    status: wire(&row, "status", ReadinessStatus::parse)?,
                });
            }
            state.readiness = Some(ReadinessChecklist {
                id: checklist_id,
                project_id: project_id.to_string(),
                items,
            });
        }

        let escrow = sqlx::query(
            "SELECT id, project_id, status, funded_amount_cents, payee_account FROM escrow_agreements WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("load escrow"))?;
        if let Some(row) = escrow {
            state.escrow = Some(escrow_from_row(&row)?);
        }

        state.milestones = load_milestones(conn, "project_id", project_id).await?;

        for row in sqlx::query(
            "SELECT id, project_id, status, reason FROM disputes WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load disputes"))?
        {
            state.disputes.push(Dispute {
                id: col(&row, "id")?,
                project_id: col(&row, "project_id")?,
                status: wire(&row, "status", DisputeStatus::parse)?,
                reason: col(&row, "reason")?,
            });
        }

        let closeout = sqlx::query(
            "SELECT project_id, status, final_payment_released FROM project_closeouts WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("load closeout"))?;
        if let Some(row) = closeout {
            state.closeout = Some(ProjectCloseout {
                project_id: col(&row, "project_id")?,
                status: wire(&row, "status", CloseoutStatus::parse)?,
                final_payment_released: col(&row, "final_payment_released")?,
            });
        }

        for row in sqlx::query(
            "SELECT user_id, role FROM project_team_members WHERE project_id = $1 ORDER BY user_id, role",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load team"))?
        {
            state.team.push(TeamMember {
                user_id: col(&row, "user_id")?,
                role: wire(&row, "role", TeamRole::parse)?,
            });
        }

        for row in sqlx::query(
            "SELECT id, project_id, status FROM permit_sets WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("load permits"))?
        {
            state.permits.push(PermitSet {
                id: col(&row, "id")?,
                project_id: col(&row, "project_id")?,
                status: wire(&row, "status", PermitStatus::parse)?,
            });
        }

        let status_changes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM project_events WHERE project_id = $1 AND event_type = 'STATUS_CHANGE'",
        )
        .bind(project_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("count status changes"))?;
        state.status_change_count = u32::try_from(status_changes).unwrap_or(u32::MAX);

        Ok(state)
    }
}

fn escrow_from_row(row: &PgRow) -> Result<EscrowAgreement, CoreError> {
    Ok(EscrowAgreement {
        id: col(row, "id")?,
        project_id: col(row, "project_id")?,
        status: wire(row, "status", EscrowStatus::parse)?,
        funded_amount_cents: col(row, "funded_amount_cents")?,
        payee_account: col(row, "payee_account")?,
    })
}

#[async_trait]
impl ProjectRepository for PgRepository {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn project_state(&self, project_id: &str) -> Result<ProjectState, CoreError> {
        // One snapshot-isolated read so the gates see a consistent view.
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err("set isolation"))?;
        let state = Self::load_state(&mut tx, project_id).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(state)
    }

    async fn project(&self, project_id: &str) -> Result<Option<Project>, CoreError> {
        sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load project"))?
        .map(|row| project_from_row(&row))
        .transpose()
    }

    async fn update_project_status(
        &self,
        project_id: &str,
        expected: ProjectStatus,
        next: ProjectStatus,
        event: &ProjectEvent,
    ) -> Result<Project, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let row = sqlx::query(&format!(
            "UPDATE projects SET status = $3, updated_at = $4 \
             WHERE id = $1 AND status = $2 RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(project_id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("update project status"))?;

        let Some(row) = row else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM projects WHERE id = $1)")
                    .bind(project_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err("project lookup"))?;
            return Err(if exists {
                CoreError::Conflict(format!(
                    "project {project_id} is no longer {expected}"
                ))
            } else {
                CoreError::not_found("project", project_id)
            });
        };
        let project = project_from_row(&row)?;
        insert_event_on(&mut tx, event).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(project)
    }

    async fn active_project_ids(&self) -> Result<Vec<String>, CoreError> {
        sqlx::query_scalar(
            "SELECT id FROM projects WHERE status NOT IN ('COMPLETED', 'CANCELLED') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list active projects"))
    }

    async fn escrow(&self, escrow_id: &str) -> Result<Option<EscrowAgreement>, CoreError> {
        sqlx::query(
            "SELECT id, project_id, status, funded_amount_cents, payee_account FROM escrow_agreements WHERE id = $1",
        )
        .bind(escrow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load escrow"))?
        .map(|row| escrow_from_row(&row))
        .transpose()
    }

    async fn milestone(&self, milestone_id: &str) -> Result<Option<Milestone>, CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        Ok(load_milestones(&mut conn, "id", milestone_id)
            .await?
            .into_iter()
            .next())
    }

    async fn has_active_dispute(&self, project_id: &str) -> Result<bool, CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        dispute_active_on(&mut conn, project_id).await
    }

    async fn invite_by_token(
        &self,
        token: &str,
    ) -> Result<Option<SubcontractorInvite>, CoreError> {
        sqlx::query(
            "SELECT id, token, project_id, email, status, expires_at FROM subcontractor_invites WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load invite"))?
        .map(|row| invite_from_row(&row))
        .transpose()
    }

    async fn expire_invite(&self, invite_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE subcontractor_invites SET status = 'EXPIRED' WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(invite_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("expire invite"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_release(
        &self,
        transaction: &EscrowTransaction,
        event: &ProjectEvent,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;

        // Row lock serializes concurrent requests against the same escrow.
        let project_id: String = sqlx::query_scalar(
            "SELECT project_id FROM escrow_agreements WHERE id = $1 FOR UPDATE",
        )
        .bind(&transaction.escrow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("lock escrow"))?
        .ok_or_else(|| CoreError::not_found("escrow", &transaction.escrow_id))?;

        if dispute_active_on(&mut tx, &project_id).await? {
            return Err(CoreError::ReleaseBlocked {
                blocker: ReleaseBlocker::DisputeFreeze,
                reason: "escrow is frozen while the project has an active dispute".to_string(),
            });
        }

        let held: Option<String> = sqlx::query_scalar(
            "SELECT status FROM escrow_transactions \
             WHERE milestone_id = $1 AND type = 'RELEASE' AND status <> 'REJECTED' \
             ORDER BY created_at LIMIT 1",
        )
        .bind(&transaction.milestone_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("release slot lookup"))?;
        if let Some(status) = held {
            let status = TransactionStatus::parse(&status).ok_or_else(|| {
                CoreError::Storage(format!("unknown transaction status {status}"))
            })?;
            return Err(release_slot_taken(transaction, status));
        }

        sqlx::query(&format!(
            "INSERT INTO escrow_transactions ({TRANSACTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(&transaction.id)
        .bind(&transaction.escrow_id)
        .bind(&transaction.milestone_id)
        .bind(transaction.kind.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.amount_cents)
        .bind(&transaction.requested_by)
        .bind(&transaction.approved_by)
        .bind(transaction.approved_at)
        .bind(transaction.completed_at)
        .bind(&transaction.rejected_by)
        .bind(&transaction.rejection_reason)
        .bind(&transaction.external_transfer_id)
        .bind(transaction.version)
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                release_slot_taken(transaction, TransactionStatus::Pending)
            } else {
                db_err("insert release")(e)
            }
        })?;

        insert_event_on(&mut tx, event).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(())
    }

    async fn transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<EscrowTransaction>, CoreError> {
        sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM escrow_transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load transaction"))?
        .map(|row| transaction_from_row(&row))
        .transpose()
    }

    async fn transactions_for_milestone(
        &self,
        milestone_id: &str,
    ) -> Result<Vec<EscrowTransaction>, CoreError> {
        sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM escrow_transactions \
             WHERE milestone_id = $1 ORDER BY created_at"
        ))
        .bind(milestone_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list transactions"))?
        .iter()
        .map(transaction_from_row)
        .collect()
    }

    async fn update_transaction(
        &self,
        updated: &EscrowTransaction,
        expected_version: i64,
        event: Option<&ProjectEvent>,
    ) -> Result<EscrowTransaction, CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let row = sqlx::query(&format!(
            "UPDATE escrow_transactions SET \
                 status = $3, approved_by = $4, approved_at = $5, completed_at = $6, \
                 rejected_by = $7, rejection_reason = $8, external_transfer_id = $9, \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(&updated.id)
        .bind(expected_version)
        .bind(updated.status.as_str())
        .bind(&updated.approved_by)
        .bind(updated.approved_at)
        .bind(updated.completed_at)
        .bind(&updated.rejected_by)
        .bind(&updated.rejection_reason)
        .bind(&updated.external_transfer_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::Conflict(format!(
                    "milestone {} already has an open release",
                    updated.milestone_id.as_deref().unwrap_or("-")
                ))
            } else {
                db_err("update transaction")(e)
            }
        })?;

        let Some(row) = row else {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM escrow_transactions WHERE id = $1)",
            )
            .bind(&updated.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("transaction lookup"))?;
            return Err(if exists {
                CoreError::Conflict(format!(
                    "escrow transaction {} was modified concurrently (expected version {})",
                    updated.id, expected_version
                ))
            } else {
                CoreError::not_found("escrow_transaction", &updated.id)
            });
        };
        let stored = transaction_from_row(&row)?;

        if let Some(event) = event {
            insert_event_on(&mut tx, event).await?;
        }
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(stored)
    }

    async fn append_event(&self, event: &ProjectEvent) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        insert_event_on(&mut conn, event).await
    }

    async fn event(&self, event_id: &str) -> Result<Option<ProjectEvent>, CoreError> {
        sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM project_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load event"))?
        .map(|row| event_from_row(&row))
        .transpose()
    }

    async fn events(&self, project_id: &str) -> Result<Vec<ProjectEvent>, CoreError> {
        sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM project_events WHERE project_id = $1 ORDER BY created_at, id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list events"))?
        .iter()
        .map(event_from_row)
        .collect()
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outputs: &EventOutputs,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let flipped = sqlx::query(
            "UPDATE project_events SET features_extracted = TRUE WHERE id = $1 AND features_extracted = FALSE",
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("mark event processed"))?
        .rows_affected();

        if flipped == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM project_events WHERE id = $1)")
                    .bind(event_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err("event lookup"))?;
            return Err(if exists {
                CoreError::Conflict(format!("event {event_id} was already processed"))
            } else {
                CoreError::not_found("event", event_id)
            });
        }

        insert_snapshot_on(&mut tx, &outputs.snapshot).await?;
        if let Some(score) = &outputs.score {
            insert_score_on(&mut tx, score).await?;
        }
        if let Some(recommendation) = &outputs.recommendation {
            insert_recommendation_on(&mut tx, recommendation).await?;
        }
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &FeatureSnapshot) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        insert_snapshot_on(&mut conn, snapshot).await
    }

    async fn snapshots(&self, project_id: &str) -> Result<Vec<FeatureSnapshot>, CoreError> {
        sqlx::query(
            "SELECT id, project_id, snapshot_reason, feature_version, feature_data, source_event_id, created_at \
             FROM ml_feature_snapshots WHERE project_id = $1 ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list snapshots"))?
        .iter()
        .map(snapshot_from_row)
        .collect()
    }

    async fn insert_score(&self, score: &ModelScore) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        insert_score_on(&mut conn, score).await
    }

    async fn scores(&self, project_id: &str) -> Result<Vec<ModelScore>, CoreError> {
        sqlx::query(
            "SELECT id, project_id, snapshot_id, model_name, model_version, score, risk_level, \
             confidence, explanation, created_at \
             FROM model_scores WHERE project_id = $1 ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list scores"))?
        .iter()
        .map(score_from_row)
        .collect()
    }

    async fn insert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        insert_recommendation_on(&mut conn, recommendation).await
    }

    async fn recommendation(
        &self,
        recommendation_id: &str,
    ) -> Result<Option<Recommendation>, CoreError> {
        sqlx::query(&format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE id = $1"
        ))
        .bind(recommendation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load recommendation"))?
        .map(|row| recommendation_from_row(&row))
        .transpose()
    }

    async fn recommendations(
        &self,
        project_id: &str,
    ) -> Result<Vec<Recommendation>, CoreError> {
        sqlx::query(&format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
             WHERE project_id = $1 ORDER BY created_at, id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list recommendations"))?
        .iter()
        .map(recommendation_from_row)
        .collect()
    }

    async fn transition_recommendation(
        &self,
        recommendation_id: &str,
        status: RecommendationStatus,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE recommendations SET status = $2 WHERE id = $1 AND status = 'ACTIVE'",
        )
        .bind(recommendation_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("transition recommendation"))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM recommendations WHERE id = $1)")
                .bind(recommendation_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err("recommendation lookup"))?;
        if exists {
            Ok(false)
        } else {
            Err(CoreError::not_found("recommendation", recommendation_id))
        }
    }

    async fn expire_recommendations(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE recommendations SET status = 'EXPIRED' WHERE status = 'ACTIVE' AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("expire recommendations"))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statements_split_cleanly() {
        let statements: Vec<_> = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
            .collect();
        assert!(statements.iter().any(|statement| {
            statement.contains("ux_escrow_transactions_milestone_release")
                && statement.contains("status <> 'REJECTED'")
        }));
        assert!(statements.iter().all(|statement| {
            statement.starts_with("CREATE")
                || statement.starts_with("DROP INDEX")
                || statement.starts_with("--")
        }));
        // A comment line never carries the tail of a split statement.
        for statement in &statements {
            let code = statement
                .lines()
                .find(|line| !line.trim_start().starts_with("--"))
                .unwrap_or("");
            assert!(
                code.starts_with("CREATE") || code.starts_with("DROP INDEX"),
                "statement does not start with DDL: {statement}"
            );
        }
    }

    #[test]
    fn wire_strings_cover_every_persisted_enum() {
        for status in TransactionStatus::ALL {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(*status));
        }
        for status in ProjectStatus::ALL {
            assert_eq!(ProjectStatus::parse(status.as_str()), Some(*status));
        }
        for status in RecommendationStatus::ALL {
            assert_eq!(RecommendationStatus::parse(status.as_str()), Some(*status));
        }
    }
}
