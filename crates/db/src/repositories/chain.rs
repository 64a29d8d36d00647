use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use signoff_core::domain::chain::{
    ApprovalChain, ApprovalStep, Approver, ChainSnapshot, ChainStatus, StepStatus,
};
use signoff_core::domain::identity::{Capacity, IdentityKey};
use signoff_core::domain::workflow::{ChainId, WorkflowKind, WorkflowRequest};

use super::{parse_optional_timestamp, parse_timestamp, to_u32, ChainRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChainRepository {
    pool: DbPool,
}

impl SqlChainRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, chain_id: &str) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT level, approver_key, approver_name, capacity, capacities_json, status,
                    comment, decided_at, notification_sent
             FROM approval_step WHERE chain_id = ? ORDER BY level ASC",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<ApprovalChain, RepositoryError> {
        let id: String = row.try_get("id")?;
        let steps = self.load_steps(&id).await?;
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let requester: String = row.try_get("requester_key")?;

        let snapshot = ChainSnapshot {
            id: ChainId(id),
            request: WorkflowRequest {
                request_ref: row.try_get("request_ref")?,
                title: row.try_get("title")?,
                kind: WorkflowKind::parse(&kind)
                    .ok_or_else(|| RepositoryError::Decode(format!("unknown kind `{kind}`")))?,
                requester: IdentityKey(requester),
                requires_finance: row.try_get("requires_finance")?,
            },
            steps,
            current_level: to_u32(row.try_get("current_level")?, "current_level")?,
            status: parse_chain_status(&status)?,
            version: to_u32(row.try_get("version")?, "version")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        };

        ApprovalChain::restore(snapshot).map_err(|error| RepositoryError::Decode(error.to_string()))
    }
}

const CHAIN_COLUMNS: &str = "id, request_ref, title, kind, requester_key, requires_finance,
    status, current_level, version, created_at, updated_at";

#[async_trait::async_trait]
impl ChainRepository for SqlChainRepository {
    async fn find_by_id(&self, id: &ChainId) -> Result<Option<ApprovalChain>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHAIN_COLUMNS} FROM approval_chain WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_by_request(
        &self,
        request_ref: &str,
    ) -> Result<Vec<ApprovalChain>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM approval_chain
             WHERE request_ref = ? ORDER BY created_at ASC"
        ))
        .bind(request_ref)
        .fetch_all(&self.pool)
        .await?;

        let mut chains = Vec::with_capacity(rows.len());
        for row in &rows {
            chains.push(self.hydrate(row).await?);
        }
        Ok(chains)
    }

    async fn insert(&self, chain: &ApprovalChain) -> Result<(), RepositoryError> {
        let request = chain.request();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approval_chain (id, request_ref, title, kind, requester_key,
                                         requires_finance, status, current_level, version,
                                         created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chain.id().0)
        .bind(&request.request_ref)
        .bind(&request.title)
        .bind(request.kind.as_str())
        .bind(request.requester.as_str())
        .bind(request.requires_finance)
        .bind(chain.status().as_str())
        .bind(i64::from(chain.current_level()))
        .bind(i64::from(chain.version()))
        .bind(chain.created_at().to_rfc3339())
        .bind(chain.updated_at().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for step in chain.steps() {
            sqlx::query(
                "INSERT INTO approval_step (chain_id, level, approver_key, approver_name, capacity,
                                            capacities_json, status, comment, decided_at,
                                            notification_sent)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chain.id().0)
            .bind(i64::from(step.level))
            .bind(step.approver.key.as_str())
            .bind(&step.approver.display_name)
            .bind(step.capacity.as_str())
            .bind(encode_capacities(&step.capacities)?)
            .bind(step.status.as_str())
            .bind(&step.comment)
            .bind(step.decided_at.map(|at| at.to_rfc3339()))
            .bind(step.notification_sent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(
        &self,
        chain: &ApprovalChain,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_chain
             SET status = ?, current_level = ?, version = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(chain.status().as_str())
        .bind(i64::from(chain.current_level()))
        .bind(i64::from(chain.version()))
        .bind(chain.updated_at().to_rfc3339())
        .bind(&chain.id().0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let id = chain.id();
            return Err(missing_or_conflict(&mut tx, "approval_chain", id, expected_version).await);
        }

        for step in chain.steps() {
            update_step_decision(&mut tx, "approval_step", &chain.id().0, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Distinguishes a stale write from a chain that was never stored.
pub(crate) async fn missing_or_conflict(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    id: &ChainId,
    expected_version: u32,
) -> RepositoryError {
    let exists = sqlx::query(&format!("SELECT 1 FROM {table} WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(&mut **tx)
        .await;

    match exists {
        Ok(Some(_)) => {
            RepositoryError::VersionConflict { id: id.0.clone(), expected: expected_version }
        }
        Ok(None) => RepositoryError::NotFound(format!("chain {id}")),
        Err(error) => RepositoryError::Database(error),
    }
}

/// Decision fields are the only step columns that change after a chain is built.
pub(crate) async fn update_step_decision(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    chain_id: &str,
    step: &ApprovalStep,
) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "UPDATE {table}
         SET status = ?, comment = ?, decided_at = ?, notification_sent = ?
         WHERE chain_id = ? AND level = ?"
    ))
    .bind(step.status.as_str())
    .bind(&step.comment)
    .bind(step.decided_at.map(|at| at.to_rfc3339()))
    .bind(step.notification_sent)
    .bind(chain_id)
    .bind(i64::from(step.level))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) fn step_from_row(row: &SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let capacity: String = row.try_get("capacity")?;
    let capacities: String = row.try_get("capacities_json")?;
    let status: String = row.try_get("status")?;
    let approver_key: String = row.try_get("approver_key")?;

    Ok(ApprovalStep {
        level: to_u32(row.try_get("level")?, "level")?,
        approver: Approver {
            key: IdentityKey(approver_key),
            display_name: row.try_get("approver_name")?,
        },
        capacity: Capacity::parse(&capacity)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown capacity `{capacity}`")))?,
        capacities: decode_capacities(&capacities)?,
        status: StepStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status}`")))?,
        comment: row.try_get("comment")?,
        decided_at: parse_optional_timestamp(row.try_get("decided_at")?)?,
        notification_sent: row.try_get("notification_sent")?,
    })
}

pub(crate) fn parse_chain_status(value: &str) -> Result<ChainStatus, RepositoryError> {
    ChainStatus::parse(value)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown chain status `{value}`")))
}

pub(crate) fn encode_capacities(capacities: &[Capacity]) -> Result<String, RepositoryError> {
    serde_json::to_string(capacities).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn decode_capacities(value: &str) -> Result<Vec<Capacity>, RepositoryError> {
    serde_json::from_str(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}
