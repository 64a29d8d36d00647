use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use signoff_core::domain::graded::{
    GradedChainSnapshot, GradedCompletionChain, GradedStep, GradedTask, LevelRole, RejectionNote,
};
use signoff_core::domain::identity::IdentityKey;
use signoff_core::domain::kpi::{KpiContribution, KpiId, KpiLink};
use signoff_core::domain::workflow::ChainId;

use super::chain::{
    encode_capacities, missing_or_conflict, parse_chain_status, step_from_row,
    update_step_decision,
};
use super::kpi::apply_in_transaction;
use super::{parse_timestamp, to_u32, GradedChainRepository, RepositoryError};
use crate::DbPool;

pub struct SqlGradedChainRepository {
    pool: DbPool,
}

impl SqlGradedChainRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, chain_id: &str) -> Result<Vec<GradedStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT level, level_role, approver_key, approver_name, capacity, capacities_json,
                    status, comment, decided_at, notification_sent, substituted, grade,
                    effective_score
             FROM graded_step WHERE chain_id = ? ORDER BY level ASC",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(graded_step_from_row).collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<GradedCompletionChain, RepositoryError> {
        let id: String = row.try_get("id")?;
        let steps = self.load_steps(&id).await?;
        let status: String = row.try_get("status")?;
        let assignee: String = row.try_get("assignee_key")?;
        let creator: Option<String> = row.try_get("originating_creator")?;
        let kpi_links: String = row.try_get("kpi_links_json")?;
        let last_rejection: Option<String> = row.try_get("last_rejection_json")?;

        let snapshot = GradedChainSnapshot {
            id: ChainId(id),
            task: GradedTask {
                task_ref: row.try_get("task_ref")?,
                title: row.try_get("title")?,
                weight: parse_decimal(&row.try_get::<String, _>("task_weight")?)?,
                kpi_links: decode_json::<Vec<KpiLink>>(&kpi_links)?,
                originating_creator: creator.map(IdentityKey),
            },
            assignee: IdentityKey(assignee),
            steps,
            current_level: to_u32(row.try_get("current_level")?, "current_level")?,
            status: parse_chain_status(&status)?,
            final_grade: parse_optional_decimal(row.try_get("final_grade")?)?,
            last_rejection: last_rejection
                .as_deref()
                .map(decode_json::<RejectionNote>)
                .transpose()?,
            version: to_u32(row.try_get("version")?, "version")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        };

        GradedCompletionChain::restore(snapshot)
            .map_err(|error| RepositoryError::Decode(error.to_string()))
    }
}

const GRADED_COLUMNS: &str = "id, task_ref, title, task_weight, kpi_links_json,
    originating_creator, assignee_key, status, current_level, final_grade,
    last_rejection_json, version, created_at, updated_at";

#[async_trait::async_trait]
impl GradedChainRepository for SqlGradedChainRepository {
    async fn find_by_id(
        &self,
        id: &ChainId,
    ) -> Result<Option<GradedCompletionChain>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {GRADED_COLUMNS} FROM graded_chain WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_by_task(
        &self,
        task_ref: &str,
    ) -> Result<Vec<GradedCompletionChain>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {GRADED_COLUMNS} FROM graded_chain
             WHERE task_ref = ? ORDER BY created_at ASC"
        ))
        .bind(task_ref)
        .fetch_all(&self.pool)
        .await?;

        let mut chains = Vec::with_capacity(rows.len());
        for row in &rows {
            chains.push(self.hydrate(row).await?);
        }
        Ok(chains)
    }

    async fn insert(&self, chain: &GradedCompletionChain) -> Result<(), RepositoryError> {
        let task = chain.task();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO graded_chain (id, task_ref, title, task_weight, kpi_links_json,
                                       originating_creator, assignee_key, status, current_level,
                                       final_grade, last_rejection_json, version, created_at,
                                       updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chain.id().0)
        .bind(&task.task_ref)
        .bind(&task.title)
        .bind(task.weight.to_string())
        .bind(encode_json(&task.kpi_links)?)
        .bind(task.originating_creator.as_ref().map(|creator| creator.0.clone()))
        .bind(chain.assignee().as_str())
        .bind(chain.status().as_str())
        .bind(i64::from(chain.current_level()))
        .bind(chain.final_grade().map(|grade| grade.to_string()))
        .bind(chain.last_rejection().map(encode_json).transpose()?)
        .bind(i64::from(chain.version()))
        .bind(chain.created_at().to_rfc3339())
        .bind(chain.updated_at().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for graded in chain.steps() {
            let step = &graded.step;
            sqlx::query(
                "INSERT INTO graded_step (chain_id, level, level_role, approver_key,
                                          approver_name, capacity, capacities_json, status,
                                          comment, decided_at, notification_sent, substituted,
                                          grade, effective_score)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chain.id().0)
            .bind(i64::from(step.level))
            .bind(graded.level_role.as_str())
            .bind(step.approver.key.as_str())
            .bind(&step.approver.display_name)
            .bind(step.capacity.as_str())
            .bind(encode_capacities(&step.capacities)?)
            .bind(step.status.as_str())
            .bind(&step.comment)
            .bind(step.decided_at.map(|at| at.to_rfc3339()))
            .bind(step.notification_sent)
            .bind(graded.substituted)
            .bind(graded.grade.map(|grade| grade.to_string()))
            .bind(graded.effective_score.map(|score| score.to_string()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(
        &self,
        chain: &GradedCompletionChain,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        write_update(&mut tx, chain, expected_version).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete(
        &self,
        chain: &GradedCompletionChain,
        expected_version: u32,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Result<Vec<KpiId>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        write_update(&mut tx, chain, expected_version).await?;
        let unknown = apply_in_transaction(&mut tx, contributions, at).await?;
        tx.commit().await?;
        Ok(unknown)
    }
}

async fn write_update(
    tx: &mut Transaction<'_, Sqlite>,
    chain: &GradedCompletionChain,
    expected_version: u32,
) -> Result<(), RepositoryError> {
    let updated = sqlx::query(
        "UPDATE graded_chain
         SET status = ?, current_level = ?, final_grade = ?, last_rejection_json = ?,
             version = ?, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(chain.status().as_str())
    .bind(i64::from(chain.current_level()))
    .bind(chain.final_grade().map(|grade| grade.to_string()))
    .bind(chain.last_rejection().map(encode_json).transpose()?)
    .bind(i64::from(chain.version()))
    .bind(chain.updated_at().to_rfc3339())
    .bind(&chain.id().0)
    .bind(i64::from(expected_version))
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(missing_or_conflict(tx, "graded_chain", chain.id(), expected_version).await);
    }

    for graded in chain.steps() {
        update_step_decision(tx, "graded_step", &chain.id().0, &graded.step).await?;
        sqlx::query(
            "UPDATE graded_step SET grade = ?, effective_score = ?
             WHERE chain_id = ? AND level = ?",
        )
        .bind(graded.grade.map(|grade| grade.to_string()))
        .bind(graded.effective_score.map(|score| score.to_string()))
        .bind(&chain.id().0)
        .bind(i64::from(graded.step.level))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn graded_step_from_row(row: &SqliteRow) -> Result<GradedStep, RepositoryError> {
    let role: String = row.try_get("level_role")?;

    Ok(GradedStep {
        step: step_from_row(row)?,
        level_role: LevelRole::parse(&role)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown level role `{role}`")))?,
        substituted: row.try_get("substituted")?,
        grade: parse_optional_decimal(row.try_get("grade")?)?,
        effective_score: parse_optional_decimal(row.try_get("effective_score")?)?,
    })
}

pub(crate) fn parse_decimal(value: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("bad decimal `{value}`: {error}")))
}

fn parse_optional_decimal(value: Option<String>) -> Result<Option<Decimal>, RepositoryError> {
    value.as_deref().map(parse_decimal).transpose()
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use signoff_core::approvals::{ChainPolicy, GradedChainBuilder};
    use signoff_core::directory::InMemoryDirectory;
    use signoff_core::domain::chain::{ChainStatus, StepStatus};
    use signoff_core::domain::graded::{GradedCompletionChain, GradedTask};
    use signoff_core::domain::identity::{Identity, IdentityKey};
    use signoff_core::domain::kpi::{KpiId, KpiLink};

    use super::SqlGradedChainRepository;
    use crate::repositories::{GradedChainRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_chain(creator: Option<&str>) -> GradedCompletionChain {
        let directory = InMemoryDirectory::new()
            .with_identity(Identity::new("rae@corp.test", "Rae"))
            .with_identity(Identity::new("ann@corp.test", "Ann"))
            .with_identity(Identity::new("bob@corp.test", "Bob"))
            .with_identity(Identity::new("pam@corp.test", "Pam"))
            .with_supervisor("rae@corp.test", "ann@corp.test")
            .with_supervisor("ann@corp.test", "bob@corp.test");
        let task = GradedTask {
            task_ref: "TASK-3".into(),
            title: "Vendor review".into(),
            weight: Decimal::new(20, 0),
            kpi_links: vec![KpiLink { kpi_id: KpiId("kpi-1".into()), weight: Decimal::new(40, 0) }],
            originating_creator: creator.map(IdentityKey::new),
        };
        GradedChainBuilder::new(&directory, &ChainPolicy::default())
            .build(task, &IdentityKey::new("rae@corp.test"), Utc::now())
            .expect("graded chain builds")
    }

    #[tokio::test]
    async fn insert_then_find_keeps_roles_and_skipped_level() {
        let repo = SqlGradedChainRepository::new(setup().await);
        let chain = sample_chain(None);

        repo.insert(&chain).await.expect("insert");
        let found = repo.find_by_id(chain.id()).await.expect("find").expect("exists");

        assert_eq!(found.snapshot(), chain.snapshot());
        assert_eq!(found.steps()[2].step.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn grades_and_completion_survive_a_round_trip() {
        let repo = SqlGradedChainRepository::new(setup().await);
        let mut chain = sample_chain(None);
        repo.insert(&chain).await.expect("insert");

        let version = chain.version();
        let grader = IdentityKey::new("ann@corp.test");
        chain.grade_level(1, &grader, Decimal::new(40, 1), None, Utc::now()).expect("level 1");
        repo.update(&chain, version).await.expect("update 1");

        let version = chain.version();
        let grader = IdentityKey::new("bob@corp.test");
        chain.grade_level(2, &grader, Decimal::new(50, 1), None, Utc::now()).expect("level 2");
        repo.update(&chain, version).await.expect("update 2");

        let found = repo.find_by_id(chain.id()).await.expect("find").expect("exists");
        assert_eq!(found.status(), ChainStatus::Approved);
        assert_eq!(found.final_grade(), Some(Decimal::new(450, 2)));
        assert_eq!(found.steps()[0].effective_score, Some(Decimal::new(80, 2)));
        assert_eq!(found.snapshot(), chain.snapshot());
    }

    #[tokio::test]
    async fn rejection_note_is_persisted() {
        let repo = SqlGradedChainRepository::new(setup().await);
        let mut chain = sample_chain(Some("pam@corp.test"));
        repo.insert(&chain).await.expect("insert");

        let version = chain.version();
        chain
            .reject_level(1, &IdentityKey::new("ann@corp.test"), Some("redo".into()), Utc::now())
            .expect("reject");
        repo.update(&chain, version).await.expect("update");

        let found = repo.find_by_id(chain.id()).await.expect("find").expect("exists");
        let note = found.last_rejection().expect("rejection recorded");
        assert_eq!(note.level, 1);
        assert_eq!(note.comment.as_deref(), Some("redo"));
        assert_eq!(repo.list_by_task("TASK-3").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_grade_loses_on_version() {
        let repo = SqlGradedChainRepository::new(setup().await);
        let chain = sample_chain(None);
        repo.insert(&chain).await.expect("insert");

        let grader = IdentityKey::new("ann@corp.test");
        let mut first = chain.clone();
        let mut second = chain.clone();
        first.grade_level(1, &grader, Decimal::new(30, 1), None, Utc::now()).expect("first");
        second.grade_level(1, &grader, Decimal::new(50, 1), None, Utc::now()).expect("second");

        repo.update(&first, chain.version()).await.expect("first wins");
        let error = repo.update(&second, chain.version()).await.expect_err("stale");
        assert!(matches!(error, RepositoryError::VersionConflict { .. }));
    }
}
