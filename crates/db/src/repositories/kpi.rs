use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use signoff_core::domain::kpi::{KpiAchievement, KpiContribution, KpiId};

use super::graded::parse_decimal;
use super::{parse_timestamp, KpiRepository, RepositoryError};
use crate::DbPool;

pub struct SqlKpiRepository {
    pool: DbPool,
}

impl SqlKpiRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn achievement_from_row(row: &SqliteRow) -> Result<KpiAchievement, RepositoryError> {
    Ok(KpiAchievement {
        kpi_id: KpiId(row.try_get("kpi_id")?),
        name: row.try_get("name")?,
        achievement: parse_decimal(&row.try_get::<String, _>("achievement")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl KpiRepository for SqlKpiRepository {
    async fn find(&self, kpi_id: &KpiId) -> Result<Option<KpiAchievement>, RepositoryError> {
        let row = sqlx::query(
            "SELECT kpi_id, name, achievement, updated_at FROM kpi_achievement WHERE kpi_id = ?",
        )
        .bind(&kpi_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(achievement_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<KpiAchievement>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT kpi_id, name, achievement, updated_at FROM kpi_achievement ORDER BY kpi_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(achievement_from_row).collect()
    }

    async fn save(&self, achievement: &KpiAchievement) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO kpi_achievement (kpi_id, name, achievement, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(kpi_id) DO UPDATE SET
                 name = excluded.name,
                 achievement = excluded.achievement,
                 updated_at = excluded.updated_at",
        )
        .bind(&achievement.kpi_id.0)
        .bind(&achievement.name)
        .bind(achievement.achievement.to_string())
        .bind(achievement.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_contributions(
        &self,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Result<Vec<KpiId>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let unknown = apply_in_transaction(&mut tx, contributions, at).await?;
        tx.commit().await?;
        Ok(unknown)
    }
}

/// Adds contributions inside the caller's transaction. Nothing is written until
/// the caller commits.
pub(crate) async fn apply_in_transaction(
    tx: &mut Transaction<'_, Sqlite>,
    contributions: &[KpiContribution],
    at: DateTime<Utc>,
) -> Result<Vec<KpiId>, RepositoryError> {
    let mut unknown = Vec::new();

    for contribution in contributions {
        let row = sqlx::query(
            "SELECT kpi_id, name, achievement, updated_at
             FROM kpi_achievement WHERE kpi_id = ?",
        )
        .bind(&contribution.kpi_id.0)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            unknown.push(contribution.kpi_id.clone());
            continue;
        };
        let mut achievement = achievement_from_row(&row)?;
        achievement.apply(contribution.amount, at);

        sqlx::query("UPDATE kpi_achievement SET achievement = ?, updated_at = ? WHERE kpi_id = ?")
            .bind(achievement.achievement.to_string())
            .bind(at.to_rfc3339())
            .bind(&contribution.kpi_id.0)
            .execute(&mut **tx)
            .await?;
    }

    Ok(unknown)
}
