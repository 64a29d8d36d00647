use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use sqlx::Row;
use tracing::warn;

use signoff_core::directory::InMemoryDirectory;
use signoff_core::domain::identity::{Capacity, Identity, IdentityKey};

use super::{DirectoryRepository, RepositoryError};
use crate::DbPool;

/// Organisation snapshot stored in `org_member`, `org_capacity` and `department`.
pub struct SqlDirectoryRepository {
    pool: DbPool,
}

impl SqlDirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DirectoryRepository for SqlDirectoryRepository {
    async fn upsert_member(
        &self,
        identity: &Identity,
        supervisor: Option<&IdentityKey>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO org_member (identity_key, display_name, department, supervisor_key,
                                     active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(identity_key) DO UPDATE SET
                 display_name = excluded.display_name,
                 department = excluded.department,
                 supervisor_key = excluded.supervisor_key,
                 active = excluded.active,
                 updated_at = excluded.updated_at",
        )
        .bind(identity.key.as_str())
        .bind(&identity.display_name)
        .bind(&identity.department)
        .bind(supervisor.map(|key| key.as_str()))
        .bind(identity.active)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM org_capacity WHERE identity_key = ?")
            .bind(identity.key.as_str())
            .execute(&mut *tx)
            .await?;
        for capacity in &identity.capacities {
            sqlx::query("INSERT INTO org_capacity (identity_key, capacity) VALUES (?, ?)")
                .bind(identity.key.as_str())
                .bind(capacity.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_department_head(
        &self,
        department: &str,
        head: &IdentityKey,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO department (name, head_key) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET head_key = excluded.head_key",
        )
        .bind(department.trim().to_lowercase())
        .bind(head.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self) -> Result<InMemoryDirectory, RepositoryError> {
        let capacity_rows = sqlx::query("SELECT identity_key, capacity FROM org_capacity")
            .fetch_all(&self.pool)
            .await?;
        let mut capacities: HashMap<String, BTreeSet<Capacity>> = HashMap::new();
        for row in &capacity_rows {
            let key: String = row.try_get("identity_key")?;
            let raw: String = row.try_get("capacity")?;
            match Capacity::parse(&raw) {
                Some(capacity) => {
                    capacities.entry(key).or_default().insert(capacity);
                }
                None => warn!(
                    event_name = "directory.load.unknown_capacity",
                    identity_key = %key,
                    capacity = %raw,
                    "ignoring unknown capacity"
                ),
            }
        }

        let member_rows = sqlx::query(
            "SELECT identity_key, display_name, department, supervisor_key, active
             FROM org_member",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut directory = InMemoryDirectory::new();
        for row in &member_rows {
            let key: String = row.try_get("identity_key")?;
            let supervisor: Option<String> = row.try_get("supervisor_key")?;
            let identity = Identity {
                key: IdentityKey(key.clone()),
                display_name: row.try_get("display_name")?,
                department: row.try_get("department")?,
                capacities: capacities.remove(&key).unwrap_or_default(),
                active: row.try_get("active")?,
            };
            if let Some(supervisor) = supervisor {
                directory.set_supervisor(identity.key.clone(), IdentityKey(supervisor));
            }
            directory.insert_identity(identity);
        }

        let department_rows =
            sqlx::query("SELECT name, head_key FROM department").fetch_all(&self.pool).await?;
        for row in &department_rows {
            let name: String = row.try_get("name")?;
            let head: String = row.try_get("head_key")?;
            directory.set_department_head(&name, IdentityKey(head));
        }

        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use signoff_core::directory::Directory;
    use signoff_core::domain::identity::{Capacity, Identity, IdentityKey};

    use super::SqlDirectoryRepository;
    use crate::repositories::DirectoryRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlDirectoryRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlDirectoryRepository::new(pool)
    }

    #[tokio::test]
    async fn load_rebuilds_hierarchy_capacities_and_heads() {
        let repo = setup().await;
        let ann = IdentityKey::new("ann@corp.test");
        let rae = Identity::new("rae@corp.test", "Rae").in_department("Eng");
        repo.upsert_member(&rae, Some(&ann)).await.expect("rae");
        repo.upsert_member(
            &Identity::new("ann@corp.test", "Ann")
                .in_department("Eng")
                .with_capacity(Capacity::DepartmentHead),
            None,
        )
        .await
        .expect("ann");
        repo.set_department_head("Eng", &ann).await.expect("head");

        let directory = repo.load().await.expect("load");
        let rae = IdentityKey::new("rae@corp.test");

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.supervisor_of(&rae).map(|identity| identity.key), Some(ann.clone()));
        let head = directory.department_head_of(&rae).map(|identity| identity.key);
        assert_eq!(head, Some(ann.clone()));
        assert!(directory.capacities_of(&ann).contains(&Capacity::DepartmentHead));
    }

    #[tokio::test]
    async fn upsert_replaces_capacities_and_activity() {
        let repo = setup().await;
        let key = IdentityKey::new("fin@corp.test");
        repo.upsert_member(
            &Identity::new("fin@corp.test", "Fin").with_capacity(Capacity::FinanceOfficer),
            None,
        )
        .await
        .expect("insert");
        repo.upsert_member(&Identity::new("fin@corp.test", "Fin").inactive(), None)
            .await
            .expect("update");

        let directory = repo.load().await.expect("load");
        let fin = directory.resolve(&key).expect("resolved");
        assert!(!fin.active);
        assert!(fin.capacities.is_empty());
    }
}
