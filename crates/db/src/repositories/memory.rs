use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use signoff_core::directory::InMemoryDirectory;
use signoff_core::domain::chain::ApprovalChain;
use signoff_core::domain::graded::GradedCompletionChain;
use signoff_core::domain::identity::{Identity, IdentityKey};
use signoff_core::domain::kpi::{KpiAchievement, KpiContribution, KpiId, KpiScoreboard};
use signoff_core::domain::workflow::ChainId;

use super::{
    ChainRepository, DirectoryRepository, GradedChainRepository, KpiRepository, RepositoryError,
};

fn check_version(
    id: &ChainId,
    stored: Option<u32>,
    expected_version: u32,
) -> Result<(), RepositoryError> {
    match stored {
        None => Err(RepositoryError::NotFound(format!("chain {id}"))),
        Some(version) if version != expected_version => {
            Err(RepositoryError::VersionConflict { id: id.0.clone(), expected: expected_version })
        }
        Some(_) => Ok(()),
    }
}

#[derive(Default)]
pub struct InMemoryChainRepository {
    chains: RwLock<HashMap<String, ApprovalChain>>,
}

#[async_trait::async_trait]
impl ChainRepository for InMemoryChainRepository {
    async fn find_by_id(&self, id: &ChainId) -> Result<Option<ApprovalChain>, RepositoryError> {
        let chains = self.chains.read().await;
        Ok(chains.get(&id.0).cloned())
    }

    async fn list_by_request(
        &self,
        request_ref: &str,
    ) -> Result<Vec<ApprovalChain>, RepositoryError> {
        let chains = self.chains.read().await;
        let mut matching: Vec<ApprovalChain> = chains
            .values()
            .filter(|chain| chain.request().request_ref == request_ref)
            .cloned()
            .collect();
        matching.sort_by_key(|chain| chain.created_at());
        Ok(matching)
    }

    async fn insert(&self, chain: &ApprovalChain) -> Result<(), RepositoryError> {
        let mut chains = self.chains.write().await;
        chains.insert(chain.id().0.clone(), chain.clone());
        Ok(())
    }

    async fn update(
        &self,
        chain: &ApprovalChain,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut chains = self.chains.write().await;
        let stored = chains.get(&chain.id().0).map(ApprovalChain::version);
        check_version(chain.id(), stored, expected_version)?;
        chains.insert(chain.id().0.clone(), chain.clone());
        Ok(())
    }
}

/// Completes chains against the KPI store it was built with, so a completion and
/// its contributions land under one pair of locks.
#[derive(Default)]
pub struct InMemoryGradedChainRepository {
    chains: RwLock<HashMap<String, GradedCompletionChain>>,
    kpis: Arc<InMemoryKpiRepository>,
}

impl InMemoryGradedChainRepository {
    pub fn with_kpis(kpis: Arc<InMemoryKpiRepository>) -> Self {
        Self { chains: RwLock::default(), kpis }
    }
}

#[async_trait::async_trait]
impl GradedChainRepository for InMemoryGradedChainRepository {
    async fn find_by_id(
        &self,
        id: &ChainId,
    ) -> Result<Option<GradedCompletionChain>, RepositoryError> {
        let chains = self.chains.read().await;
        Ok(chains.get(&id.0).cloned())
    }

    async fn list_by_task(
        &self,
        task_ref: &str,
    ) -> Result<Vec<GradedCompletionChain>, RepositoryError> {
        let chains = self.chains.read().await;
        let mut matching: Vec<GradedCompletionChain> =
            chains.values().filter(|chain| chain.task().task_ref == task_ref).cloned().collect();
        matching.sort_by_key(|chain| chain.created_at());
        Ok(matching)
    }

    async fn insert(&self, chain: &GradedCompletionChain) -> Result<(), RepositoryError> {
        let mut chains = self.chains.write().await;
        chains.insert(chain.id().0.clone(), chain.clone());
        Ok(())
    }

    async fn update(
        &self,
        chain: &GradedCompletionChain,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut chains = self.chains.write().await;
        let stored = chains.get(&chain.id().0).map(GradedCompletionChain::version);
        check_version(chain.id(), stored, expected_version)?;
        chains.insert(chain.id().0.clone(), chain.clone());
        Ok(())
    }

    async fn complete(
        &self,
        chain: &GradedCompletionChain,
        expected_version: u32,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Result<Vec<KpiId>, RepositoryError> {
        let mut chains = self.chains.write().await;
        let stored = chains.get(&chain.id().0).map(GradedCompletionChain::version);
        check_version(chain.id(), stored, expected_version)?;

        let mut scoreboard = self.kpis.scoreboard.write().await;
        let unknown = scoreboard.apply_all(contributions, at);
        chains.insert(chain.id().0.clone(), chain.clone());
        Ok(unknown)
    }
}

#[derive(Default)]
pub struct InMemoryKpiRepository {
    scoreboard: RwLock<KpiScoreboard>,
}

#[async_trait::async_trait]
impl KpiRepository for InMemoryKpiRepository {
    async fn find(&self, kpi_id: &KpiId) -> Result<Option<KpiAchievement>, RepositoryError> {
        let scoreboard = self.scoreboard.read().await;
        Ok(scoreboard.get(kpi_id).cloned())
    }

    async fn list(&self) -> Result<Vec<KpiAchievement>, RepositoryError> {
        let scoreboard = self.scoreboard.read().await;
        Ok(scoreboard.achievements().cloned().collect())
    }

    async fn save(&self, achievement: &KpiAchievement) -> Result<(), RepositoryError> {
        let mut scoreboard = self.scoreboard.write().await;
        scoreboard.register(achievement.clone());
        Ok(())
    }

    async fn apply_contributions(
        &self,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Result<Vec<KpiId>, RepositoryError> {
        let mut scoreboard = self.scoreboard.write().await;
        Ok(scoreboard.apply_all(contributions, at))
    }
}

#[derive(Default)]
pub struct InMemoryDirectoryRepository {
    directory: RwLock<InMemoryDirectory>,
}

impl InMemoryDirectoryRepository {
    pub fn with_directory(directory: InMemoryDirectory) -> Self {
        Self { directory: RwLock::new(directory) }
    }
}

#[async_trait::async_trait]
impl DirectoryRepository for InMemoryDirectoryRepository {
    async fn upsert_member(
        &self,
        identity: &Identity,
        supervisor: Option<&IdentityKey>,
    ) -> Result<(), RepositoryError> {
        let mut directory = self.directory.write().await;
        if let Some(supervisor) = supervisor {
            directory.set_supervisor(identity.key.clone(), supervisor.clone());
        }
        directory.insert_identity(identity.clone());
        Ok(())
    }

    async fn set_department_head(
        &self,
        department: &str,
        head: &IdentityKey,
    ) -> Result<(), RepositoryError> {
        let mut directory = self.directory.write().await;
        directory.set_department_head(department, head.clone());
        Ok(())
    }

    async fn load(&self) -> Result<InMemoryDirectory, RepositoryError> {
        let directory = self.directory.read().await;
        Ok(directory.clone())
    }
}
