use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use signoff_core::directory::InMemoryDirectory;
use signoff_core::domain::chain::ApprovalChain;
use signoff_core::domain::graded::GradedCompletionChain;
use signoff_core::domain::identity::{Identity, IdentityKey};
use signoff_core::domain::kpi::{KpiAchievement, KpiContribution, KpiId};
use signoff_core::domain::workflow::ChainId;

pub mod chain;
pub mod directory;
pub mod graded;
pub mod kpi;
pub mod memory;

pub use chain::SqlChainRepository;
pub use directory::SqlDirectoryRepository;
pub use graded::SqlGradedChainRepository;
pub use kpi::SqlKpiRepository;
pub use memory::{
    InMemoryChainRepository, InMemoryDirectoryRepository, InMemoryGradedChainRepository,
    InMemoryKpiRepository,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("chain {id} is no longer at version {expected}")]
    VersionConflict { id: String, expected: u32 },
    #[error("not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait ChainRepository: Send + Sync {
    async fn find_by_id(&self, id: &ChainId) -> Result<Option<ApprovalChain>, RepositoryError>;

    async fn list_by_request(
        &self,
        request_ref: &str,
    ) -> Result<Vec<ApprovalChain>, RepositoryError>;

    async fn insert(&self, chain: &ApprovalChain) -> Result<(), RepositoryError>;

    /// Stores `chain` only while the stored record is still at `expected_version`.
    async fn update(
        &self,
        chain: &ApprovalChain,
        expected_version: u32,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait GradedChainRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ChainId,
    ) -> Result<Option<GradedCompletionChain>, RepositoryError>;

    async fn list_by_task(
        &self,
        task_ref: &str,
    ) -> Result<Vec<GradedCompletionChain>, RepositoryError>;

    async fn insert(&self, chain: &GradedCompletionChain) -> Result<(), RepositoryError>;

    async fn update(
        &self,
        chain: &GradedCompletionChain,
        expected_version: u32,
    ) -> Result<(), RepositoryError>;

    /// Stores a completed chain and adds its KPI contributions atomically: either
    /// both land or neither does. Unregistered KPIs are skipped and returned.
    async fn complete(
        &self,
        chain: &GradedCompletionChain,
        expected_version: u32,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Result<Vec<KpiId>, RepositoryError>;
}

#[async_trait]
pub trait KpiRepository: Send + Sync {
    async fn find(&self, kpi_id: &KpiId) -> Result<Option<KpiAchievement>, RepositoryError>;

    async fn list(&self) -> Result<Vec<KpiAchievement>, RepositoryError>;

    async fn save(&self, achievement: &KpiAchievement) -> Result<(), RepositoryError>;

    /// Adds every contribution in one transaction, clamping each KPI to 0..=100.
    /// Contributions naming an unregistered KPI are skipped and returned.
    async fn apply_contributions(
        &self,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Result<Vec<KpiId>, RepositoryError>;
}

#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn upsert_member(
        &self,
        identity: &Identity,
        supervisor: Option<&IdentityKey>,
    ) -> Result<(), RepositoryError>;

    async fn set_department_head(
        &self,
        department: &str,
        head: &IdentityKey,
    ) -> Result<(), RepositoryError>;

    /// Snapshot of the whole organisation for one build or decision.
    async fn load(&self) -> Result<InMemoryDirectory, RepositoryError>;
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("bad timestamp `{value}`: {error}")))
}

pub(crate) fn parse_optional_timestamp(
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{column} out of range: {value}")))
}
