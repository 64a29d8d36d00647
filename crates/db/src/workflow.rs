use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use signoff_core::approvals::{ApprovalEngine, ChainPolicy, GradeVerdict, OperationContext};
use signoff_core::audit::AuditSink;
use signoff_core::directory::InMemoryDirectory;
use signoff_core::domain::chain::{ApprovalChain, Decision, DecisionOutcome};
use signoff_core::domain::graded::{
    GradedCompletionChain, GradedTask, GradingOutcome, GradingProgress,
};
use signoff_core::domain::identity::IdentityKey;
use signoff_core::domain::kpi::{KpiAchievement, KpiId};
use signoff_core::domain::workflow::{ChainId, WorkflowRequest};
use signoff_core::errors::ApplicationError;
use signoff_core::notify::NotificationPort;

use crate::repositories::{
    ChainRepository, DirectoryRepository, GradedChainRepository, InMemoryChainRepository,
    InMemoryDirectoryRepository, InMemoryGradedChainRepository, InMemoryKpiRepository,
    KpiRepository, RepositoryError, SqlChainRepository, SqlDirectoryRepository,
    SqlGradedChainRepository, SqlKpiRepository,
};
use crate::DbPool;

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::VersionConflict { id, expected } => {
                ApplicationError::Conflict(format!("chain {id} moved past version {expected}"))
            }
            RepositoryError::NotFound(what) => ApplicationError::NotFound(what),
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

/// Storage the service reads and writes.
#[derive(Clone)]
pub struct WorkflowStores {
    pub chains: Arc<dyn ChainRepository>,
    pub graded: Arc<dyn GradedChainRepository>,
    pub kpis: Arc<dyn KpiRepository>,
    pub directory: Arc<dyn DirectoryRepository>,
}

impl WorkflowStores {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            chains: Arc::new(SqlChainRepository::new(pool.clone())),
            graded: Arc::new(SqlGradedChainRepository::new(pool.clone())),
            kpis: Arc::new(SqlKpiRepository::new(pool.clone())),
            directory: Arc::new(SqlDirectoryRepository::new(pool)),
        }
    }

    pub fn in_memory(directory: InMemoryDirectory) -> Self {
        let kpis = Arc::new(InMemoryKpiRepository::default());
        Self {
            chains: Arc::new(InMemoryChainRepository::default()),
            graded: Arc::new(InMemoryGradedChainRepository::with_kpis(kpis.clone())),
            kpis,
            directory: Arc::new(InMemoryDirectoryRepository::with_directory(directory)),
        }
    }
}

/// Result of grading one level through the service.
#[derive(Clone, Debug)]
pub struct GradeReceipt {
    pub chain: GradedCompletionChain,
    pub outcome: GradingOutcome,
    /// KPIs the task links to that have no registered achievement.
    pub unknown_kpis: Vec<KpiId>,
}

/// Drives the engine against persisted chains.
///
/// Every mutation is load, mutate, save-at-expected-version, then notify. A stale
/// version surfaces as [`ApplicationError::Conflict`], so two racing decisions on
/// one level cannot both commit. Transitions are audited as applied only once
/// saved. Notifications run after the commit and only the notification flag is
/// saved afterwards.
pub struct WorkflowService {
    stores: WorkflowStores,
    notifier: Arc<dyn NotificationPort>,
    audit: Arc<dyn AuditSink>,
    policy: ChainPolicy,
    notifications_enabled: bool,
}

impl WorkflowService {
    pub fn new(
        stores: WorkflowStores,
        notifier: Arc<dyn NotificationPort>,
        audit: Arc<dyn AuditSink>,
        policy: ChainPolicy,
    ) -> Self {
        Self { stores, notifier, audit, policy, notifications_enabled: true }
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications_enabled = enabled;
        self
    }

    pub fn stores(&self) -> &WorkflowStores {
        &self.stores
    }

    async fn engine(&self) -> Result<ApprovalEngine, ApplicationError> {
        let directory = self.stores.directory.load().await?;
        Ok(ApprovalEngine::new(
            Arc::new(directory),
            self.notifier.clone(),
            self.audit.clone(),
            self.policy.clone(),
        )
        .with_notifications(self.notifications_enabled))
    }

    pub async fn open_chain(
        &self,
        request: &WorkflowRequest,
        correlation_id: &str,
    ) -> Result<ApprovalChain, ApplicationError> {
        let ctx = OperationContext::now(correlation_id);
        let engine = self.engine().await?;

        let mut chain = engine.build_chain(request, &ctx)?;
        self.stores.chains.insert(&chain).await?;

        let committed = chain.version();
        if engine.activate(&mut chain, &ctx) {
            self.save_flag(&chain, committed).await;
        }
        Ok(chain)
    }

    pub async fn find_chain(&self, id: &ChainId) -> Result<ApprovalChain, ApplicationError> {
        self.stores
            .chains
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("chain {id}")))
    }

    pub async fn decide(
        &self,
        id: &ChainId,
        actor: &IdentityKey,
        decision: Decision,
        comment: Option<String>,
        correlation_id: &str,
    ) -> Result<(ApprovalChain, DecisionOutcome), ApplicationError> {
        let ctx = OperationContext::now(correlation_id);
        let engine = self.engine().await?;
        let mut chain = self.find_chain(id).await?;

        let expected = chain.version();
        let outcome = engine.decide(&mut chain, actor, decision, comment, &ctx)?;
        self.commit(&engine, &chain, expected, actor.as_str(), &ctx).await?;
        engine.record_decision(&chain, actor, &outcome, &ctx);

        let committed = chain.version();
        if engine.announce(&mut chain, &outcome, &ctx) {
            self.save_flag(&chain, committed).await;
        }
        Ok((chain, outcome))
    }

    pub async fn reset(
        &self,
        id: &ChainId,
        actor: &IdentityKey,
        correlation_id: &str,
    ) -> Result<ApprovalChain, ApplicationError> {
        let ctx = OperationContext::now(correlation_id);
        let engine = self.engine().await?;
        let mut chain = self.find_chain(id).await?;

        let expected = chain.version();
        engine.reset(&mut chain, actor.as_str(), &ctx)?;
        self.commit(&engine, &chain, expected, actor.as_str(), &ctx).await?;
        engine.record_reset(&chain, actor.as_str(), &ctx);

        let committed = chain.version();
        if engine.activate(&mut chain, &ctx) {
            self.save_flag(&chain, committed).await;
        }
        Ok(chain)
    }

    pub async fn open_graded(
        &self,
        task: GradedTask,
        assignee: &IdentityKey,
        correlation_id: &str,
    ) -> Result<GradedCompletionChain, ApplicationError> {
        let ctx = OperationContext::now(correlation_id);
        let engine = self.engine().await?;

        let mut chain = engine.build_graded(task, assignee, &ctx)?;
        self.stores.graded.insert(&chain).await?;

        let committed = chain.version();
        if engine.activate_graded(&mut chain, &ctx) {
            self.save_graded_flag(&chain, committed).await;
        }
        Ok(chain)
    }

    pub async fn find_graded(
        &self,
        id: &ChainId,
    ) -> Result<GradedCompletionChain, ApplicationError> {
        self.stores
            .graded
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("graded chain {id}")))
    }

    pub async fn grade(
        &self,
        id: &ChainId,
        level: u32,
        actor: &IdentityKey,
        verdict: GradeVerdict,
        comment: Option<String>,
        correlation_id: &str,
    ) -> Result<GradeReceipt, ApplicationError> {
        let ctx = OperationContext::now(correlation_id);
        let engine = self.engine().await?;
        let mut chain = self.find_graded(id).await?;

        let expected = chain.version();
        let outcome = engine.grade(&mut chain, level, actor, verdict, comment, &ctx)?;
        let saved = match &outcome.progress {
            GradingProgress::Completed { contributions, .. } => {
                self.stores.graded.complete(&chain, expected, contributions, ctx.at).await
            }
            _ => self.stores.graded.update(&chain, expected).await.map(|()| Vec::new()),
        };
        let unknown_kpis = match saved {
            Ok(unknown) => unknown,
            Err(error) => {
                let message = error.to_string();
                let event = "grading.commit_refused";
                engine.record_commit_refused(chain.id(), event, actor.as_str(), &message, &ctx);
                return Err(error.into());
            }
        };
        engine.record_grading(&chain, actor, &outcome, &ctx);

        if !unknown_kpis.is_empty() {
            warn!(
                event_name = "grading.kpi_unregistered",
                correlation_id,
                chain_id = %chain.id(),
                kpis = ?unknown_kpis,
                "contributions skipped for unregistered KPIs"
            );
        }

        let committed = chain.version();
        if engine.announce_grading(&mut chain, &outcome, &ctx) {
            self.save_graded_flag(&chain, committed).await;
        }
        Ok(GradeReceipt { chain, outcome, unknown_kpis })
    }

    /// Registers a KPI, or renames one that exists while keeping its achievement.
    pub async fn register_kpi(
        &self,
        kpi_id: KpiId,
        name: &str,
    ) -> Result<KpiAchievement, ApplicationError> {
        let now = Utc::now();
        let achievement = match self.stores.kpis.find(&kpi_id).await? {
            Some(mut existing) => {
                existing.name = name.to_string();
                existing.updated_at = now;
                existing
            }
            None => KpiAchievement::new(kpi_id, name, now),
        };
        self.stores.kpis.save(&achievement).await?;
        Ok(achievement)
    }

    pub async fn kpi_achievements(&self) -> Result<Vec<KpiAchievement>, ApplicationError> {
        Ok(self.stores.kpis.list().await?)
    }

    async fn commit(
        &self,
        engine: &ApprovalEngine,
        chain: &ApprovalChain,
        expected: u32,
        actor: &str,
        ctx: &OperationContext,
    ) -> Result<(), ApplicationError> {
        match self.stores.chains.update(chain, expected).await {
            Ok(()) => {
                info!(
                    event_name = "approval.chain_committed",
                    correlation_id = %ctx.correlation_id,
                    chain_id = %chain.id(),
                    version = chain.version(),
                    "approval chain saved"
                );
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                let event = "approval.commit_refused";
                engine.record_commit_refused(chain.id(), event, actor, &message, ctx);
                Err(error.into())
            }
        }
    }

    /// Best effort: the transition is already durable, so a lost flag only means
    /// the step may be notified again.
    async fn save_flag(&self, chain: &ApprovalChain, committed: u32) {
        if let Err(error) = self.stores.chains.update(chain, committed).await {
            warn!(
                event_name = "approval.notification_flag_unsaved",
                chain_id = %chain.id(),
                error = %error,
                "notification flag not saved"
            );
        }
    }

    async fn save_graded_flag(&self, chain: &GradedCompletionChain, committed: u32) {
        if let Err(error) = self.stores.graded.update(chain, committed).await {
            warn!(
                event_name = "grading.notification_flag_unsaved",
                chain_id = %chain.id(),
                error = %error,
                "notification flag not saved"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use signoff_core::approvals::{ChainPolicy, GradeVerdict};
    use signoff_core::audit::InMemoryAuditSink;
    use signoff_core::directory::InMemoryDirectory;
    use signoff_core::domain::chain::{ChainStatus, Decision};
    use signoff_core::domain::graded::{GradedTask, GradingProgress};
    use signoff_core::domain::identity::{Capacity, Identity, IdentityKey};
    use signoff_core::domain::kpi::{KpiId, KpiLink};
    use signoff_core::domain::workflow::{WorkflowKind, WorkflowRequest};
    use signoff_core::errors::{ApplicationError, WorkflowError};
    use signoff_core::notify::InMemoryNotifier;

    use super::{WorkflowService, WorkflowStores};
    use crate::repositories::DirectoryRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::new()
            .with_identity(Identity::new("rae@corp.test", "Rae").in_department("ops"))
            .with_identity(Identity::new("ann@corp.test", "Ann").in_department("ops"))
            .with_identity(
                Identity::new("bob@corp.test", "Bob")
                    .in_department("ops")
                    .with_capacity(Capacity::DepartmentHead),
            )
            .with_identity(Identity::new("fin@corp.test", "Fin"))
            .with_identity(Identity::new("pm@corp.test", "Pam"))
            .with_supervisor("rae@corp.test", "ann@corp.test")
            .with_supervisor("ann@corp.test", "bob@corp.test")
            .with_department_head("ops", "bob@corp.test")
    }

    fn policy() -> ChainPolicy {
        ChainPolicy {
            finance_officer: Some(IdentityKey::new("fin@corp.test")),
            ..ChainPolicy::default()
        }
    }

    async fn sqlite_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    async fn sqlite_stores() -> WorkflowStores {
        seeded_stores(sqlite_pool().await).await
    }

    async fn seeded_stores(pool: DbPool) -> WorkflowStores {
        let stores = WorkflowStores::sqlite(pool);
        let seed = directory();
        for identity in seed.identities() {
            stores
                .directory
                .upsert_member(identity, seed.supervisor_key(&identity.key))
                .await
                .expect("seed member");
        }
        stores
            .directory
            .set_department_head("ops", &IdentityKey::new("bob@corp.test"))
            .await
            .expect("seed head");
        stores
    }

    fn key(raw: &str) -> IdentityKey {
        IdentityKey::new(raw)
    }

    #[tokio::test]
    async fn purchase_chain_runs_to_approval_against_sqlite() {
        let notifier = InMemoryNotifier::default();
        let service = WorkflowService::new(
            sqlite_stores().await,
            Arc::new(notifier.clone()),
            Arc::new(InMemoryAuditSink::default()),
            policy(),
        );
        let request =
            WorkflowRequest::new("PO-1", "Forklift", WorkflowKind::Purchase, "rae@corp.test");

        let chain = service.open_chain(&request, "req-1").await.expect("open");
        let stored = service.find_chain(chain.id()).await.expect("stored");
        assert!(stored.steps()[0].notification_sent, "activation flag persisted");

        for approver in ["ann@corp.test", "bob@corp.test", "fin@corp.test"] {
            service
                .decide(chain.id(), &key(approver), Decision::Approve, None, "req-2")
                .await
                .expect("approve");
        }

        let stored = service.find_chain(chain.id()).await.expect("stored");
        assert_eq!(stored.status(), ChainStatus::Approved);
        assert_eq!(stored.current_level(), 0);
        assert_eq!(notifier.delivered().len(), 4);
    }

    #[tokio::test]
    async fn racing_decisions_on_one_level_commit_once() {
        let audit = InMemoryAuditSink::default();
        let service = WorkflowService::new(
            sqlite_stores().await,
            Arc::new(InMemoryNotifier::default()),
            Arc::new(audit.clone()),
            policy(),
        );
        let request =
            WorkflowRequest::new("PO-2", "Printer", WorkflowKind::Purchase, "rae@corp.test");
        let chain = service.open_chain(&request, "req-1").await.expect("open");

        let ann = key("ann@corp.test");
        let (first, second) = tokio::join!(
            service.decide(chain.id(), &ann, Decision::Approve, None, "req-a"),
            service.decide(chain.id(), &ann, Decision::Approve, None, "req-b"),
        );

        let successes = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let stored = service.find_chain(chain.id()).await.expect("stored");
        assert_eq!(stored.version(), chain.version() + 2, "one decision plus one flag save");

        assert_eq!(audit.events_of_type("approval.decision_applied").len(), 1);
        let lost = audit.events_of_type("approval.commit_refused").len()
            + audit.events_of_type("approval.decision_refused").len();
        assert_eq!(lost, 1, "the losing decision is audited as refused");
    }

    #[tokio::test]
    async fn kpi_store_failure_rolls_back_the_completing_grade() {
        let pool = sqlite_pool().await;
        let audit = InMemoryAuditSink::default();
        let service = WorkflowService::new(
            seeded_stores(pool.clone()).await,
            Arc::new(InMemoryNotifier::default()),
            Arc::new(audit.clone()),
            policy(),
        );
        service.register_kpi(KpiId("kpi-ship".into()), "Shipping").await.expect("register");
        let task = GradedTask {
            task_ref: "T-9".into(),
            title: "Ship v3".into(),
            weight: Decimal::new(20, 0),
            kpi_links: vec![KpiLink {
                kpi_id: KpiId("kpi-ship".into()),
                weight: Decimal::new(40, 0),
            }],
            originating_creator: None,
        };
        let chain = service.open_graded(task, &key("rae@corp.test"), "req-1").await.expect("open");
        let level_one = GradeVerdict::Grade(Decimal::new(40, 1));
        service
            .grade(chain.id(), 1, &key("ann@corp.test"), level_one, None, "req-2")
            .await
            .expect("level 1");

        sqlx::query("ALTER TABLE kpi_achievement RENAME TO kpi_achievement_offline")
            .execute(&pool)
            .await
            .expect("take kpi table away");
        let level_two = GradeVerdict::Grade(Decimal::new(50, 1));
        let error = service
            .grade(chain.id(), 2, &key("bob@corp.test"), level_two, None, "req-3")
            .await
            .expect_err("kpi write fails");
        assert!(matches!(error, ApplicationError::Persistence(_)));

        let stored = service.find_graded(chain.id()).await.expect("stored");
        assert_eq!(stored.status(), ChainStatus::Pending);
        assert_eq!(stored.current_level(), 2);
        assert_eq!(audit.events_of_type("grading.commit_refused").len(), 1);
        assert!(audit.events_of_type("grading.completed").is_empty());

        sqlx::query("ALTER TABLE kpi_achievement_offline RENAME TO kpi_achievement")
            .execute(&pool)
            .await
            .expect("restore kpi table");
        let receipt = service
            .grade(chain.id(), 2, &key("bob@corp.test"), level_two, None, "req-4")
            .await
            .expect("retry completes");

        assert!(matches!(receipt.outcome.progress, GradingProgress::Completed { .. }));
        let kpis = service.kpi_achievements().await.expect("kpis");
        assert_eq!(kpis[0].achievement, Decimal::new(36, 0));
        assert_eq!(audit.events_of_type("grading.completed").len(), 1);
    }

    #[tokio::test]
    async fn notification_outage_keeps_the_committed_decision() {
        let notifier = InMemoryNotifier::default();
        let service = WorkflowService::new(
            WorkflowStores::in_memory(directory()),
            Arc::new(notifier.clone()),
            Arc::new(InMemoryAuditSink::default()),
            policy(),
        );
        let request = WorkflowRequest::new("R-3", "Trip", WorkflowKind::General, "rae@corp.test");
        let chain = service.open_chain(&request, "req-1").await.expect("open");

        notifier.fail_for("bob@corp.test");
        let (decided, _) = service
            .decide(chain.id(), &key("ann@corp.test"), Decision::Approve, None, "req-2")
            .await
            .expect("decision commits");

        let stored = service.find_chain(chain.id()).await.expect("stored");
        assert_eq!(stored.current_level(), 2);
        assert!(!stored.steps()[1].notification_sent);
        assert_eq!(stored, decided);
    }

    #[tokio::test]
    async fn reset_reopens_and_wrong_approver_is_refused() {
        let service = WorkflowService::new(
            WorkflowStores::in_memory(directory()),
            Arc::new(InMemoryNotifier::default()),
            Arc::new(InMemoryAuditSink::default()),
            policy(),
        );
        let request = WorkflowRequest::new("R-4", "Badge", WorkflowKind::General, "rae@corp.test");
        let chain = service.open_chain(&request, "req-1").await.expect("open");

        let error = service
            .decide(chain.id(), &key("bob@corp.test"), Decision::Approve, None, "req-2")
            .await
            .expect_err("bob is not active yet");
        assert!(matches!(
            error,
            ApplicationError::Workflow(WorkflowError::NotAuthorized { level: 1, .. })
        ));

        service
            .decide(chain.id(), &key("ann@corp.test"), Decision::Reject, None, "req-3")
            .await
            .expect("reject");
        let reopened =
            service.reset(chain.id(), &key("rae@corp.test"), "req-4").await.expect("reset");
        assert_eq!(reopened.status(), ChainStatus::Pending);
        assert_eq!(reopened.current_level(), 1);
        assert!(reopened.steps()[0].notification_sent);
    }

    #[tokio::test]
    async fn graded_completion_updates_kpis() {
        let service = WorkflowService::new(
            sqlite_stores().await,
            Arc::new(InMemoryNotifier::default()),
            Arc::new(InMemoryAuditSink::default()),
            policy(),
        );
        service.register_kpi(KpiId("kpi-ship".into()), "Shipping").await.expect("register");
        let task = GradedTask {
            task_ref: "T-1".into(),
            title: "Ship v2".into(),
            weight: Decimal::new(20, 0),
            kpi_links: vec![
                KpiLink { kpi_id: KpiId("kpi-ship".into()), weight: Decimal::new(40, 0) },
                KpiLink { kpi_id: KpiId("kpi-ghost".into()), weight: Decimal::new(10, 0) },
            ],
            originating_creator: Some(key("pm@corp.test")),
        };
        let chain = service.open_graded(task, &key("rae@corp.test"), "req-1").await.expect("open");

        let grades = [("ann@corp.test", 40), ("bob@corp.test", 50), ("pm@corp.test", 45)];
        let mut last = None;
        for (level, (grader, tenths)) in grades.iter().enumerate() {
            let verdict = GradeVerdict::Grade(Decimal::new(*tenths, 1));
            let receipt = service
                .grade(chain.id(), level as u32 + 1, &key(grader), verdict, None, "req-2")
                .await
                .expect("grade");
            last = Some(receipt);
        }

        let receipt = last.expect("three receipts");
        let GradingProgress::Completed { final_grade, .. } = receipt.outcome.progress else {
            panic!("expected completion");
        };
        assert_eq!(final_grade, Decimal::new(450, 2));
        assert_eq!(receipt.unknown_kpis, vec![KpiId("kpi-ghost".into())]);

        let kpis = service.kpi_achievements().await.expect("kpis");
        assert_eq!(kpis[0].achievement, Decimal::new(36, 0));

        let renamed =
            service.register_kpi(KpiId("kpi-ship".into()), "Shipping (EU)").await.expect("rename");
        assert_eq!(renamed.name, "Shipping (EU)");
        assert_eq!(renamed.achievement, Decimal::new(36, 0));
    }

    #[tokio::test]
    async fn unknown_chain_is_not_found() {
        let service = WorkflowService::new(
            WorkflowStores::in_memory(directory()),
            Arc::new(InMemoryNotifier::default()),
            Arc::new(InMemoryAuditSink::default()),
            policy(),
        );
        let error = service
            .find_chain(&signoff_core::domain::workflow::ChainId("nope".into()))
            .await
            .expect_err("missing");
        assert!(matches!(error, ApplicationError::NotFound(_)));
    }
}
