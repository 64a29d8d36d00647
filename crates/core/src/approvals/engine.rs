use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::approvals::builder::{ChainBuilder, ChainPolicy, GradedChainBuilder};
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::directory::Directory;
use crate::domain::chain::{ApprovalChain, ChainProgress, Decision, DecisionOutcome};
use crate::domain::graded::{GradedCompletionChain, GradedTask, GradingOutcome, GradingProgress};
use crate::domain::identity::IdentityKey;
use crate::domain::workflow::{ChainId, WorkflowRequest};
use crate::errors::{ApplicationError, WorkflowError};
use crate::notify::{Notification, NotificationKind, NotificationPort};

const ENGINE_ACTOR: &str = "signoff-engine";

/// Correlation id and clock reading for one externally triggered operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationContext {
    pub correlation_id: String,
    pub at: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(correlation_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self { correlation_id: correlation_id.into(), at }
    }

    pub fn now(correlation_id: impl Into<String>) -> Self {
        Self::new(correlation_id, Utc::now())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradeVerdict {
    Grade(Decimal),
    Reject,
}

/// Orchestrates chain construction, transitions, notification and audit.
///
/// Transitions and notifications are separate calls so a caller that persists
/// chains can commit the transition before anything is sent. `open`, `submit`
/// and `submit_grade` chain both halves for in-process use.
pub struct ApprovalEngine {
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn NotificationPort>,
    audit: Arc<dyn AuditSink>,
    policy: ChainPolicy,
    notifications_enabled: bool,
}

impl ApprovalEngine {
    pub fn new(
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn NotificationPort>,
        audit: Arc<dyn AuditSink>,
        policy: ChainPolicy,
    ) -> Self {
        Self { directory, notifier, audit, policy, notifications_enabled: true }
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications_enabled = enabled;
        self
    }

    pub fn policy(&self) -> &ChainPolicy {
        &self.policy
    }

    pub fn build_chain(
        &self,
        request: &WorkflowRequest,
        ctx: &OperationContext,
    ) -> Result<ApprovalChain, ApplicationError> {
        let chain = ChainBuilder::new(self.directory.as_ref(), &self.policy)
            .build(request, ctx.at)
            .map_err(|error| {
                let event = "approval.build_refused";
                self.refused(None, event, AuditCategory::Build, ENGINE_ACTOR, &error, ctx);
                error
            })?;

        info!(
            event_name = "approval.chain_built",
            correlation_id = %ctx.correlation_id,
            chain_id = %chain.id(),
            request_ref = %request.request_ref,
            kind = request.kind.as_str(),
            levels = chain.steps().len(),
            "approval chain built"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(chain.id().clone()),
                ctx.correlation_id.clone(),
                "approval.chain_built",
                AuditCategory::Build,
                request.requester.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata("request_ref", request.request_ref.clone())
            .with_metadata("kind", request.kind.as_str())
            .with_metadata("levels", chain.steps().len().to_string()),
        );
        Ok(chain)
    }

    /// Builds the chain and notifies the level-1 approver.
    pub fn open(
        &self,
        request: &WorkflowRequest,
        ctx: &OperationContext,
    ) -> Result<ApprovalChain, ApplicationError> {
        let mut chain = self.build_chain(request, ctx)?;
        self.activate(&mut chain, ctx);
        Ok(chain)
    }

    /// Notifies the active approver unless that step was already notified.
    /// Returns true when the notification flag changed.
    pub fn activate(&self, chain: &mut ApprovalChain, ctx: &OperationContext) -> bool {
        let Some(step) = chain.current_approver() else {
            return false;
        };
        if step.notification_sent {
            debug!(chain_id = %chain.id(), level = step.level, "level already notified");
            return false;
        }

        let notification = Notification {
            chain_id: chain.id().clone(),
            request_ref: chain.request().request_ref.clone(),
            title: chain.request().title.clone(),
            kind: NotificationKind::StepActivated,
            recipient: step.approver.key.clone(),
            recipient_name: step.approver.display_name.clone(),
            level: Some(step.level),
        };
        let level = step.level;
        if self.deliver(&notification, ctx) {
            return chain.mark_notified(level, ctx.at);
        }
        false
    }

    pub fn decide(
        &self,
        chain: &mut ApprovalChain,
        actor: &IdentityKey,
        decision: Decision,
        comment: Option<String>,
        ctx: &OperationContext,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let outcome = match chain.decide(actor, decision, comment, ctx.at) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.refused(
                    Some(chain.id()),
                    "approval.decision_refused",
                    AuditCategory::Decision,
                    actor.as_str(),
                    &error,
                    ctx,
                );
                return Err(error.into());
            }
        };
        Ok(outcome)
    }

    /// Logs and audits a decision once it is durable.
    pub fn record_decision(
        &self,
        chain: &ApprovalChain,
        actor: &IdentityKey,
        outcome: &DecisionOutcome,
        ctx: &OperationContext,
    ) {
        info!(
            event_name = "approval.decision_applied",
            correlation_id = %ctx.correlation_id,
            chain_id = %chain.id(),
            level = outcome.decided_level,
            actor = %actor,
            decision = ?outcome.decision,
            status = chain.status().as_str(),
            "approval decision applied"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(chain.id().clone()),
                ctx.correlation_id.clone(),
                "approval.decision_applied",
                AuditCategory::Decision,
                actor.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata("level", outcome.decided_level.to_string())
            .with_metadata("decision", format!("{:?}", outcome.decision))
            .with_metadata("status", chain.status().as_str()),
        );
    }

    /// Audits a transition that was applied in memory but lost the race to
    /// persist it.
    pub fn record_commit_refused(
        &self,
        chain_id: &ChainId,
        event_type: &str,
        actor: &str,
        error: &str,
        ctx: &OperationContext,
    ) {
        warn!(
            event_name = event_type,
            correlation_id = %ctx.correlation_id,
            chain_id = %chain_id,
            actor,
            error,
            "transition not saved"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(chain_id.clone()),
                ctx.correlation_id.clone(),
                event_type,
                AuditCategory::Persistence,
                actor,
                AuditOutcome::Failed,
            )
            .with_metadata("error", error),
        );
    }

    /// Sends whatever a decision made due: the next approver on advance, the
    /// requester on a terminal outcome.
    pub fn announce(
        &self,
        chain: &mut ApprovalChain,
        outcome: &DecisionOutcome,
        ctx: &OperationContext,
    ) -> bool {
        let kind = match outcome.progress {
            ChainProgress::Advanced { .. } => return self.activate(chain, ctx),
            ChainProgress::Approved => NotificationKind::ChainApproved,
            ChainProgress::Rejected => NotificationKind::ChainRejected,
        };

        let request = chain.request();
        let notification = Notification {
            chain_id: chain.id().clone(),
            request_ref: request.request_ref.clone(),
            title: request.title.clone(),
            kind,
            recipient: request.requester.clone(),
            recipient_name: self.display_name(&request.requester),
            level: None,
        };
        self.deliver(&notification, ctx);
        false
    }

    pub fn submit(
        &self,
        chain: &mut ApprovalChain,
        actor: &IdentityKey,
        decision: Decision,
        comment: Option<String>,
        ctx: &OperationContext,
    ) -> Result<DecisionOutcome, ApplicationError> {
        let outcome = self.decide(chain, actor, decision, comment, ctx)?;
        self.record_decision(chain, actor, &outcome, ctx);
        self.announce(chain, &outcome, ctx);
        Ok(outcome)
    }

    /// Reopens a rejected chain at level 1. The caller records and activates it
    /// once the reset is durable.
    pub fn reset(
        &self,
        chain: &mut ApprovalChain,
        actor: &str,
        ctx: &OperationContext,
    ) -> Result<(), ApplicationError> {
        if let Err(error) = chain.reset_on_rejection(ctx.at) {
            self.refused(
                Some(chain.id()),
                "approval.reset_refused",
                AuditCategory::Decision,
                actor,
                &error,
                ctx,
            );
            return Err(error.into());
        }
        Ok(())
    }

    pub fn record_reset(&self, chain: &ApprovalChain, actor: &str, ctx: &OperationContext) {
        info!(
            event_name = "approval.chain_reset",
            correlation_id = %ctx.correlation_id,
            chain_id = %chain.id(),
            actor,
            "rejected chain reopened at level 1"
        );
        self.audit.emit(AuditEvent::new(
            Some(chain.id().clone()),
            ctx.correlation_id.clone(),
            "approval.chain_reset",
            AuditCategory::Decision,
            actor,
            AuditOutcome::Success,
        ));
    }

    /// Resets a rejected chain and notifies level 1 again.
    pub fn reopen(
        &self,
        chain: &mut ApprovalChain,
        actor: &str,
        ctx: &OperationContext,
    ) -> Result<(), ApplicationError> {
        self.reset(chain, actor, ctx)?;
        self.record_reset(chain, actor, ctx);
        self.activate(chain, ctx);
        Ok(())
    }

    pub fn build_graded(
        &self,
        task: GradedTask,
        assignee: &IdentityKey,
        ctx: &OperationContext,
    ) -> Result<GradedCompletionChain, ApplicationError> {
        let task_ref = task.task_ref.clone();
        let chain = GradedChainBuilder::new(self.directory.as_ref(), &self.policy)
            .build(task, assignee, ctx.at)?;

        let substituted: Vec<String> = chain
            .steps()
            .iter()
            .filter(|graded| graded.substituted)
            .map(|graded| graded.step.level.to_string())
            .collect();
        info!(
            event_name = "grading.chain_built",
            correlation_id = %ctx.correlation_id,
            chain_id = %chain.id(),
            task_ref = %task_ref,
            assignee = %assignee,
            "graded completion chain built"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(chain.id().clone()),
                ctx.correlation_id.clone(),
                "grading.chain_built",
                AuditCategory::Build,
                assignee.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata("task_ref", task_ref)
            .with_metadata("substituted_levels", substituted.join(",")),
        );
        Ok(chain)
    }

    pub fn open_graded(
        &self,
        task: GradedTask,
        assignee: &IdentityKey,
        ctx: &OperationContext,
    ) -> Result<GradedCompletionChain, ApplicationError> {
        let mut chain = self.build_graded(task, assignee, ctx)?;
        self.activate_graded(&mut chain, ctx);
        Ok(chain)
    }

    pub fn activate_graded(
        &self,
        chain: &mut GradedCompletionChain,
        ctx: &OperationContext,
    ) -> bool {
        let Some(graded) = chain.current_grader() else {
            return false;
        };
        if graded.step.notification_sent {
            return false;
        }

        let notification = Notification {
            chain_id: chain.id().clone(),
            request_ref: chain.task().task_ref.clone(),
            title: chain.task().title.clone(),
            kind: NotificationKind::StepActivated,
            recipient: graded.step.approver.key.clone(),
            recipient_name: graded.step.approver.display_name.clone(),
            level: Some(graded.step.level),
        };
        let level = graded.step.level;
        if self.deliver(&notification, ctx) {
            return chain.mark_notified(level, ctx.at);
        }
        false
    }

    pub fn grade(
        &self,
        chain: &mut GradedCompletionChain,
        level: u32,
        actor: &IdentityKey,
        verdict: GradeVerdict,
        comment: Option<String>,
        ctx: &OperationContext,
    ) -> Result<GradingOutcome, ApplicationError> {
        let result = match verdict {
            GradeVerdict::Grade(grade) => chain.grade_level(level, actor, grade, comment, ctx.at),
            GradeVerdict::Reject => chain.reject_level(level, actor, comment, ctx.at),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                self.refused(
                    Some(chain.id()),
                    "grading.refused",
                    AuditCategory::Grading,
                    actor.as_str(),
                    &error,
                    ctx,
                );
                return Err(error.into());
            }
        };
        Ok(outcome)
    }

    /// Logs and audits a grading transition once it is durable.
    pub fn record_grading(
        &self,
        chain: &GradedCompletionChain,
        actor: &IdentityKey,
        outcome: &GradingOutcome,
        ctx: &OperationContext,
    ) {
        let level = outcome.level;
        let event = match &outcome.progress {
            GradingProgress::Advanced { .. } => {
                let grade = chain.step(level).and_then(|graded| graded.grade);
                info!(
                    event_name = "grading.level_graded",
                    correlation_id = %ctx.correlation_id,
                    chain_id = %chain.id(),
                    level,
                    actor = %actor,
                    grade = ?grade,
                    "graded level recorded"
                );
                AuditEvent::new(
                    Some(chain.id().clone()),
                    ctx.correlation_id.clone(),
                    "grading.level_graded",
                    AuditCategory::Grading,
                    actor.as_str(),
                    AuditOutcome::Success,
                )
                .with_metadata("level", level.to_string())
                .with_metadata("grade", grade.map(|grade| grade.to_string()).unwrap_or_default())
            }
            GradingProgress::Restarted { .. } => {
                info!(
                    event_name = "grading.restarted",
                    correlation_id = %ctx.correlation_id,
                    chain_id = %chain.id(),
                    level,
                    actor = %actor,
                    "grading rejected; restarting at level 1"
                );
                AuditEvent::new(
                    Some(chain.id().clone()),
                    ctx.correlation_id.clone(),
                    "grading.restarted",
                    AuditCategory::Grading,
                    actor.as_str(),
                    AuditOutcome::Rejected,
                )
                .with_metadata("rejected_level", level.to_string())
            }
            GradingProgress::Completed { final_grade, contributions } => {
                info!(
                    event_name = "grading.completed",
                    correlation_id = %ctx.correlation_id,
                    chain_id = %chain.id(),
                    final_grade = %final_grade,
                    kpis = contributions.len(),
                    "graded completion chain approved"
                );
                AuditEvent::new(
                    Some(chain.id().clone()),
                    ctx.correlation_id.clone(),
                    "grading.completed",
                    AuditCategory::Grading,
                    actor.as_str(),
                    AuditOutcome::Success,
                )
                .with_metadata("final_grade", final_grade.to_string())
                .with_metadata("kpis", contributions.len().to_string())
            }
        };
        self.audit.emit(event);
    }

    pub fn announce_grading(
        &self,
        chain: &mut GradedCompletionChain,
        outcome: &GradingOutcome,
        ctx: &OperationContext,
    ) -> bool {
        let kind = match outcome.progress {
            GradingProgress::Advanced { .. } => return self.activate_graded(chain, ctx),
            GradingProgress::Restarted { .. } => NotificationKind::GradingRestarted,
            GradingProgress::Completed { .. } => NotificationKind::GradingCompleted,
        };

        let notification = Notification {
            chain_id: chain.id().clone(),
            request_ref: chain.task().task_ref.clone(),
            title: chain.task().title.clone(),
            kind,
            recipient: chain.assignee().clone(),
            recipient_name: self.display_name(chain.assignee()),
            level: Some(outcome.level),
        };
        self.deliver(&notification, ctx);

        match outcome.progress {
            GradingProgress::Restarted { .. } => self.activate_graded(chain, ctx),
            _ => false,
        }
    }

    pub fn submit_grade(
        &self,
        chain: &mut GradedCompletionChain,
        level: u32,
        actor: &IdentityKey,
        verdict: GradeVerdict,
        comment: Option<String>,
        ctx: &OperationContext,
    ) -> Result<GradingOutcome, ApplicationError> {
        let outcome = self.grade(chain, level, actor, verdict, comment, ctx)?;
        self.record_grading(chain, actor, &outcome, ctx);
        self.announce_grading(chain, &outcome, ctx);
        Ok(outcome)
    }

    fn deliver(&self, notification: &Notification, ctx: &OperationContext) -> bool {
        if !self.notifications_enabled {
            debug!(
                chain_id = %notification.chain_id,
                kind = notification.kind.as_str(),
                "notifications disabled; nothing sent"
            );
            return false;
        }

        match self.notifier.notify(notification) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    event_name = "approval.notification_failed",
                    correlation_id = %ctx.correlation_id,
                    chain_id = %notification.chain_id,
                    recipient = %notification.recipient,
                    kind = notification.kind.as_str(),
                    error = %error,
                    "notification failed; transition kept"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(notification.chain_id.clone()),
                        ctx.correlation_id.clone(),
                        "approval.notification_failed",
                        AuditCategory::Notification,
                        ENGINE_ACTOR,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("recipient", notification.recipient.as_str())
                    .with_metadata("kind", notification.kind.as_str())
                    .with_metadata("error", error.to_string()),
                );
                false
            }
        }
    }

    fn display_name(&self, key: &IdentityKey) -> String {
        self.directory
            .resolve(key)
            .map(|identity| identity.display_name)
            .unwrap_or_else(|| key.to_string())
    }

    fn refused(
        &self,
        chain_id: Option<&ChainId>,
        event_type: &str,
        category: AuditCategory,
        actor: &str,
        error: &WorkflowError,
        ctx: &OperationContext,
    ) {
        info!(
            event_name = event_type,
            correlation_id = %ctx.correlation_id,
            chain_id = chain_id.map(|id| id.0.as_str()).unwrap_or("none"),
            actor,
            error = %error,
            "operation refused"
        );
        self.audit.emit(
            AuditEvent::new(
                chain_id.cloned(),
                ctx.correlation_id.clone(),
                event_type,
                category,
                actor,
                AuditOutcome::Rejected,
            )
            .with_metadata("error", error.to_string()),
        );
    }
}
