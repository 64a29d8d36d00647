pub mod approvals;
pub mod audit;
pub mod config;
pub mod directory;
pub mod domain;
pub mod errors;
pub mod notify;

pub use approvals::{
    ApprovalEngine, ChainBuilder, ChainPolicy, GradeVerdict, GradedChainBuilder,
    OperationContext, WalkStop,
};
pub use audit::{
    AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, LogAuditSink,
};
pub use directory::{Directory, InMemoryDirectory};
pub use domain::chain::{
    ApprovalChain, ApprovalStep, Approver, ChainProgress, ChainSnapshot, ChainStatus, Decision,
    DecisionOutcome, StepStatus,
};
pub use domain::graded::{
    GradedChainSnapshot, GradedCompletionChain, GradedStep, GradedTask, GradingOutcome,
    GradingProgress, LevelRole,
};
pub use domain::identity::{Capacity, Identity, IdentityKey};
pub use domain::kpi::{KpiAchievement, KpiContribution, KpiId, KpiLink, KpiScoreboard};
pub use domain::workflow::{ChainId, WorkflowKind, WorkflowRequest};
pub use errors::{ApplicationError, DomainError, InterfaceError, WorkflowError};
pub use notify::{InMemoryNotifier, LogNotifier, Notification, NotificationKind, NotificationPort};
