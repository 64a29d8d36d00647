use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::chain::ChainStatus;
use crate::domain::identity::IdentityKey;

/// Failures of a single engine operation. Every variant aborts the attempted
/// transition with no partial state change.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("identity `{key}` was not found in the directory")]
    NotFound { key: IdentityKey },
    #[error("no approver could be resolved for requester `{requester}`")]
    EmptyChain { requester: IdentityKey },
    #[error("only {entitled_name} <{entitled_key}> may decide level {level}")]
    NotAuthorized { level: u32, entitled_key: IdentityKey, entitled_name: String },
    #[error("chain is no longer pending (status `{status}`)")]
    NotPending { status: ChainStatus },
    #[error("level {requested} is not the active level (active level is {active})")]
    LevelNotActive { requested: u32, active: u32 },
    #[error("grade {grade} is outside the accepted range 1.0..=5.0")]
    InvalidGrade { grade: Decimal },
    #[error("only a rejected chain can be reset (status `{status}`)")]
    NotRejected { status: ChainStatus },
    #[error("finance approval is required but no finance officer is configured")]
    FinanceOfficerUnconfigured,
    #[error("no active finance officer other than requester `{requester}` is available")]
    NoEligibleFinanceOfficer { requester: IdentityKey },
    #[error("no alternate approver is available for graded level {level}")]
    NoAlternateApprover { level: u32 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not the approver for the active level.",
            Self::NotFound { .. } => "The referenced record or person does not exist.",
            Self::Conflict { .. } => {
                "The approval changed while you were deciding. Reload and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Forbidden { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Workflow(error) => {
                let message = error.to_string();
                match error {
                    WorkflowError::NotFound { .. } => Self::NotFound { message, correlation_id },
                    WorkflowError::NotAuthorized { .. } => {
                        Self::Forbidden { message, correlation_id }
                    }
                    WorkflowError::FinanceOfficerUnconfigured => {
                        Self::Internal { message, correlation_id }
                    }
                    WorkflowError::EmptyChain { .. }
                    | WorkflowError::NotPending { .. }
                    | WorkflowError::LevelNotActive { .. }
                    | WorkflowError::InvalidGrade { .. }
                    | WorkflowError::NotRejected { .. }
                    | WorkflowError::NoEligibleFinanceOfficer { .. }
                    | WorkflowError::NoAlternateApprover { .. } => {
                        Self::BadRequest { message, correlation_id }
                    }
                }
            }
            ApplicationError::Domain(error) => {
                Self::Internal { message: error.to_string(), correlation_id }
            }
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::Conflict(message) => Self::Conflict { message, correlation_id },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
