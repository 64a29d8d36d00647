use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::identity::{normalize_key, IdentityKey};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl ChainId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    General,
    Purchase,
    Budget,
    Invoice,
    TaskCompletion,
    CustomerOnboarding,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Purchase => "purchase",
            Self::Budget => "budget",
            Self::Invoice => "invoice",
            Self::TaskCompletion => "task_completion",
            Self::CustomerOnboarding => "customer_onboarding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "general" => Some(Self::General),
            "purchase" => Some(Self::Purchase),
            "budget" => Some(Self::Budget),
            "invoice" => Some(Self::Invoice),
            "task_completion" => Some(Self::TaskCompletion),
            "customer_onboarding" => Some(Self::CustomerOnboarding),
            _ => None,
        }
    }

    /// Kinds that always end with the finance officer.
    pub fn requires_finance(&self) -> bool {
        matches!(self, Self::Purchase | Self::Budget | Self::Invoice)
    }

    /// Invoices follow the fixed supervisor, head, business head, finance shape.
    pub fn has_fixed_shape(&self) -> bool {
        matches!(self, Self::Invoice)
    }
}

/// The request object a chain is built for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub request_ref: String,
    pub title: String,
    pub kind: WorkflowKind,
    pub requester: IdentityKey,
    pub requires_finance: bool,
}

impl WorkflowRequest {
    pub fn new(
        request_ref: impl Into<String>,
        title: impl Into<String>,
        kind: WorkflowKind,
        requester: impl AsRef<str>,
    ) -> Self {
        Self {
            request_ref: request_ref.into(),
            title: title.into(),
            kind,
            requester: IdentityKey::new(requester),
            requires_finance: false,
        }
    }

    pub fn with_finance(mut self) -> Self {
        self.requires_finance = true;
        self
    }

    pub fn needs_finance(&self) -> bool {
        self.requires_finance || self.kind.requires_finance()
    }
}
