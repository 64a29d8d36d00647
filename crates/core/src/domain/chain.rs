use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::{Capacity, Identity, IdentityKey};
use crate::domain::workflow::{ChainId, WorkflowRequest};
use crate::errors::{DomainError, WorkflowError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Undecided. Only the step at the chain's `current_level` is actionable;
    /// later pending steps are queued behind it.
    Pending,
    Approved,
    Rejected,
    /// Pre-approved at construction; only graded chains skip levels.
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Pending,
    Approved,
    Rejected,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    pub key: IdentityKey,
    pub display_name: String,
}

impl From<&Identity> for Approver {
    fn from(identity: &Identity) -> Self {
        Self { key: identity.key.clone(), display_name: identity.display_name.clone() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub level: u32,
    pub approver: Approver,
    /// Primary capacity; `capacities` keeps every role that routed here.
    pub capacity: Capacity,
    pub capacities: Vec<Capacity>,
    pub status: StepStatus,
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notification_sent: bool,
}

impl ApprovalStep {
    pub(crate) fn pending(
        level: u32,
        approver: Approver,
        capacity: Capacity,
        capacities: Vec<Capacity>,
    ) -> Self {
        Self {
            level,
            approver,
            capacity,
            capacities,
            status: StepStatus::Pending,
            comment: None,
            decided_at: None,
            notification_sent: false,
        }
    }

    pub fn holds(&self, capacity: &Capacity) -> bool {
        self.capacities.contains(capacity)
    }

    pub(crate) fn clear_decision(&mut self) {
        self.status = StepStatus::Pending;
        self.comment = None;
        self.decided_at = None;
        self.notification_sent = false;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChainProgress {
    Advanced { level: u32 },
    Approved,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decided_level: u32,
    pub decision: Decision,
    pub progress: ChainProgress,
}

/// Persisted form of an [`ApprovalChain`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub id: ChainId,
    pub request: WorkflowRequest,
    pub steps: Vec<ApprovalStep>,
    pub current_level: u32,
    pub status: ChainStatus,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ordered approval steps with a single active level.
///
/// `current_level` is 0 once the chain is terminal; otherwise it names the only
/// pending step and every lower level is approved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalChain {
    id: ChainId,
    request: WorkflowRequest,
    steps: Vec<ApprovalStep>,
    current_level: u32,
    status: ChainStatus,
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ApprovalChain {
    pub(crate) fn open(
        request: WorkflowRequest,
        steps: Vec<ApprovalStep>,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        if steps.is_empty() {
            return Err(WorkflowError::EmptyChain { requester: request.requester.clone() });
        }

        Ok(Self {
            id: ChainId::generate(),
            request,
            steps,
            current_level: 1,
            status: ChainStatus::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rehydrates a persisted chain, refusing records that break the chain invariants.
    pub fn restore(snapshot: ChainSnapshot) -> Result<Self, DomainError> {
        validate_structure(&snapshot.steps)?;
        validate_progress(&snapshot.steps, snapshot.status, snapshot.current_level)?;
        if snapshot.steps.iter().any(|step| step.status == StepStatus::Skipped) {
            return Err(DomainError::InvariantViolation(
                "plain approval chains cannot contain skipped steps".to_string(),
            ));
        }

        Ok(Self {
            id: snapshot.id,
            request: snapshot.request,
            steps: snapshot.steps,
            current_level: snapshot.current_level,
            status: snapshot.status,
            version: snapshot.version,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        })
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            id: self.id.clone(),
            request: self.request.clone(),
            steps: self.steps.clone(),
            current_level: self.current_level,
            status: self.status,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn id(&self) -> &ChainId {
        &self.id
    }

    pub fn request(&self) -> &WorkflowRequest {
        &self.request
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.steps
    }

    pub fn step(&self, level: u32) -> Option<&ApprovalStep> {
        level.checked_sub(1).and_then(|index| self.steps.get(index as usize))
    }

    pub fn current_level(&self) -> u32 {
        self.current_level
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_approver(&self) -> Option<&ApprovalStep> {
        if self.is_terminal() {
            return None;
        }
        self.step(self.current_level)
    }

    /// Share of approved steps, rounded half-up to a whole percent.
    pub fn progress_percent(&self) -> u8 {
        progress_percent(&self.steps)
    }

    pub fn decide(
        &mut self,
        actor: &IdentityKey,
        decision: Decision,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<DecisionOutcome, WorkflowError> {
        if self.is_terminal() {
            return Err(WorkflowError::NotPending { status: self.status });
        }

        let decided_level = self.current_level;
        let index = active_index(&self.steps, decided_level)?;
        let step = &self.steps[index];
        if &step.approver.key != actor {
            return Err(WorkflowError::NotAuthorized {
                level: decided_level,
                entitled_key: step.approver.key.clone(),
                entitled_name: step.approver.display_name.clone(),
            });
        }

        let step = &mut self.steps[index];
        step.comment = comment;
        step.decided_at = Some(at);

        let progress = match decision {
            Decision::Reject => {
                step.status = StepStatus::Rejected;
                self.status = ChainStatus::Rejected;
                self.current_level = 0;
                ChainProgress::Rejected
            }
            Decision::Approve => {
                step.status = StepStatus::Approved;
                if index + 1 < self.steps.len() {
                    self.current_level = decided_level + 1;
                    ChainProgress::Advanced { level: self.current_level }
                } else {
                    self.status = ChainStatus::Approved;
                    self.current_level = 0;
                    ChainProgress::Approved
                }
            }
        };

        self.touch(at);
        Ok(DecisionOutcome { decided_level, decision, progress })
    }

    /// Reopens a rejected chain for resubmission from level 1.
    pub fn reset_on_rejection(&mut self, at: DateTime<Utc>) -> Result<(), WorkflowError> {
        if self.status != ChainStatus::Rejected {
            return Err(WorkflowError::NotRejected { status: self.status });
        }

        for step in &mut self.steps {
            step.clear_decision();
        }
        self.status = ChainStatus::Pending;
        self.current_level = 1;
        self.touch(at);
        Ok(())
    }

    /// Records that the notification for `level` went out. Returns false when the
    /// flag was already set or the level does not exist.
    pub fn mark_notified(&mut self, level: u32, at: DateTime<Utc>) -> bool {
        let Some(step) = level.checked_sub(1).and_then(|index| self.steps.get_mut(index as usize))
        else {
            return false;
        };
        if step.notification_sent {
            return false;
        }
        step.notification_sent = true;
        self.touch(at);
        true
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = at;
    }
}

pub(crate) fn progress_percent(steps: &[ApprovalStep]) -> u8 {
    let total = steps.len() as u64;
    if total == 0 {
        return 0;
    }
    let done = steps
        .iter()
        .filter(|step| matches!(step.status, StepStatus::Approved | StepStatus::Skipped))
        .count() as u64;
    ((done * 200 + total) / (2 * total)) as u8
}

pub(crate) fn active_index(steps: &[ApprovalStep], level: u32) -> Result<usize, WorkflowError> {
    let index = level.checked_sub(1).map(|index| index as usize);
    match index {
        Some(index) if index < steps.len() => Ok(index),
        _ => Err(WorkflowError::LevelNotActive { requested: level, active: 0 }),
    }
}

pub(crate) fn validate_structure(steps: &[ApprovalStep]) -> Result<(), DomainError> {
    if steps.is_empty() {
        return Err(DomainError::InvariantViolation("chain has no steps".to_string()));
    }

    let mut seen = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.level != expected {
            return Err(DomainError::InvariantViolation(format!(
                "step levels must be contiguous from 1 (found {} at position {expected})",
                step.level
            )));
        }
        if !seen.insert(step.approver.key.clone()) {
            return Err(DomainError::InvariantViolation(format!(
                "approver `{}` occupies more than one step",
                step.approver.key
            )));
        }
    }
    Ok(())
}

/// Checks the single-active-level invariants for a given status and pointer.
pub(crate) fn validate_progress(
    steps: &[ApprovalStep],
    status: ChainStatus,
    current_level: u32,
) -> Result<(), DomainError> {
    let violation = |message: String| -> Result<(), DomainError> {
        Err(DomainError::InvariantViolation(message))
    };
    let done =
        |step: &ApprovalStep| matches!(step.status, StepStatus::Approved | StepStatus::Skipped);

    match status {
        ChainStatus::Pending => {
            if current_level == 0 || current_level as usize > steps.len() {
                return violation(format!("pending chain points at missing level {current_level}"));
            }
            for step in steps {
                let ok = match step.level.cmp(&current_level) {
                    std::cmp::Ordering::Less => done(step),
                    std::cmp::Ordering::Equal => step.status == StepStatus::Pending,
                    std::cmp::Ordering::Greater => {
                        matches!(step.status, StepStatus::Pending | StepStatus::Skipped)
                    }
                };
                if !ok {
                    return violation(format!(
                        "level {} is `{}` while level {current_level} is active",
                        step.level,
                        step.status.as_str()
                    ));
                }
            }
        }
        ChainStatus::Approved => {
            if current_level != 0 {
                return violation("approved chain still has an active level".to_string());
            }
            if let Some(step) = steps.iter().find(|step| !done(step)) {
                return violation(format!(
                    "approved chain has level {} in status `{}`",
                    step.level,
                    step.status.as_str()
                ));
            }
        }
        ChainStatus::Rejected => {
            if current_level != 0 {
                return violation("rejected chain still has an active level".to_string());
            }
            let rejected: Vec<&ApprovalStep> =
                steps.iter().filter(|step| step.status == StepStatus::Rejected).collect();
            let [rejected] = rejected.as_slice() else {
                return violation("rejected chain must have exactly one rejected step".to_string());
            };
            let consistent = steps.iter().all(|step| match step.level.cmp(&rejected.level) {
                std::cmp::Ordering::Less => done(step),
                std::cmp::Ordering::Equal => true,
                std::cmp::Ordering::Greater => {
                    matches!(step.status, StepStatus::Pending | StepStatus::Skipped)
                }
            });
            if !consistent {
                return violation("steps around the rejected level are inconsistent".to_string());
            }
        }
    }
    Ok(())
}
