//! Three-level task-completion chains where every decision carries a grade.
//!
//! Levels are bound at construction to the assignee's supervisor, that
//! supervisor's supervisor and the creator of the enclosing unit of work. A
//! rejection at any level wipes every recorded grade and restarts grading at
//! level 1. Completing the last non-skipped level yields the assignee's
//! completion grade and the KPI contributions it earns.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::chain::{
    progress_percent, validate_progress, ApprovalStep, ChainStatus, StepStatus,
};
use crate::domain::identity::{Capacity, IdentityKey};
use crate::domain::kpi::{contributions_for, round_2, KpiContribution, KpiLink};
use crate::domain::workflow::ChainId;
use crate::errors::{DomainError, WorkflowError};

pub const MIN_GRADE: Decimal = Decimal::ONE;
pub const MAX_GRADE: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelRole {
    ImmediateSupervisor,
    SupervisorOfSupervisor,
    OriginatingCreator,
}

impl LevelRole {
    pub const ORDER: [LevelRole; 3] =
        [Self::ImmediateSupervisor, Self::SupervisorOfSupervisor, Self::OriginatingCreator];

    pub fn level(&self) -> u32 {
        match self {
            Self::ImmediateSupervisor => 1,
            Self::SupervisorOfSupervisor => 2,
            Self::OriginatingCreator => 3,
        }
    }

    pub fn natural_capacity(&self) -> Capacity {
        match self {
            Self::ImmediateSupervisor | Self::SupervisorOfSupervisor => Capacity::DirectSupervisor,
            Self::OriginatingCreator => Capacity::ProjectCreator,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImmediateSupervisor => "immediate_supervisor",
            Self::SupervisorOfSupervisor => "supervisor_of_supervisor",
            Self::OriginatingCreator => "originating_creator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate_supervisor" => Some(Self::ImmediateSupervisor),
            "supervisor_of_supervisor" => Some(Self::SupervisorOfSupervisor),
            "originating_creator" => Some(Self::OriginatingCreator),
            _ => None,
        }
    }
}

/// The unit of work being graded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradedTask {
    pub task_ref: String,
    pub title: String,
    /// Percentage weight of the task within the assignee's objectives.
    pub weight: Decimal,
    pub kpi_links: Vec<KpiLink>,
    /// Creator of the parent project; `None` when the task stands alone.
    pub originating_creator: Option<IdentityKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradedStep {
    #[serde(flatten)]
    pub step: ApprovalStep,
    pub level_role: LevelRole,
    /// True when policy replaced the natural holder of this level.
    pub substituted: bool,
    pub grade: Option<Decimal>,
    pub effective_score: Option<Decimal>,
}

impl GradedStep {
    fn clear(&mut self) {
        if self.step.status != StepStatus::Skipped {
            self.step.clear_decision();
        }
        self.grade = None;
        self.effective_score = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionNote {
    pub level: u32,
    pub by: IdentityKey,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GradingProgress {
    Advanced { level: u32 },
    Restarted { level: u32 },
    Completed { final_grade: Decimal, contributions: Vec<KpiContribution> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub level: u32,
    pub progress: GradingProgress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradedChainSnapshot {
    pub id: ChainId,
    pub task: GradedTask,
    pub assignee: IdentityKey,
    pub steps: Vec<GradedStep>,
    pub current_level: u32,
    pub status: ChainStatus,
    pub final_grade: Option<Decimal>,
    pub last_rejection: Option<RejectionNote>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GradedCompletionChain {
    id: ChainId,
    task: GradedTask,
    assignee: IdentityKey,
    steps: Vec<GradedStep>,
    current_level: u32,
    status: ChainStatus,
    final_grade: Option<Decimal>,
    last_rejection: Option<RejectionNote>,
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GradedCompletionChain {
    pub(crate) fn open(
        task: GradedTask,
        assignee: IdentityKey,
        steps: Vec<GradedStep>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        validate_levels(&steps)?;
        let current_level = first_open_level(&steps).unwrap_or(0);
        Ok(Self {
            id: ChainId::generate(),
            task,
            assignee,
            steps,
            current_level,
            status: ChainStatus::Pending,
            final_grade: None,
            last_rejection: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn restore(snapshot: GradedChainSnapshot) -> Result<Self, DomainError> {
        validate_levels(&snapshot.steps)?;
        if snapshot.status == ChainStatus::Rejected {
            return Err(DomainError::InvariantViolation(
                "graded chains restart on rejection and are never terminally rejected".to_string(),
            ));
        }
        let plain: Vec<ApprovalStep> =
            snapshot.steps.iter().map(|graded| graded.step.clone()).collect();
        validate_progress(&plain, snapshot.status, snapshot.current_level)?;
        for graded in &snapshot.steps {
            let decided = graded.step.status == StepStatus::Approved;
            if decided != graded.grade.is_some() {
                return Err(DomainError::InvariantViolation(format!(
                    "level {} grade does not match its status `{}`",
                    graded.step.level,
                    graded.step.status.as_str()
                )));
            }
        }
        if (snapshot.status == ChainStatus::Approved) != snapshot.final_grade.is_some() {
            return Err(DomainError::InvariantViolation(
                "final grade must be present exactly when grading completed".to_string(),
            ));
        }

        Ok(Self {
            id: snapshot.id,
            task: snapshot.task,
            assignee: snapshot.assignee,
            steps: snapshot.steps,
            current_level: snapshot.current_level,
            status: snapshot.status,
            final_grade: snapshot.final_grade,
            last_rejection: snapshot.last_rejection,
            version: snapshot.version,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        })
    }

    pub fn snapshot(&self) -> GradedChainSnapshot {
        GradedChainSnapshot {
            id: self.id.clone(),
            task: self.task.clone(),
            assignee: self.assignee.clone(),
            steps: self.steps.clone(),
            current_level: self.current_level,
            status: self.status,
            final_grade: self.final_grade,
            last_rejection: self.last_rejection.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn id(&self) -> &ChainId {
        &self.id
    }

    pub fn task(&self) -> &GradedTask {
        &self.task
    }

    pub fn assignee(&self) -> &IdentityKey {
        &self.assignee
    }

    pub fn steps(&self) -> &[GradedStep] {
        &self.steps
    }

    pub fn step(&self, level: u32) -> Option<&GradedStep> {
        level.checked_sub(1).and_then(|index| self.steps.get(index as usize))
    }

    pub fn current_level(&self) -> u32 {
        self.current_level
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    pub fn final_grade(&self) -> Option<Decimal> {
        self.final_grade
    }

    pub fn last_rejection(&self) -> Option<&RejectionNote> {
        self.last_rejection.as_ref()
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

    pub fn current_grader(&self) -> Option<&GradedStep> {
        if self.is_terminal() {
            return None;
        }
        self.step(self.current_level)
    }

    pub fn progress_percent(&self) -> u8 {
        let plain: Vec<ApprovalStep> =
            self.steps.iter().map(|graded| graded.step.clone()).collect();
        progress_percent(&plain)
    }

    /// Grades the active level and advances to the next non-skipped level.
    pub fn grade_level(
        &mut self,
        level: u32,
        actor: &IdentityKey,
        grade: Decimal,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<GradingOutcome, WorkflowError> {
        let index = self.authorize(level, actor)?;
        if grade < MIN_GRADE || grade > MAX_GRADE {
            return Err(WorkflowError::InvalidGrade { grade });
        }
        let grade = grade.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero);
        let effective_score = effective_score(grade, self.task.weight);

        let graded = &mut self.steps[index];
        graded.grade = Some(grade);
        graded.effective_score = Some(effective_score);
        graded.step.status = StepStatus::Approved;
        graded.step.comment = comment;
        graded.step.decided_at = Some(at);

        let progress = match next_open_level(&self.steps, level) {
            Some(next) => {
                self.current_level = next;
                GradingProgress::Advanced { level: next }
            }
            None => {
                let final_grade = self.completion_grade().unwrap_or(grade);
                self.status = ChainStatus::Approved;
                self.current_level = 0;
                self.final_grade = Some(final_grade);
                GradingProgress::Completed {
                    final_grade,
                    contributions: contributions_for(final_grade, &self.task.kpi_links),
                }
            }
        };

        self.touch(at);
        Ok(GradingOutcome { level, progress })
    }

    /// Rejection is never partial: every grade is discarded and grading restarts.
    pub fn reject_level(
        &mut self,
        level: u32,
        actor: &IdentityKey,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<GradingOutcome, WorkflowError> {
        self.authorize(level, actor)?;

        for graded in &mut self.steps {
            graded.clear();
        }
        let restart = first_open_level(&self.steps).unwrap_or(1);
        self.current_level = restart;
        self.last_rejection = Some(RejectionNote { level, by: actor.clone(), comment, at });
        self.touch(at);

        Ok(GradingOutcome { level, progress: GradingProgress::Restarted { level: restart } })
    }

    /// Mean of the grades recorded so far, rounded to two decimals.
    pub fn completion_grade(&self) -> Option<Decimal> {
        let grades: Vec<Decimal> = self.steps.iter().filter_map(|graded| graded.grade).collect();
        if grades.is_empty() {
            return None;
        }
        let total: Decimal = grades.iter().copied().sum();
        Some(round_2(total / Decimal::from(grades.len() as u64)))
    }

    pub fn mark_notified(&mut self, level: u32, at: DateTime<Utc>) -> bool {
        let Some(graded) =
            level.checked_sub(1).and_then(|index| self.steps.get_mut(index as usize))
        else {
            return false;
        };
        if graded.step.notification_sent || graded.step.status == StepStatus::Skipped {
            return false;
        }
        graded.step.notification_sent = true;
        self.touch(at);
        true
    }

    fn authorize(&self, level: u32, actor: &IdentityKey) -> Result<usize, WorkflowError> {
        if self.is_terminal() {
            return Err(WorkflowError::NotPending { status: self.status });
        }
        if level != self.current_level {
            return Err(WorkflowError::LevelNotActive {
                requested: level,
                active: self.current_level,
            });
        }
        let index = (level - 1) as usize;
        let step = &self.steps[index].step;
        if &step.approver.key != actor {
            return Err(WorkflowError::NotAuthorized {
                level,
                entitled_key: step.approver.key.clone(),
                entitled_name: step.approver.display_name.clone(),
            });
        }
        Ok(index)
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = at;
    }
}

/// `round(grade * weight / 100, 2)`: a 4.0 on a task weighted 20 scores 0.8.
pub fn effective_score(grade: Decimal, weight: Decimal) -> Decimal {
    round_2(grade * weight / Decimal::ONE_HUNDRED)
}

fn first_open_level(steps: &[GradedStep]) -> Option<u32> {
    steps
        .iter()
        .find(|graded| graded.step.status == StepStatus::Pending)
        .map(|graded| graded.step.level)
}

fn next_open_level(steps: &[GradedStep], after: u32) -> Option<u32> {
    steps
        .iter()
        .filter(|graded| graded.step.level > after)
        .find(|graded| graded.step.status == StepStatus::Pending)
        .map(|graded| graded.step.level)
}

fn validate_levels(steps: &[GradedStep]) -> Result<(), DomainError> {
    if steps.len() != LevelRole::ORDER.len() {
        return Err(DomainError::InvariantViolation(format!(
            "graded chains have exactly 3 levels (found {})",
            steps.len()
        )));
    }

    let mut seen = HashSet::new();
    for (graded, role) in steps.iter().zip(LevelRole::ORDER) {
        if graded.level_role != role || graded.step.level != role.level() {
            return Err(DomainError::InvariantViolation(format!(
                "level {} must be bound to `{}`",
                role.level(),
                role.as_str()
            )));
        }
        if graded.step.status == StepStatus::Skipped {
            if role != LevelRole::OriginatingCreator {
                return Err(DomainError::InvariantViolation(format!(
                    "only the originating creator level may be skipped (level {})",
                    graded.step.level
                )));
            }
            continue;
        }
        if !seen.insert(graded.step.approver.key.clone()) {
            return Err(DomainError::InvariantViolation(format!(
                "`{}` grades more than one level",
                graded.step.approver.key
            )));
        }
    }
    Ok(())
}
