use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::WorkflowConfig;
use crate::directory::Directory;
use crate::domain::chain::{ApprovalChain, ApprovalStep, Approver, StepStatus};
use crate::domain::graded::{GradedCompletionChain, GradedStep, GradedTask, LevelRole};
use crate::domain::identity::{Capacity, Identity, IdentityKey};
use crate::domain::workflow::WorkflowRequest;
use crate::errors::{ApplicationError, WorkflowError};

/// Routing knobs shared by both builders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainPolicy {
    pub max_levels: u32,
    pub finance_officer: Option<IdentityKey>,
    pub fallback_grader: Option<IdentityKey>,
    pub require_business_head: bool,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        Self {
            max_levels: 10,
            finance_officer: None,
            fallback_grader: None,
            require_business_head: true,
        }
    }
}

impl From<&WorkflowConfig> for ChainPolicy {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_levels: config.max_levels,
            finance_officer: config.finance_officer.clone(),
            fallback_grader: config.fallback_grader.clone(),
            require_business_head: config.require_business_head,
        }
    }
}

/// Why a hierarchy walk ended. Every variant is recovered locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalkStop {
    TopOfHierarchy,
    InactiveSupervisor { key: IdentityKey },
    CycleDetected { key: IdentityKey },
    LevelLimit { max_levels: u32 },
}

impl WalkStop {
    fn is_anomaly(&self) -> bool {
        !matches!(self, Self::TopOfHierarchy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopOfHierarchy => "top_of_hierarchy",
            Self::InactiveSupervisor { .. } => "inactive_supervisor",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::LevelLimit { .. } => "level_limit",
        }
    }
}

/// Identity-keyed accumulator: one entry per person, in first-assigned order.
#[derive(Debug, Default)]
struct StepMap {
    order: Vec<Entry>,
    index: HashMap<IdentityKey, usize>,
}

#[derive(Debug)]
struct Entry {
    identity: Identity,
    routed: Vec<Capacity>,
}

impl StepMap {
    /// Adds `identity` as a new step, or merges `capacity` into its existing one.
    fn route(&mut self, identity: Identity, capacity: Capacity) {
        match self.index.get(&identity.key) {
            Some(&position) => {
                let routed = &mut self.order[position].routed;
                if !routed.contains(&capacity) {
                    routed.push(capacity);
                }
            }
            None => {
                self.index.insert(identity.key.clone(), self.order.len());
                self.order.push(Entry { identity, routed: vec![capacity] });
            }
        }
    }

    /// Routes `identity` and makes it the final step regardless of where it
    /// was first reached.
    fn route_last(&mut self, identity: Identity, capacity: Capacity) {
        self.route(identity.clone(), capacity);
        let Some(position) = self.index.get(&identity.key).copied() else {
            return;
        };
        let entry = self.order.remove(position);
        self.order.push(entry);
        self.index = self
            .order
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.identity.key.clone(), position))
            .collect();
    }

    fn into_steps(self, directory: &dyn Directory) -> Vec<ApprovalStep> {
        self.order
            .into_iter()
            .enumerate()
            .map(|(position, entry)| {
                let primary = Capacity::primary_of(&entry.routed)
                    .unwrap_or(Capacity::DirectSupervisor);
                let mut capacities = entry.routed;
                for declared in directory.capacities_of(&entry.identity.key) {
                    if !capacities.contains(&declared) {
                        capacities.push(declared);
                    }
                }
                ApprovalStep::pending(
                    position as u32 + 1,
                    Approver::from(&entry.identity),
                    primary,
                    capacities,
                )
            })
            .collect()
    }
}

/// Derives plain approval chains from the directory.
pub struct ChainBuilder<'a> {
    directory: &'a dyn Directory,
    policy: &'a ChainPolicy,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(directory: &'a dyn Directory, policy: &'a ChainPolicy) -> Self {
        Self { directory, policy }
    }

    pub fn build(
        &self,
        request: &WorkflowRequest,
        now: DateTime<Utc>,
    ) -> Result<ApprovalChain, WorkflowError> {
        let requester = self
            .directory
            .resolve(&request.requester)
            .ok_or_else(|| WorkflowError::NotFound { key: request.requester.clone() })?;

        let steps = if request.kind.has_fixed_shape() {
            self.fixed_shape(&requester)?
        } else {
            self.hierarchy_walk(&requester, request)?
        };

        ApprovalChain::open(request.clone(), steps.into_steps(self.directory), now)
    }

    fn hierarchy_walk(
        &self,
        requester: &Identity,
        request: &WorkflowRequest,
    ) -> Result<StepMap, WorkflowError> {
        let mut steps = StepMap::default();
        let mut visited = HashSet::from([requester.key.clone()]);
        let mut last = requester.clone();
        let mut walked = 0_u32;

        let stop = loop {
            if walked >= self.policy.max_levels {
                break WalkStop::LevelLimit { max_levels: self.policy.max_levels };
            }
            let Some(supervisor) = self.directory.supervisor_of(&last.key) else {
                break WalkStop::TopOfHierarchy;
            };
            if !supervisor.active {
                break WalkStop::InactiveSupervisor { key: supervisor.key };
            }
            if !visited.insert(supervisor.key.clone()) {
                break WalkStop::CycleDetected { key: supervisor.key };
            }

            debug!(
                event_name = "approval.walk.hop",
                requester = %requester.key,
                from = %last.key,
                supervisor = %supervisor.key,
                "walked to supervisor"
            );
            steps.route(supervisor.clone(), Capacity::DirectSupervisor);
            last = supervisor;
            walked += 1;
        };

        if stop.is_anomaly() {
            warn!(
                event_name = "approval.walk.truncated",
                requester = %requester.key,
                request_ref = %request.request_ref,
                reason = stop.as_str(),
                reached = %last.key,
                "hierarchy walk stopped early; falling back to department head"
            );
        }

        if let Some(head) = self.directory.department_head_of(&last.key) {
            if head.key == requester.key {
                debug!(requester = %requester.key, "requester heads the department; skipped");
            } else if !head.active {
                warn!(
                    event_name = "approval.walk.inactive_head",
                    requester = %requester.key,
                    head = %head.key,
                    "department head is inactive; skipped"
                );
            } else {
                steps.route(head, Capacity::DepartmentHead);
            }
        }

        if request.needs_finance() {
            let finance = self.finance_officer(requester)?;
            steps.route_last(finance, Capacity::FinanceOfficer);
        }

        Ok(steps)
    }

    /// Supervisor, department head, business head, finance: each role is
    /// resolved from the requester and merged into an earlier step when the
    /// same person already holds one.
    fn fixed_shape(&self, requester: &Identity) -> Result<StepMap, WorkflowError> {
        let mut steps = StepMap::default();
        let eligible = |candidate: &Identity| candidate.active && candidate.key != requester.key;

        if let Some(supervisor) =
            self.directory.supervisor_of(&requester.key).filter(|candidate| eligible(candidate))
        {
            steps.route(supervisor, Capacity::DirectSupervisor);
        }
        if let Some(head) = self
            .directory
            .department_head_of(&requester.key)
            .filter(|candidate| eligible(candidate))
        {
            steps.route(head, Capacity::DepartmentHead);
        }
        if self.policy.require_business_head {
            let business_head = self
                .directory
                .holder_of(&Capacity::BusinessHead, requester.department.as_deref())
                .filter(|candidate| eligible(candidate));
            match business_head {
                Some(business_head) => steps.route(business_head, Capacity::BusinessHead),
                None => warn!(
                    event_name = "approval.walk.missing_role",
                    requester = %requester.key,
                    role = Capacity::BusinessHead.as_str(),
                    "no business head resolvable; role skipped"
                ),
            }
        }

        let finance = self.finance_officer(requester)?;
        steps.route_last(finance, Capacity::FinanceOfficer);
        Ok(steps)
    }

    /// The configured finance officer, or another active finance officer when the
    /// configured one is inactive or filed the request.
    fn finance_officer(&self, requester: &Identity) -> Result<Identity, WorkflowError> {
        let key =
            self.policy.finance_officer.as_ref().ok_or(WorkflowError::FinanceOfficerUnconfigured)?;
        let configured = self
            .directory
            .resolve(key)
            .ok_or_else(|| WorkflowError::NotFound { key: key.clone() })?;
        let eligible = |candidate: &Identity| candidate.active && candidate.key != requester.key;
        if eligible(&configured) {
            return Ok(configured);
        }

        let alternate = self
            .directory
            .holders_of(&Capacity::FinanceOfficer)
            .into_iter()
            .find(|candidate| eligible(candidate))
            .ok_or_else(|| WorkflowError::NoEligibleFinanceOfficer {
                requester: requester.key.clone(),
            })?;
        warn!(
            event_name = "approval.finance.substituted",
            requester = %requester.key,
            configured = %configured.key,
            substitute = %alternate.key,
            "configured finance officer cannot approve this request; substituted"
        );
        Ok(alternate)
    }
}

/// Binds the three graded levels, substituting when a natural grader cannot
/// serve.
pub struct GradedChainBuilder<'a> {
    directory: &'a dyn Directory,
    policy: &'a ChainPolicy,
}

impl<'a> GradedChainBuilder<'a> {
    pub fn new(directory: &'a dyn Directory, policy: &'a ChainPolicy) -> Self {
        Self { directory, policy }
    }

    pub fn build(
        &self,
        task: GradedTask,
        assignee: &IdentityKey,
        now: DateTime<Utc>,
    ) -> Result<GradedCompletionChain, ApplicationError> {
        let assignee = self
            .directory
            .resolve(assignee)
            .ok_or_else(|| WorkflowError::NotFound { key: assignee.clone() })?;

        // Level 2 follows the reporting line even when level 1 is substituted.
        let immediate = self.directory.supervisor_of(&assignee.key);
        let second = immediate.as_ref().and_then(|lead| self.directory.supervisor_of(&lead.key));
        let creator = match &task.originating_creator {
            Some(key) => Some(
                self.directory
                    .resolve(key)
                    .ok_or_else(|| WorkflowError::NotFound { key: key.clone() })?,
            ),
            None => None,
        };

        let mut used: HashSet<IdentityKey> = HashSet::new();
        let mut steps = Vec::with_capacity(LevelRole::ORDER.len());
        for (role, natural) in
            LevelRole::ORDER.into_iter().zip([immediate, second, creator])
        {
            if role == LevelRole::OriginatingCreator && task.originating_creator.is_none() {
                steps.push(skipped_step(role, &assignee));
                continue;
            }
            let step = self.bind_level(role, natural, &assignee, &used)?;
            used.insert(step.step.approver.key.clone());
            steps.push(step);
        }

        Ok(GradedCompletionChain::open(task, assignee.key, steps, now)?)
    }

    fn bind_level(
        &self,
        role: LevelRole,
        natural: Option<Identity>,
        assignee: &Identity,
        used: &HashSet<IdentityKey>,
    ) -> Result<GradedStep, WorkflowError> {
        let usable = |candidate: &Identity| {
            candidate.active && candidate.key != assignee.key && !used.contains(&candidate.key)
        };

        if let Some(natural) = natural.filter(|candidate| usable(candidate)) {
            return Ok(graded_step(role, &natural, role.natural_capacity(), false));
        }

        let level = role.level();
        let head = self
            .directory
            .department_head_of(&assignee.key)
            .filter(|candidate| usable(candidate))
            .map(|head| (head, Capacity::DepartmentHead));
        let fallback = || {
            self.policy
                .fallback_grader
                .as_ref()
                .and_then(|key| self.directory.resolve(key))
                .filter(|candidate| usable(candidate))
                .map(|grader| (grader, role.natural_capacity()))
        };

        let (substitute, capacity) =
            head.or_else(fallback).ok_or(WorkflowError::NoAlternateApprover { level })?;
        warn!(
            event_name = "grading.level_substituted",
            assignee = %assignee.key,
            level,
            role = role.as_str(),
            substitute = %substitute.key,
            "natural grader unavailable; substituted"
        );
        Ok(graded_step(role, &substitute, capacity, true))
    }
}

fn graded_step(
    role: LevelRole,
    identity: &Identity,
    capacity: Capacity,
    substituted: bool,
) -> GradedStep {
    GradedStep {
        step: ApprovalStep::pending(
            role.level(),
            Approver::from(identity),
            capacity.clone(),
            vec![capacity],
        ),
        level_role: role,
        substituted,
        grade: None,
        effective_score: None,
    }
}

/// Level 3 without an originating unit of work: pre-approved, attributed to
/// the assignee.
fn skipped_step(role: LevelRole, assignee: &Identity) -> GradedStep {
    let mut graded = graded_step(role, assignee, role.natural_capacity(), false);
    graded.step.status = StepStatus::Skipped;
    graded
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;

    use super::{ChainBuilder, ChainPolicy, GradedChainBuilder};
    use crate::directory::InMemoryDirectory;
    use crate::domain::chain::StepStatus;
    use crate::domain::graded::{GradedTask, LevelRole};
    use crate::domain::identity::{Capacity, Identity, IdentityKey};
    use crate::domain::workflow::{WorkflowKind, WorkflowRequest};
    use crate::errors::{ApplicationError, WorkflowError};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-11T10:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    fn person(key: &str, department: &str) -> Identity {
        Identity::new(key, key.split('@').next().unwrap_or(key)).in_department(department)
    }

    fn keys(chain: &crate::domain::chain::ApprovalChain) -> Vec<&str> {
        chain.steps().iter().map(|step| step.approver.key.as_str()).collect()
    }

    /// req -> a -> b, where b heads engineering.
    fn org() -> InMemoryDirectory {
        InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "engineering"))
            .with_identity(person("a@corp.test", "engineering"))
            .with_identity(
                person("b@corp.test", "engineering").with_capacity(Capacity::DepartmentHead),
            )
            .with_identity(
                person("fin@corp.test", "finance").with_capacity(Capacity::FinanceOfficer),
            )
            .with_identity(
                person("biz@corp.test", "engineering").with_capacity(Capacity::BusinessHead),
            )
            .with_supervisor("req@corp.test", "a@corp.test")
            .with_supervisor("a@corp.test", "b@corp.test")
            .with_department_head("engineering", "b@corp.test")
    }

    fn policy() -> ChainPolicy {
        ChainPolicy {
            finance_officer: Some(IdentityKey::new("fin@corp.test")),
            ..ChainPolicy::default()
        }
    }

    fn request(kind: WorkflowKind) -> WorkflowRequest {
        WorkflowRequest::new("REQ-1", "New monitors", kind, "req@corp.test")
    }

    #[test]
    fn supervisor_who_heads_the_department_occupies_one_step() {
        let directory = org();
        let policy = policy();
        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::General), now())
            .expect("chain builds");

        assert_eq!(keys(&chain), vec!["a@corp.test", "b@corp.test"]);
        let first = chain.step(1).expect("level 1");
        assert_eq!(first.capacity, Capacity::DirectSupervisor);
        assert_eq!(first.capacities, vec![Capacity::DirectSupervisor]);
        let second = chain.step(2).expect("level 2");
        assert_eq!(second.capacity, Capacity::DirectSupervisor);
        assert_eq!(second.capacities, vec![Capacity::DirectSupervisor, Capacity::DepartmentHead]);
        assert_eq!(chain.current_level(), 1);
        assert!(chain.steps().iter().all(|step| step.status == StepStatus::Pending));
    }

    #[test]
    fn department_head_who_is_finance_officer_merges_into_one_final_step() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "ops"))
            .with_identity(person("sup@corp.test", "ops"))
            .with_identity(person("fin@corp.test", "ops").with_capacity(Capacity::FinanceOfficer))
            .with_supervisor("req@corp.test", "sup@corp.test")
            .with_department_head("ops", "fin@corp.test");
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Purchase), now())
            .expect("chain builds");

        assert_eq!(keys(&chain), vec!["sup@corp.test", "fin@corp.test"]);
        let last = chain.step(2).expect("level 2");
        assert_eq!(last.capacities, vec![Capacity::DepartmentHead, Capacity::FinanceOfficer]);
        assert_eq!(last.capacity, Capacity::DepartmentHead);
    }

    #[test]
    fn finance_officer_met_mid_walk_is_moved_to_the_final_level() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "ops"))
            .with_identity(person("fin@corp.test", "ops"))
            .with_identity(person("boss@corp.test", "ops"))
            .with_supervisor("req@corp.test", "fin@corp.test")
            .with_supervisor("fin@corp.test", "boss@corp.test");
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Budget), now())
            .expect("chain builds");

        assert_eq!(keys(&chain), vec!["boss@corp.test", "fin@corp.test"]);
        let levels: Vec<u32> = chain.steps().iter().map(|step| step.level).collect();
        assert_eq!(levels, vec![1, 2]);
        let last = chain.step(2).expect("level 2");
        assert!(last.holds(&Capacity::DirectSupervisor));
        assert!(last.holds(&Capacity::FinanceOfficer));
        let finance_steps = chain
            .steps()
            .iter()
            .filter(|step| step.approver.key.as_str() == "fin@corp.test")
            .count();
        assert_eq!(finance_steps, 1);
    }

    #[test]
    fn hierarchy_cycle_truncates_the_walk_instead_of_failing() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "loop"))
            .with_identity(person("x@corp.test", "loop"))
            .with_identity(person("y@corp.test", "loop"))
            .with_supervisor("req@corp.test", "x@corp.test")
            .with_supervisor("x@corp.test", "y@corp.test")
            .with_supervisor("y@corp.test", "x@corp.test");
        let policy = ChainPolicy::default();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::General), now())
            .expect("cycle is recovered");

        assert_eq!(keys(&chain), vec!["x@corp.test", "y@corp.test"]);
    }

    #[test]
    fn walk_back_to_the_requester_stops_the_walk() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "loop"))
            .with_identity(person("x@corp.test", "loop"))
            .with_supervisor("req@corp.test", "x@corp.test")
            .with_supervisor("x@corp.test", "req@corp.test");
        let policy = ChainPolicy::default();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::General), now())
            .expect("walk ends");

        assert_eq!(keys(&chain), vec!["x@corp.test"]);
    }

    #[test]
    fn walk_is_bounded_by_max_levels() {
        let mut directory = InMemoryDirectory::new().with_identity(person("p0@corp.test", "tall"));
        for index in 1..=8 {
            directory = directory
                .with_identity(person(&format!("p{index}@corp.test"), "tall"))
                .with_supervisor(
                    format!("p{}@corp.test", index - 1),
                    format!("p{index}@corp.test"),
                );
        }
        let policy = ChainPolicy { max_levels: 3, ..ChainPolicy::default() };

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&WorkflowRequest::new("R", "T", WorkflowKind::General, "p0@corp.test"), now())
            .expect("bounded walk");

        assert_eq!(keys(&chain), vec!["p1@corp.test", "p2@corp.test", "p3@corp.test"]);
    }

    #[test]
    fn inactive_supervisor_ends_the_walk_and_department_head_is_the_fallback() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "sales"))
            .with_identity(person("gone@corp.test", "sales").inactive())
            .with_identity(person("head@corp.test", "sales"))
            .with_supervisor("req@corp.test", "gone@corp.test")
            .with_department_head("sales", "head@corp.test");
        let policy = ChainPolicy::default();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::CustomerOnboarding), now())
            .expect("fallback to head");

        assert_eq!(keys(&chain), vec!["head@corp.test"]);
        assert_eq!(chain.step(1).map(|step| step.capacity.clone()), Some(Capacity::DepartmentHead));
    }

    #[test]
    fn requester_without_any_approver_gets_an_empty_chain_error() {
        let directory = InMemoryDirectory::new().with_identity(person("solo@corp.test", "none"));
        let policy = ChainPolicy::default();

        let error = ChainBuilder::new(&directory, &policy)
            .build(&WorkflowRequest::new("R", "T", WorkflowKind::General, "solo@corp.test"), now())
            .expect_err("nobody to approve");

        assert_eq!(
            error,
            WorkflowError::EmptyChain { requester: IdentityKey::new("solo@corp.test") }
        );
    }

    #[test]
    fn unknown_requester_is_not_found() {
        let directory = org();
        let policy = policy();

        let error = ChainBuilder::new(&directory, &policy)
            .build(&WorkflowRequest::new("R", "T", WorkflowKind::General, "who@corp.test"), now())
            .expect_err("unknown requester");

        assert_eq!(error, WorkflowError::NotFound { key: IdentityKey::new("who@corp.test") });
    }

    #[test]
    fn finance_workflow_without_a_configured_officer_fails() {
        let directory = org();
        let policy = ChainPolicy::default();

        let error = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Purchase), now())
            .expect_err("no finance officer");

        assert_eq!(error, WorkflowError::FinanceOfficerUnconfigured);
    }

    #[test]
    fn explicit_finance_flag_adds_finance_to_a_general_request() {
        let directory = org();
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::General).with_finance(), now())
            .expect("chain builds");

        assert_eq!(keys(&chain), vec!["a@corp.test", "b@corp.test", "fin@corp.test"]);
    }

    #[test]
    fn invoice_follows_the_fixed_four_role_shape() {
        let directory = org();
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Invoice), now())
            .expect("invoice chain");

        assert_eq!(
            keys(&chain),
            vec!["a@corp.test", "b@corp.test", "biz@corp.test", "fin@corp.test"]
        );
        assert_eq!(
            chain.steps().iter().map(|step| step.capacity.clone()).collect::<Vec<_>>(),
            vec![
                Capacity::DirectSupervisor,
                Capacity::DepartmentHead,
                Capacity::BusinessHead,
                Capacity::FinanceOfficer,
            ]
        );
    }

    #[test]
    fn invoice_keeps_finance_when_every_other_role_is_missing() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "solo"))
            .with_identity(person("fin@corp.test", "finance"));
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Invoice), now())
            .expect("finance only");

        assert_eq!(keys(&chain), vec!["fin@corp.test"]);
        assert_eq!(chain.step(1).map(|step| step.capacity.clone()), Some(Capacity::FinanceOfficer));
    }

    #[test]
    fn invoice_department_head_who_is_finance_officer_approves_once_at_the_end() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "ops"))
            .with_identity(person("sup@corp.test", "ops"))
            .with_identity(person("fin@corp.test", "ops").with_capacity(Capacity::FinanceOfficer))
            .with_identity(person("biz@corp.test", "ops").with_capacity(Capacity::BusinessHead))
            .with_supervisor("req@corp.test", "sup@corp.test")
            .with_department_head("ops", "fin@corp.test");
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Invoice), now())
            .expect("invoice chain");

        assert_eq!(keys(&chain), vec!["sup@corp.test", "biz@corp.test", "fin@corp.test"]);
        let last = chain.steps().last().expect("final step");
        assert_eq!(last.level, 3);
        assert_eq!(last.capacities, vec![Capacity::DepartmentHead, Capacity::FinanceOfficer]);
        let finance_steps = chain
            .steps()
            .iter()
            .filter(|step| step.holds(&Capacity::FinanceOfficer))
            .count();
        assert_eq!(finance_steps, 1);
    }

    #[test]
    fn finance_officer_filing_a_request_is_replaced_by_another_officer() {
        let directory = org()
            .with_identity(person("cfo@corp.test", "finance"))
            .with_identity(
                person("fin2@corp.test", "finance").with_capacity(Capacity::FinanceOfficer),
            )
            .with_supervisor("fin@corp.test", "cfo@corp.test");
        let policy = policy();
        let purchase =
            WorkflowRequest::new("PO-9", "Ledger licence", WorkflowKind::Purchase, "fin@corp.test");

        let chain = ChainBuilder::new(&directory, &policy).build(&purchase, now()).expect("chain");

        assert_eq!(keys(&chain), vec!["cfo@corp.test", "fin2@corp.test"]);
        assert_eq!(chain.step(2).map(|step| step.capacity.clone()), Some(Capacity::FinanceOfficer));
    }

    #[test]
    fn finance_request_without_an_eligible_officer_is_refused() {
        let policy = policy();
        let self_approval =
            WorkflowRequest::new("PO-3", "Chairs", WorkflowKind::Purchase, "fin@corp.test");
        let error = ChainBuilder::new(&org(), &policy)
            .build(&self_approval, now())
            .expect_err("officer cannot approve own request");
        assert_eq!(
            error,
            WorkflowError::NoEligibleFinanceOfficer { requester: IdentityKey::new("fin@corp.test") }
        );

        let directory = org().with_identity(
            person("fin@corp.test", "finance").with_capacity(Capacity::FinanceOfficer).inactive(),
        );
        let error = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Purchase), now())
            .expect_err("inactive officer");
        assert_eq!(
            error,
            WorkflowError::NoEligibleFinanceOfficer { requester: IdentityKey::new("req@corp.test") }
        );
    }

    #[test]
    fn invoice_merges_roles_held_by_the_same_person() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "ops"))
            .with_identity(person("boss@corp.test", "ops").with_capacity(Capacity::BusinessHead))
            .with_identity(person("fin@corp.test", "finance"))
            .with_supervisor("req@corp.test", "boss@corp.test")
            .with_department_head("ops", "boss@corp.test");
        let policy = policy();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::Invoice), now())
            .expect("invoice chain");

        assert_eq!(keys(&chain), vec!["boss@corp.test", "fin@corp.test"]);
        let first = chain.step(1).expect("level 1");
        assert_eq!(
            first.capacities,
            vec![Capacity::DirectSupervisor, Capacity::DepartmentHead, Capacity::BusinessHead]
        );
    }

    #[test]
    fn declared_capacities_are_kept_for_audit_without_changing_the_primary() {
        let directory = InMemoryDirectory::new()
            .with_identity(person("req@corp.test", "rnd"))
            .with_identity(
                person("td@corp.test", "rnd").with_capacity(Capacity::TechnicalDirector),
            )
            .with_supervisor("req@corp.test", "td@corp.test");
        let policy = ChainPolicy::default();

        let chain = ChainBuilder::new(&directory, &policy)
            .build(&request(WorkflowKind::TaskCompletion), now())
            .expect("chain builds");

        let step = chain.step(1).expect("level 1");
        assert_eq!(step.capacity, Capacity::DirectSupervisor);
        assert_eq!(step.capacities, vec![Capacity::DirectSupervisor, Capacity::TechnicalDirector]);
    }

    fn graded_org() -> InMemoryDirectory {
        InMemoryDirectory::new()
            .with_identity(person("dev@corp.test", "eng"))
            .with_identity(person("lead@corp.test", "eng"))
            .with_identity(person("mgr@corp.test", "eng"))
            .with_identity(person("head@corp.test", "eng"))
            .with_identity(person("pm@corp.test", "pmo"))
            .with_identity(person("hr@corp.test", "people"))
            .with_supervisor("dev@corp.test", "lead@corp.test")
            .with_supervisor("lead@corp.test", "mgr@corp.test")
            .with_department_head("eng", "head@corp.test")
    }

    fn task(creator: Option<&str>) -> GradedTask {
        GradedTask {
            task_ref: "TASK-1".into(),
            title: "Ship exporter".into(),
            weight: Decimal::new(20, 0),
            kpi_links: Vec::new(),
            originating_creator: creator.map(IdentityKey::new),
        }
    }

    fn graders(chain: &crate::domain::graded::GradedCompletionChain) -> Vec<&str> {
        chain.steps().iter().map(|graded| graded.step.approver.key.as_str()).collect()
    }

    #[test]
    fn graded_levels_bind_to_supervisor_chain_and_creator() {
        let directory = graded_org();
        let policy = ChainPolicy::default();

        let chain = GradedChainBuilder::new(&directory, &policy)
            .build(task(Some("pm@corp.test")), &IdentityKey::new("dev@corp.test"), now())
            .expect("graded chain");

        assert_eq!(graders(&chain), vec!["lead@corp.test", "mgr@corp.test", "pm@corp.test"]);
        assert!(chain.steps().iter().all(|graded| !graded.substituted));
        assert_eq!(
            chain.steps().iter().map(|graded| graded.level_role).collect::<Vec<_>>(),
            LevelRole::ORDER.to_vec()
        );
    }

    #[test]
    fn standalone_task_skips_the_creator_level() {
        let directory = graded_org();
        let policy = ChainPolicy::default();

        let chain = GradedChainBuilder::new(&directory, &policy)
            .build(task(None), &IdentityKey::new("dev@corp.test"), now())
            .expect("graded chain");

        assert_eq!(chain.step(3).map(|graded| graded.step.status), Some(StepStatus::Skipped));
        assert_eq!(chain.current_level(), 1);
    }

    #[test]
    fn creator_who_already_grades_is_replaced_by_the_department_head() {
        let directory = graded_org();
        let policy = ChainPolicy::default();

        let chain = GradedChainBuilder::new(&directory, &policy)
            .build(task(Some("lead@corp.test")), &IdentityKey::new("dev@corp.test"), now())
            .expect("graded chain");

        assert_eq!(graders(&chain), vec!["lead@corp.test", "mgr@corp.test", "head@corp.test"]);
        let third = chain.step(3).expect("level 3");
        assert!(third.substituted);
        assert_eq!(third.step.capacity, Capacity::DepartmentHead);
    }

    #[test]
    fn taken_department_head_falls_through_to_the_fallback_grader() {
        let directory = graded_org().with_department_head("eng", "mgr@corp.test");
        let policy = ChainPolicy {
            fallback_grader: Some(IdentityKey::new("hr@corp.test")),
            ..ChainPolicy::default()
        };

        let chain = GradedChainBuilder::new(&directory, &policy)
            .build(task(Some("mgr@corp.test")), &IdentityKey::new("dev@corp.test"), now())
            .expect("graded chain");

        assert_eq!(graders(&chain), vec!["lead@corp.test", "mgr@corp.test", "hr@corp.test"]);
    }

    #[test]
    fn no_distinct_substitute_is_an_error() {
        let directory = graded_org().with_department_head("eng", "lead@corp.test");
        let policy = ChainPolicy::default();

        let error = GradedChainBuilder::new(&directory, &policy)
            .build(task(Some("mgr@corp.test")), &IdentityKey::new("dev@corp.test"), now())
            .expect_err("no alternate");

        assert_eq!(
            error,
            ApplicationError::Workflow(WorkflowError::NoAlternateApprover { level: 3 })
        );
    }

    #[test]
    fn assignee_without_a_supervisor_is_graded_by_substitutes() {
        let directory = graded_org().with_identity(person("solo@corp.test", "eng"));
        let policy = ChainPolicy {
            fallback_grader: Some(IdentityKey::new("hr@corp.test")),
            ..ChainPolicy::default()
        };

        let chain = GradedChainBuilder::new(&directory, &policy)
            .build(task(Some("pm@corp.test")), &IdentityKey::new("solo@corp.test"), now())
            .expect("graded chain");

        assert_eq!(graders(&chain), vec!["head@corp.test", "hr@corp.test", "pm@corp.test"]);
        let substituted: Vec<bool> =
            chain.steps().iter().map(|graded| graded.substituted).collect();
        assert_eq!(substituted, vec![true, true, false]);
        assert_eq!(
            chain.step(1).map(|graded| graded.step.capacity.clone()),
            Some(Capacity::DepartmentHead)
        );
    }

    #[test]
    fn inactive_supervisor_is_substituted_but_still_anchors_level_two() {
        let directory = graded_org().with_identity(person("lead@corp.test", "eng").inactive());
        let policy = ChainPolicy::default();

        let chain = GradedChainBuilder::new(&directory, &policy)
            .build(task(None), &IdentityKey::new("dev@corp.test"), now())
            .expect("graded chain");

        assert_eq!(graders(&chain), vec!["head@corp.test", "mgr@corp.test", "dev@corp.test"]);
        assert!(chain.step(1).is_some_and(|graded| graded.substituted));
        assert!(chain.step(2).is_some_and(|graded| !graded.substituted));
    }
}
