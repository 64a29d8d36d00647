use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable key for a person: the normalised contact address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(pub String);

impl IdentityKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(normalize_key(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Named role under which an identity may approve.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    DirectSupervisor,
    DepartmentHead,
    TechnicalDirector,
    BusinessHead,
    FinanceOfficer,
    HseCoordinator,
    ProjectManager,
    SupplyChainCoordinator,
    OperationsManager,
    ProjectCreator,
}

impl Capacity {
    pub const ALL: [Capacity; 10] = [
        Self::DirectSupervisor,
        Self::DepartmentHead,
        Self::TechnicalDirector,
        Self::BusinessHead,
        Self::FinanceOfficer,
        Self::HseCoordinator,
        Self::ProjectManager,
        Self::SupplyChainCoordinator,
        Self::OperationsManager,
        Self::ProjectCreator,
    ];

    /// Lower rank wins when picking a step's primary capacity.
    pub fn priority(&self) -> u8 {
        match self {
            Self::DirectSupervisor => 0,
            Self::DepartmentHead => 1,
            Self::TechnicalDirector => 2,
            Self::BusinessHead => 3,
            Self::FinanceOfficer => 4,
            Self::HseCoordinator => 5,
            Self::ProjectManager => 6,
            Self::SupplyChainCoordinator => 7,
            Self::OperationsManager => 8,
            Self::ProjectCreator => 9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectSupervisor => "direct_supervisor",
            Self::DepartmentHead => "department_head",
            Self::TechnicalDirector => "technical_director",
            Self::BusinessHead => "business_head",
            Self::FinanceOfficer => "finance_officer",
            Self::HseCoordinator => "hse_coordinator",
            Self::ProjectManager => "project_manager",
            Self::SupplyChainCoordinator => "supply_chain_coordinator",
            Self::OperationsManager => "operations_manager",
            Self::ProjectCreator => "project_creator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = normalize_key(value);
        Self::ALL.into_iter().find(|capacity| capacity.as_str() == key)
    }

    /// Highest-priority capacity in `capacities`, if any.
    pub fn primary_of<'a, I>(capacities: I) -> Option<Capacity>
    where
        I: IntoIterator<Item = &'a Capacity>,
    {
        capacities.into_iter().min_by_key(|capacity| capacity.priority()).cloned()
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub key: IdentityKey,
    pub display_name: String,
    pub department: Option<String>,
    pub capacities: BTreeSet<Capacity>,
    pub active: bool,
}

impl Identity {
    pub fn new(key: impl AsRef<str>, display_name: impl Into<String>) -> Self {
        Self {
            key: IdentityKey::new(key),
            display_name: display_name.into(),
            department: None,
            capacities: BTreeSet::new(),
            active: true,
        }
    }

    pub fn in_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacities.insert(capacity);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Contact address the notifier delivers to.
    pub fn contact_address(&self) -> &str {
        self.key.as_str()
    }
}

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
