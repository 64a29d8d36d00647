use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::identity::{normalize_key, Capacity, Identity, IdentityKey};

/// Read-only view of the organisation. The engine never mutates it.
pub trait Directory: Send + Sync {
    fn resolve(&self, key: &IdentityKey) -> Option<Identity>;

    fn supervisor_of(&self, key: &IdentityKey) -> Option<Identity>;

    fn department_head_of(&self, key: &IdentityKey) -> Option<Identity>;

    fn capacities_of(&self, key: &IdentityKey) -> BTreeSet<Capacity>;

    /// Active holder of `capacity`, preferring one inside `department`.
    fn holder_of(&self, capacity: &Capacity, department: Option<&str>) -> Option<Identity>;

    /// Every active holder of `capacity`, ordered by key.
    fn holders_of(&self, capacity: &Capacity) -> Vec<Identity>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    identities: BTreeMap<IdentityKey, Identity>,
    supervisors: HashMap<IdentityKey, IdentityKey>,
    department_heads: HashMap<String, IdentityKey>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.insert_identity(identity);
        self
    }

    pub fn with_supervisor(mut self, member: impl AsRef<str>, supervisor: impl AsRef<str>) -> Self {
        self.set_supervisor(IdentityKey::new(member), IdentityKey::new(supervisor));
        self
    }

    pub fn with_department_head(
        mut self,
        department: impl AsRef<str>,
        head: impl AsRef<str>,
    ) -> Self {
        self.set_department_head(department.as_ref(), IdentityKey::new(head));
        self
    }

    pub fn insert_identity(&mut self, identity: Identity) {
        self.identities.insert(identity.key.clone(), identity);
    }

    pub fn set_supervisor(&mut self, member: IdentityKey, supervisor: IdentityKey) {
        self.supervisors.insert(member, supervisor);
    }

    pub fn set_department_head(&mut self, department: &str, head: IdentityKey) {
        self.department_heads.insert(normalize_key(department), head);
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Supervisor link as recorded, without resolving the target.
    pub fn supervisor_key(&self, member: &IdentityKey) -> Option<&IdentityKey> {
        self.supervisors.get(member)
    }

    pub fn department_heads(&self) -> impl Iterator<Item = (&String, &IdentityKey)> {
        self.department_heads.iter()
    }
}

impl Directory for InMemoryDirectory {
    fn resolve(&self, key: &IdentityKey) -> Option<Identity> {
        self.identities.get(key).cloned()
    }

    fn supervisor_of(&self, key: &IdentityKey) -> Option<Identity> {
        self.supervisors.get(key).and_then(|supervisor| self.resolve(supervisor))
    }

    fn department_head_of(&self, key: &IdentityKey) -> Option<Identity> {
        let department = self.identities.get(key)?.department.as_deref()?;
        self.department_heads.get(&normalize_key(department)).and_then(|head| self.resolve(head))
    }

    fn capacities_of(&self, key: &IdentityKey) -> BTreeSet<Capacity> {
        self.identities.get(key).map(|identity| identity.capacities.clone()).unwrap_or_default()
    }

    fn holder_of(&self, capacity: &Capacity, department: Option<&str>) -> Option<Identity> {
        let holders = || {
            self.identities
                .values()
                .filter(|identity| identity.active && identity.capacities.contains(capacity))
        };

        let department = department.map(normalize_key);
        let scoped = department.as_ref().and_then(|department| {
            holders().find(|identity| {
                identity.department.as_deref().map(normalize_key).as_ref() == Some(department)
            })
        });

        scoped.or_else(|| holders().next()).cloned()
    }

    fn holders_of(&self, capacity: &Capacity) -> Vec<Identity> {
        self.identities
            .values()
            .filter(|identity| identity.active && identity.capacities.contains(capacity))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Directory, InMemoryDirectory};
    use crate::domain::identity::{Capacity, Identity, IdentityKey};

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::new()
            .with_identity(Identity::new("dev@corp.test", "Dev").in_department("Engineering"))
            .with_identity(
                Identity::new("Lead@Corp.Test", "Lead")
                    .in_department("engineering")
                    .with_capacity(Capacity::DepartmentHead),
            )
            .with_identity(
                Identity::new("bh-eng@corp.test", "Eng BH")
                    .in_department("Engineering")
                    .with_capacity(Capacity::BusinessHead),
            )
            .with_identity(
                Identity::new("bh-ops@corp.test", "Ops BH")
                    .in_department("Operations")
                    .with_capacity(Capacity::BusinessHead),
            )
            .with_supervisor("dev@corp.test", "lead@corp.test")
            .with_department_head("Engineering", "lead@corp.test")
    }

    #[test]
    fn lookups_are_keyed_by_normalised_address() {
        let directory = directory();
        let key = IdentityKey::new("  DEV@corp.test ");

        assert_eq!(
            directory.resolve(&key).map(|identity| identity.display_name),
            Some("Dev".to_string())
        );
        assert_eq!(
            directory.supervisor_of(&key).map(|identity| identity.key),
            Some(IdentityKey::new("lead@corp.test"))
        );
        assert_eq!(
            directory.department_head_of(&key).map(|identity| identity.key),
            Some(IdentityKey::new("lead@corp.test"))
        );
        assert!(directory
            .capacities_of(&IdentityKey::new("lead@corp.test"))
            .contains(&Capacity::DepartmentHead));
    }

    #[test]
    fn holder_lookup_prefers_the_department_then_falls_back() {
        let directory = directory();

        let scoped = directory.holder_of(&Capacity::BusinessHead, Some("operations"));
        assert_eq!(scoped.map(|identity| identity.key), Some(IdentityKey::new("bh-ops@corp.test")));

        let fallback = directory.holder_of(&Capacity::BusinessHead, Some("Legal"));
        assert_eq!(
            fallback.map(|identity| identity.key),
            Some(IdentityKey::new("bh-eng@corp.test"))
        );
        assert!(directory.holder_of(&Capacity::FinanceOfficer, None).is_none());

        let keys: Vec<IdentityKey> = directory
            .holders_of(&Capacity::BusinessHead)
            .into_iter()
            .map(|identity| identity.key)
            .collect();
        assert_eq!(
            keys,
            [IdentityKey::new("bh-eng@corp.test"), IdentityKey::new("bh-ops@corp.test")]
        );
    }

    #[test]
    fn missing_links_resolve_to_none() {
        let directory = directory();
        let lead = IdentityKey::new("lead@corp.test");

        assert!(directory.supervisor_of(&lead).is_none());
        assert!(directory.resolve(&IdentityKey::new("ghost@corp.test")).is_none());
        assert!(directory.capacities_of(&IdentityKey::new("ghost@corp.test")).is_empty());
    }
}
