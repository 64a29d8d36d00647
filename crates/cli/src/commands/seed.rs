use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use signoff_core::config::LoadOptions;
use signoff_core::domain::identity::{Capacity, Identity, IdentityKey};
use signoff_core::domain::kpi::KpiId;
use signoff_db::repositories::{DirectoryRepository, SqlDirectoryRepository};

use crate::commands::{load_config, open_pool, runtime, service, CommandResult, Failure};

/// Small organisation exercising every routing branch: a two-level hierarchy,
/// a department head, a business head and a finance officer.
pub const DEMO_ORG: &str = r#"
[[member]]
key = "rae@corp.test"
name = "Rae Analyst"
department = "operations"
supervisor = "ann@corp.test"

[[member]]
key = "ann@corp.test"
name = "Ann Lead"
department = "operations"
supervisor = "bob@corp.test"
capacities = ["direct_supervisor"]

[[member]]
key = "bob@corp.test"
name = "Bob Head"
department = "operations"
capacities = ["department_head"]

[[member]]
key = "bea@corp.test"
name = "Bea Business"
department = "operations"
capacities = ["business_head"]

[[member]]
key = "fin@corp.test"
name = "Fin Officer"
department = "finance"
capacities = ["finance_officer"]

[[member]]
key = "pam@corp.test"
name = "Pam Projects"
department = "pmo"
capacities = ["project_creator"]

[[department]]
name = "operations"
head = "bob@corp.test"

[[kpi]]
id = "kpi-delivery"
name = "On-time delivery"

[[kpi]]
id = "kpi-quality"
name = "Release quality"
"#;

#[derive(Debug, Default, Deserialize)]
pub struct OrgSeed {
    #[serde(default, rename = "member")]
    pub members: Vec<MemberSeed>,
    #[serde(default, rename = "department")]
    pub departments: Vec<DepartmentSeed>,
    #[serde(default, rename = "kpi")]
    pub kpis: Vec<KpiSeed>,
}

#[derive(Debug, Deserialize)]
pub struct MemberSeed {
    pub key: String,
    pub name: String,
    pub department: Option<String>,
    pub supervisor: Option<String>,
    #[serde(default)]
    pub capacities: Vec<String>,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct DepartmentSeed {
    pub name: String,
    pub head: String,
}

#[derive(Debug, Deserialize)]
pub struct KpiSeed {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
struct SeedSummary {
    source: String,
    members: usize,
    departments: usize,
    kpis: usize,
}

fn active_by_default() -> bool {
    true
}

impl OrgSeed {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let seed: Self = toml::from_str(raw).context("organisation seed is not valid TOML")?;
        for member in &seed.members {
            member.identity()?;
        }
        Ok(seed)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("could not read seed file `{}`", path.display()))?;
        Self::parse(&raw).with_context(|| format!("seed file `{}` was rejected", path.display()))
    }
}

impl MemberSeed {
    fn identity(&self) -> anyhow::Result<Identity> {
        let mut identity = Identity::new(&self.key, self.name.clone());
        if identity.key.as_str().is_empty() {
            bail!("member `{}` has an empty key", self.name);
        }
        if let Some(department) = &self.department {
            identity = identity.in_department(department.clone());
        }
        for raw in &self.capacities {
            let Some(capacity) = Capacity::parse(raw) else {
                bail!("member `{}` lists unknown capacity `{raw}`", self.key);
            };
            identity = identity.with_capacity(capacity);
        }
        if !self.active {
            identity = identity.inactive();
        }
        Ok(identity)
    }
}

pub fn run(options: &LoadOptions, file: Option<&Path>) -> CommandResult {
    let (seed, source) = match file {
        Some(path) => (OrgSeed::from_file(path), path.display().to_string()),
        None => (OrgSeed::parse(DEMO_ORG), "built-in demo organisation".to_string()),
    };
    let seed = match seed {
        Ok(seed) => seed,
        Err(error) => {
            return CommandResult::failure("seed", "seed_input", format!("{error:#}"), 2);
        }
    };

    let config = match load_config("seed", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let directory = SqlDirectoryRepository::new(pool.clone());
        let seeding =
            |error: anyhow::Error| Failure::setup("seed_execution", format!("{error:#}"), 5);

        for member in &seed.members {
            let identity = member.identity().map_err(seeding)?;
            let supervisor = member.supervisor.as_deref().map(IdentityKey::new);
            directory
                .upsert_member(&identity, supervisor.as_ref())
                .await
                .with_context(|| format!("member `{}`", identity.key))
                .map_err(seeding)?;
        }
        for department in &seed.departments {
            directory
                .set_department_head(&department.name, &IdentityKey::new(&department.head))
                .await
                .with_context(|| format!("department `{}`", department.name))
                .map_err(seeding)?;
        }

        let workflow = service(&config, pool.clone());
        for kpi in &seed.kpis {
            workflow
                .register_kpi(KpiId(kpi.id.clone()), &kpi.name)
                .await
                .with_context(|| format!("kpi `{}`", kpi.id))
                .map_err(seeding)?;
        }

        pool.close().await;
        Ok::<(), Failure>(())
    });

    match result {
        Ok(()) => {
            let summary = SeedSummary {
                source,
                members: seed.members.len(),
                departments: seed.departments.len(),
                kpis: seed.kpis.len(),
            };
            let message = format!(
                "seeded {} member(s), {} department head(s), {} kpi(s)",
                summary.members, summary.departments, summary.kpis
            );
            CommandResult::with_data("seed", message, summary)
        }
        Err(failure) => failure.into_result("seed"),
    }
}

#[cfg(test)]
mod tests {
    use signoff_core::domain::identity::Capacity;

    use super::{OrgSeed, DEMO_ORG};

    #[test]
    fn demo_organisation_parses() {
        let seed = OrgSeed::parse(DEMO_ORG).expect("demo parses");

        assert_eq!(seed.members.len(), 6);
        assert_eq!(seed.departments.len(), 1);
        assert_eq!(seed.kpis.len(), 2);
        let fin = seed.members.iter().find(|member| member.key == "fin@corp.test").expect("fin");
        let identity = fin.identity().expect("identity");
        assert!(identity.capacities.contains(&Capacity::FinanceOfficer));
        assert!(identity.active);
    }

    #[test]
    fn unknown_capacity_is_rejected_with_member_context() {
        let raw = "[[member]]\nkey = \"x@corp.test\"\nname = \"X\"\ncapacities = [\"wizard\"]\n";
        let error = OrgSeed::parse(raw).expect_err("unknown capacity");

        assert!(format!("{error:#}").contains("wizard"));
    }
}
