use serde::Serialize;
use signoff_core::config::{AppConfig, LoadOptions};
use signoff_core::directory::Directory;
use signoff_core::domain::identity::IdentityKey;
use signoff_db::repositories::{DirectoryRepository, SqlDirectoryRepository};
use signoff_db::{connect_from_config, migrations};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DATABASE_CHECKS: [&str; 4] =
    ["database_connectivity", "schema_current", "finance_officer", "fallback_grader"];

pub fn run(options: &LoadOptions, json_output: bool) -> String {
    let report = build_report(options);

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(options: &LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options.clone()) {
        Ok(config) => {
            let details = "configuration loaded and validated";
            checks.push(DoctorCheck::pass("config_validation", details));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in DATABASE_CHECKS {
                checks.push(DoctorCheck::skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let mut checks = vec![DoctorCheck::fail(
                "database_connectivity",
                format!("failed to initialize async runtime: {error}"),
            )];
            for name in &DATABASE_CHECKS[1..] {
                checks.push(DoctorCheck::skipped(*name, "the async runtime did not start"));
            }
            return checks;
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                let mut checks = vec![DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to connect to database: {error}"),
                )];
                for name in &DATABASE_CHECKS[1..] {
                    checks.push(DoctorCheck::skipped(*name, "the database is unreachable"));
                }
                return checks;
            }
        };

        let mut checks = vec![DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`", config.database.url),
        )];

        let schema = match migrations::pending_count(&pool).await {
            Ok(0) => DoctorCheck::pass("schema_current", "all migrations applied"),
            Ok(pending) => DoctorCheck::fail(
                "schema_current",
                format!("{pending} migration(s) pending; run `signoff migrate`"),
            ),
            Err(error) => DoctorCheck::fail("schema_current", error.to_string()),
        };
        let schema_ready = schema.status == CheckStatus::Pass;
        checks.push(schema);

        if schema_ready {
            match SqlDirectoryRepository::new(pool.clone()).load().await {
                Ok(directory) => {
                    checks.push(check_identity(
                        "finance_officer",
                        config.workflow.finance_officer.as_ref(),
                        &directory,
                    ));
                    checks.push(check_identity(
                        "fallback_grader",
                        config.workflow.fallback_grader.as_ref(),
                        &directory,
                    ));
                }
                Err(error) => {
                    checks.push(DoctorCheck::fail("finance_officer", error.to_string()));
                    checks.push(DoctorCheck::skipped("fallback_grader", "the directory failed"));
                }
            }
        } else {
            checks.push(DoctorCheck::skipped("finance_officer", "the schema is not current"));
            checks.push(DoctorCheck::skipped("fallback_grader", "the schema is not current"));
        }

        pool.close().await;
        checks
    })
}

fn check_identity(
    name: &'static str,
    configured: Option<&IdentityKey>,
    directory: &dyn Directory,
) -> DoctorCheck {
    let Some(key) = configured else {
        return DoctorCheck::skipped(name, "it is not configured");
    };
    match directory.resolve(key) {
        Some(identity) if identity.active => {
            DoctorCheck::pass(name, format!("`{key}` resolves to {}", identity.display_name))
        }
        Some(_) => DoctorCheck::fail(name, format!("`{key}` is inactive in the directory")),
        None => DoctorCheck::fail(name, format!("`{key}` is not in the directory")),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
