use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use signoff_core::config::{AppConfig, LoadOptions};
use toml::Value;

use crate::commands::CommandResult;

struct Field {
    key_path: &'static str,
    env_key: &'static str,
    value: String,
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let overridden_url = options.overrides.database_url.is_some();

    let mut lines = vec![
        "effective config (source precedence: flag > env > file > default):".to_string()
    ];
    for field in fields(&config) {
        let source = if overridden_url && field.key_path == "database.url" {
            "flag (--database-url)".to_string()
        } else {
            field_source(
                field.key_path,
                field.env_key,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            )
        };
        lines.push(render_line(field.key_path, &field.value, source));
    }

    CommandResult::success("config", lines.join("\n"))
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let identity = |key: &Option<signoff_core::IdentityKey>| {
        key.as_ref().map(|key| key.to_string()).unwrap_or_else(|| "<unset>".to_string())
    };

    vec![
        Field {
            key_path: "database.url",
            env_key: "SIGNOFF_DATABASE_URL",
            value: config.database.url.clone(),
        },
        Field {
            key_path: "database.max_connections",
            env_key: "SIGNOFF_DATABASE_MAX_CONNECTIONS",
            value: config.database.max_connections.to_string(),
        },
        Field {
            key_path: "database.timeout_secs",
            env_key: "SIGNOFF_DATABASE_TIMEOUT_SECS",
            value: config.database.timeout_secs.to_string(),
        },
        Field {
            key_path: "workflow.max_levels",
            env_key: "SIGNOFF_WORKFLOW_MAX_LEVELS",
            value: config.workflow.max_levels.to_string(),
        },
        Field {
            key_path: "workflow.finance_officer",
            env_key: "SIGNOFF_WORKFLOW_FINANCE_OFFICER",
            value: identity(&config.workflow.finance_officer),
        },
        Field {
            key_path: "workflow.fallback_grader",
            env_key: "SIGNOFF_WORKFLOW_FALLBACK_GRADER",
            value: identity(&config.workflow.fallback_grader),
        },
        Field {
            key_path: "workflow.require_business_head",
            env_key: "SIGNOFF_WORKFLOW_REQUIRE_BUSINESS_HEAD",
            value: config.workflow.require_business_head.to_string(),
        },
        Field {
            key_path: "notifications.enabled",
            env_key: "SIGNOFF_NOTIFICATIONS_ENABLED",
            value: config.notifications.enabled.to_string(),
        },
        Field {
            key_path: "logging.level",
            env_key: "SIGNOFF_LOGGING_LEVEL",
            value: config.logging.level.clone(),
        },
        Field {
            key_path: "logging.format",
            env_key: "SIGNOFF_LOGGING_FORMAT",
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
        },
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("signoff.toml"), PathBuf::from("config/signoff.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, field_source};

    #[test]
    fn file_source_is_reported_only_for_present_keys() {
        let doc: Value = "[workflow]\nmax_levels = 4\n".parse().expect("toml");

        assert!(contains_path(&doc, "workflow.max_levels"));
        assert!(!contains_path(&doc, "workflow.fallback_grader"));
        assert_eq!(
            field_source("logging.format", "SIGNOFF_TEST_UNSET_VAR", Some(&doc), None),
            "default"
        );
        assert_eq!(
            field_source("workflow.max_levels", "SIGNOFF_TEST_UNSET_VAR", Some(&doc), None),
            "file (config file)"
        );
    }
}
