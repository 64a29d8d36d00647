pub mod chain;
pub mod config;
pub mod doctor;
pub mod grading;
pub mod migrate;
pub mod seed;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use signoff_core::approvals::ChainPolicy;
use signoff_core::audit::LogAuditSink;
use signoff_core::config::{AppConfig, LoadOptions};
use signoff_core::errors::{ApplicationError, InterfaceError};
use signoff_core::notify::LogNotifier;
use signoff_db::{connect_from_config, migrations, DbPool, WorkflowService, WorkflowStores};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            correlation_id: None,
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn with_data(command: &str, message: impl Into<String>, data: impl Serialize) -> Self {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(error) => {
                return Self::failure(command, "serialization", error.to_string(), 9);
            }
        };
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            correlation_id: None,
            data: Some(data),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            correlation_id: None,
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    fn refused(command: &str, error: &InterfaceError) -> Self {
        let (error_class, exit_code, correlation_id) = match error {
            InterfaceError::BadRequest { correlation_id, .. } => ("bad_request", 6, correlation_id),
            InterfaceError::Forbidden { correlation_id, .. } => ("forbidden", 6, correlation_id),
            InterfaceError::NotFound { correlation_id, .. } => ("not_found", 7, correlation_id),
            InterfaceError::Conflict { correlation_id, .. } => ("conflict", 8, correlation_id),
            InterfaceError::ServiceUnavailable { correlation_id, .. } => {
                ("service_unavailable", 9, correlation_id)
            }
            InterfaceError::Internal { correlation_id, .. } => ("internal", 9, correlation_id),
        };
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: format!("{} ({})", error.user_message(), error.message()),
            correlation_id: Some(correlation_id.clone()),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Why a command stopped before producing its payload.
#[derive(Debug)]
pub(crate) enum Failure {
    Setup { error_class: &'static str, message: String, exit_code: u8 },
    Workflow(InterfaceError),
}

impl Failure {
    pub(crate) fn setup(error_class: &'static str, message: impl Into<String>, code: u8) -> Self {
        Self::Setup { error_class, message: message.into(), exit_code: code }
    }

    pub(crate) fn workflow(error: ApplicationError, correlation_id: &str) -> Self {
        Self::Workflow(error.into_interface(correlation_id))
    }

    pub(crate) fn into_result(self, command: &str) -> CommandResult {
        match self {
            Self::Setup { error_class, message, exit_code } => {
                CommandResult::failure(command, error_class, message, exit_code)
            }
            Self::Workflow(error) => CommandResult::refused(command, &error),
        }
    }
}

pub(crate) fn load_config(
    command: &str,
    options: &LoadOptions,
) -> Result<AppConfig, CommandResult> {
    AppConfig::load(options.clone()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub(crate) fn runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect_from_config(&config.database)
        .await
        .map_err(|error| Failure::setup("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| Failure::setup("migration", error.to_string(), 5))?;
    Ok(pool)
}

pub(crate) fn service(config: &AppConfig, pool: DbPool) -> WorkflowService {
    WorkflowService::new(
        WorkflowStores::sqlite(pool),
        Arc::new(LogNotifier),
        Arc::new(LogAuditSink),
        ChainPolicy::from(&config.workflow),
    )
    .with_notifications(config.notifications.enabled)
}

pub(crate) fn correlation_id() -> String {
    format!("cli-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use signoff_core::errors::InterfaceError;

    use super::CommandResult;

    #[test]
    fn refused_payload_carries_class_exit_code_and_correlation() {
        let error = InterfaceError::Conflict {
            message: "chain c-1 moved past version 3".into(),
            correlation_id: "cli-7".into(),
        };
        let result = CommandResult::refused("decide", &error);
        let payload: Value = serde_json::from_str(&result.output).expect("json");

        assert_eq!(result.exit_code, 8);
        assert_eq!(payload["error_class"], "conflict");
        assert_eq!(payload["correlation_id"], "cli-7");
        assert!(payload["message"].as_str().is_some_and(|message| message.contains("c-1")));
    }

    #[test]
    fn data_payload_is_embedded_verbatim() {
        let result = CommandResult::with_data("kpi", "1 kpi", vec!["kpi-a"]);
        let payload: Value = serde_json::from_str(&result.output).expect("json");

        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["data"][0], "kpi-a");
        assert!(payload.get("correlation_id").is_none());
    }
}
