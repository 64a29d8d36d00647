pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use signoff_core::config::{AppConfig, ConfigOverrides, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

use commands::chain::{BuildArgs, DecideArgs, ResetArgs, ShowArgs};
use commands::grading::{GradeArgs, GradeOpenArgs, KpiCommand};

#[derive(Debug, Parser)]
#[command(
    name = "signoff",
    about = "Signoff approval workflow operator CLI",
    long_about = "Build hierarchical approval chains, record decisions and grades, and inspect \
                  the organisation directory, migrations and configuration.",
    after_help = "Examples:\n  signoff seed\n  signoff build --ref PO-7 --title Laptops \
                  --kind purchase --requester rae@corp.test\n  signoff doctor --json"
)]
pub struct Cli {
    /// Config file to load instead of `signoff.toml` / `config/signoff.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `database.url` from every other source.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, DB connectivity, schema and configured approvers")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Load an organisation (members, department heads, KPIs) into the database")]
    Seed {
        /// TOML organisation file; the built-in demo organisation when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    #[command(about = "Build an approval chain for a request and notify level 1")]
    Build(BuildArgs),
    #[command(about = "Approve or reject the active level of an approval chain")]
    Decide(DecideArgs),
    #[command(about = "Reopen a rejected approval chain at level 1")]
    Reset(ResetArgs),
    #[command(about = "Print an approval or graded chain")]
    Show(ShowArgs),
    #[command(name = "grade-open", about = "Open a graded completion chain for a task")]
    GradeOpen(GradeOpenArgs),
    #[command(about = "Grade or reject the active level of a graded completion chain")]
    Grade(GradeArgs),
    #[command(about = "List or register KPI achievements")]
    Kpi {
        #[command(subcommand)]
        command: KpiCommand,
    },
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                database_url: self.database_url.clone(),
                ..ConfigOverrides::default()
            },
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();
    init_logging(&options);

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(&options, json) }
        }
        Command::Seed { file } => commands::seed::run(&options, file.as_deref()),
        Command::Build(args) => commands::chain::build(&options, args),
        Command::Decide(args) => commands::chain::decide(&options, args),
        Command::Reset(args) => commands::chain::reset(&options, args),
        Command::Show(args) => commands::chain::show(&options, args),
        Command::GradeOpen(args) => commands::grading::open(&options, args),
        Command::Grade(args) => commands::grading::grade(&options, args),
        Command::Kpi { command } => commands::grading::kpi(&options, command),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout carries only the command payload. A config that
/// fails to load falls back to defaults here; the command reports the failure.
fn init_logging(options: &LoadOptions) {
    let logging = AppConfig::load(options.clone()).unwrap_or_default().logging;
    let filter = EnvFilter::try_from_env("SIGNOFF_LOG")
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(error) = installed {
        eprintln!("signoff: logging disabled: {error}");
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_become_load_options() {
        let cli = Cli::parse_from([
            "signoff",
            "--database-url",
            "sqlite::memory:",
            "grade",
            "chain-1",
            "--level",
            "2",
            "--actor",
            "bob@corp.test",
            "--reject",
        ]);

        let options = cli.load_options();
        assert_eq!(options.overrides.database_url.as_deref(), Some("sqlite::memory:"));
        assert!(!options.require_file);
        assert!(matches!(cli.command, Command::Grade(ref args) if args.reject && args.level == 2));
    }
}
