use clap::{Args, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use signoff_core::approvals::GradeVerdict;
use signoff_core::config::LoadOptions;
use signoff_core::domain::graded::{
    GradedChainSnapshot, GradedCompletionChain, GradedTask, GradingOutcome,
};
use signoff_core::domain::identity::IdentityKey;
use signoff_core::domain::kpi::{KpiId, KpiLink};
use signoff_core::domain::workflow::ChainId;

use crate::commands::{correlation_id, load_config, open_pool, runtime, service};
use crate::commands::{CommandResult, Failure};

#[derive(Debug, Args)]
pub struct GradeOpenArgs {
    #[arg(long = "task-ref")]
    pub task_ref: String,
    #[arg(long)]
    pub title: String,
    /// Percentage weight of the task within the assignee's objectives.
    #[arg(long)]
    pub weight: Decimal,
    #[arg(long)]
    pub assignee: String,
    /// Creator of the parent project; omit for stand-alone tasks.
    #[arg(long)]
    pub creator: Option<String>,
    /// Linked KPI as `<kpi-id>=<weight>`; repeatable.
    #[arg(long = "kpi", value_parser = parse_kpi_link)]
    pub kpis: Vec<KpiLink>,
}

#[derive(Debug, Args)]
pub struct GradeArgs {
    pub chain_id: String,
    #[arg(long)]
    pub level: u32,
    #[arg(long)]
    pub actor: String,
    /// Grade between 1.0 and 5.0.
    #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
    pub grade: Option<Decimal>,
    /// Send the task back to the assignee; grading restarts at level 1.
    #[arg(long)]
    pub reject: bool,
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum KpiCommand {
    /// List KPI achievements.
    List,
    /// Register a KPI (or rename an existing one) so grades can contribute to it.
    Register {
        id: String,
        #[arg(long)]
        name: String,
    },
}

/// Graded chain state as printed by the grading commands.
#[derive(Debug, Serialize)]
pub struct GradedView {
    #[serde(flatten)]
    pub snapshot: GradedChainSnapshot,
    pub progress_percent: u8,
}

impl From<&GradedCompletionChain> for GradedView {
    fn from(chain: &GradedCompletionChain) -> Self {
        Self { snapshot: chain.snapshot(), progress_percent: chain.progress_percent() }
    }
}

#[derive(Debug, Serialize)]
struct GradeView {
    outcome: GradingOutcome,
    unknown_kpis: Vec<KpiId>,
    chain: GradedView,
}

pub fn parse_kpi_link(raw: &str) -> Result<KpiLink, String> {
    let (id, weight) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected `<kpi-id>=<weight>`, got `{raw}`"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("missing KPI id in `{raw}`"));
    }
    let weight: Decimal =
        weight.trim().parse().map_err(|error| format!("invalid KPI weight in `{raw}`: {error}"))?;
    if weight < Decimal::ZERO || weight > Decimal::ONE_HUNDRED {
        return Err(format!("KPI weight must be within 0..=100, got {weight}"));
    }
    Ok(KpiLink { kpi_id: KpiId(id.to_string()), weight })
}

pub fn open(options: &LoadOptions, args: GradeOpenArgs) -> CommandResult {
    let config = match load_config("grade-open", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("grade-open") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let assignee = IdentityKey::new(&args.assignee);
    let task = GradedTask {
        task_ref: args.task_ref,
        title: args.title,
        weight: args.weight,
        kpi_links: args.kpis,
        originating_creator: args.creator.as_deref().map(IdentityKey::new),
    };
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let opened = service(&config, pool.clone()).open_graded(task, &assignee, &cid).await;
        pool.close().await;
        opened.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok(chain) => CommandResult::with_data(
            "grade-open",
            format!("graded chain {} opened for {}", chain.id(), chain.assignee()),
            GradedView::from(&chain),
        ),
        Err(failure) => failure.into_result("grade-open"),
    }
}

pub fn grade(options: &LoadOptions, args: GradeArgs) -> CommandResult {
    let verdict = match (args.reject, args.grade) {
        (true, _) => GradeVerdict::Reject,
        (false, Some(grade)) => GradeVerdict::Grade(grade),
        (false, None) => {
            return CommandResult::failure("grade", "bad_request", "pass --grade or --reject", 6);
        }
    };

    let config = match load_config("grade", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("grade") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let chain_id = ChainId(args.chain_id);
    let level = args.level;
    let actor = IdentityKey::new(&args.actor);
    let comment = args.comment;
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let graded = service(&config, pool.clone())
            .grade(&chain_id, level, &actor, verdict, comment, &cid)
            .await;
        pool.close().await;
        graded.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok(receipt) => {
            let message = format!("level {level} graded on chain {}", receipt.chain.id());
            let view = GradeView {
                outcome: receipt.outcome,
                unknown_kpis: receipt.unknown_kpis,
                chain: GradedView::from(&receipt.chain),
            };
            CommandResult::with_data("grade", message, view)
        }
        Err(failure) => failure.into_result("grade"),
    }
}

pub fn kpi(options: &LoadOptions, command: KpiCommand) -> CommandResult {
    let config = match load_config("kpi", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("kpi") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let workflow = service(&config, pool.clone());
        let outcome = match command {
            KpiCommand::List => workflow.kpi_achievements().await,
            KpiCommand::Register { id, name } => {
                workflow.register_kpi(KpiId(id), &name).await.map(|achievement| vec![achievement])
            }
        };
        pool.close().await;
        outcome.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok(achievements) => {
            let message = format!("{} kpi(s)", achievements.len());
            CommandResult::with_data("kpi", message, achievements)
        }
        Err(failure) => failure.into_result("kpi"),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::parse_kpi_link;

    #[test]
    fn kpi_links_parse_as_id_and_percentage() {
        let link = parse_kpi_link("kpi-delivery=40").expect("link");

        assert_eq!(link.kpi_id.0, "kpi-delivery");
        assert_eq!(link.weight, Decimal::new(40, 0));
    }

    #[test]
    fn malformed_kpi_links_are_refused() {
        assert!(parse_kpi_link("kpi-delivery").is_err());
        assert!(parse_kpi_link("=40").is_err());
        assert!(parse_kpi_link("kpi-x=abc").is_err());
        assert!(parse_kpi_link("kpi-x=140").is_err());
    }
}
