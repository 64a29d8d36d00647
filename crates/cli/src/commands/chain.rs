use clap::{Args, ValueEnum};
use serde::Serialize;
use signoff_core::config::LoadOptions;
use signoff_core::domain::chain::{ApprovalChain, ChainSnapshot, Decision, DecisionOutcome};
use signoff_core::domain::identity::IdentityKey;
use signoff_core::domain::workflow::{ChainId, WorkflowKind, WorkflowRequest};
use signoff_core::errors::ApplicationError;

use crate::commands::grading::GradedView;
use crate::commands::{correlation_id, load_config, open_pool, runtime, service};
use crate::commands::{CommandResult, Failure};

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Reference of the request being approved (purchase order, invoice number, ...).
    #[arg(long = "ref")]
    pub request_ref: String,
    #[arg(long)]
    pub title: String,
    #[arg(long, value_parser = parse_kind, default_value = "general")]
    pub kind: WorkflowKind,
    /// Contact address of the requester.
    #[arg(long)]
    pub requester: String,
    /// Route through the finance officer even when the kind does not require it.
    #[arg(long)]
    pub finance: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
}

impl From<DecisionArg> for Decision {
    fn from(value: DecisionArg) -> Self {
        match value {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Reject => Decision::Reject,
        }
    }
}

#[derive(Debug, Args)]
pub struct DecideArgs {
    pub chain_id: String,
    #[arg(long)]
    pub actor: String,
    #[arg(long, value_enum)]
    pub decision: DecisionArg,
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    pub chain_id: String,
    /// Who resubmits the rejected request.
    #[arg(long)]
    pub actor: String,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    pub chain_id: String,
}

/// Chain state as printed by every chain command.
#[derive(Debug, Serialize)]
pub struct ChainView {
    #[serde(flatten)]
    pub snapshot: ChainSnapshot,
    pub progress_percent: u8,
}

impl From<&ApprovalChain> for ChainView {
    fn from(chain: &ApprovalChain) -> Self {
        Self { snapshot: chain.snapshot(), progress_percent: chain.progress_percent() }
    }
}

#[derive(Debug, Serialize)]
struct DecisionView {
    outcome: DecisionOutcome,
    chain: ChainView,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ShownChain {
    Approval(ChainView),
    Graded(GradedView),
}

pub fn parse_kind(raw: &str) -> Result<WorkflowKind, String> {
    WorkflowKind::parse(raw).ok_or_else(|| {
        format!(
            "unknown workflow kind `{raw}` \
             (expected general|purchase|budget|invoice|task_completion|customer_onboarding)"
        )
    })
}

pub fn build(options: &LoadOptions, args: BuildArgs) -> CommandResult {
    let config = match load_config("build", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("build") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let mut request =
        WorkflowRequest::new(args.request_ref, args.title, args.kind, &args.requester);
    if args.finance {
        request = request.with_finance();
    }
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let opened = service(&config, pool.clone()).open_chain(&request, &cid).await;
        pool.close().await;
        opened.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok(chain) => {
            let levels = chain.steps().len();
            let message = format!("chain {} opened with {levels} level(s)", chain.id());
            CommandResult::with_data("build", message, ChainView::from(&chain))
        }
        Err(failure) => failure.into_result("build"),
    }
}

pub fn decide(options: &LoadOptions, args: DecideArgs) -> CommandResult {
    let config = match load_config("decide", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("decide") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let chain_id = ChainId(args.chain_id);
    let actor = IdentityKey::new(&args.actor);
    let decision = Decision::from(args.decision);
    let comment = args.comment;
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let decided = service(&config, pool.clone())
            .decide(&chain_id, &actor, decision, comment, &cid)
            .await;
        pool.close().await;
        decided.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok((chain, outcome)) => {
            let level = outcome.decided_level;
            let message = format!("level {level} decided on chain {}", chain.id());
            CommandResult::with_data(
                "decide",
                message,
                DecisionView { outcome, chain: ChainView::from(&chain) },
            )
        }
        Err(failure) => failure.into_result("decide"),
    }
}

pub fn reset(options: &LoadOptions, args: ResetArgs) -> CommandResult {
    let config = match load_config("reset", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("reset") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let chain_id = ChainId(args.chain_id);
    let actor = IdentityKey::new(&args.actor);
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let reset = service(&config, pool.clone()).reset(&chain_id, &actor, &cid).await;
        pool.close().await;
        reset.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok(chain) => CommandResult::with_data(
            "reset",
            format!("chain {} reopened at level 1", chain.id()),
            ChainView::from(&chain),
        ),
        Err(failure) => failure.into_result("reset"),
    }
}

pub fn show(options: &LoadOptions, args: ShowArgs) -> CommandResult {
    let config = match load_config("show", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("show") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let chain_id = ChainId(args.chain_id);
    let cid = correlation_id();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let workflow = service(&config, pool.clone());
        let shown = match workflow.find_chain(&chain_id).await {
            Ok(chain) => Ok(ShownChain::Approval(ChainView::from(&chain))),
            Err(ApplicationError::NotFound(_)) => workflow
                .find_graded(&chain_id)
                .await
                .map(|chain| ShownChain::Graded(GradedView::from(&chain))),
            Err(error) => Err(error),
        };
        pool.close().await;
        shown.map_err(|error| Failure::workflow(error, &cid))
    });

    match result {
        Ok(shown) => CommandResult::with_data("show", format!("chain {chain_id}"), shown),
        Err(failure) => failure.into_result("show"),
    }
}
