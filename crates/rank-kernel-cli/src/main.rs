use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rank_kernel_core::{
    analyze, compute_repair_plan, position_at_edge, Edge, GroupKey, RankKey, RecordId, RepairPlan,
    RepairStrategy,
};
use rank_kernel_store_sqlite::{RankStore, RecordFilter, TableBinding};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "rk.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Rank Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./rank_kernel.sqlite3")]
    db: PathBuf,

    /// Tracing filter directive, e.g. `info` or `rank_kernel_core=debug`.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Rank {
        #[command(subcommand)]
        command: RankCommand,
    },
    Repair {
        #[command(subcommand)]
        command: Box<RepairCommand>,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum RankCommand {
    First,
    After(SingleRankArgs),
    Before(SingleRankArgs),
    Between(BetweenArgs),
    Edge(EdgeArgs),
    Validate(SingleRankArgs),
}

#[derive(Debug, Args)]
struct SingleRankArgs {
    #[arg(long)]
    rank: String,
}

#[derive(Debug, Args)]
struct BetweenArgs {
    #[arg(long)]
    prev: String,
    #[arg(long)]
    next: String,
}

#[derive(Debug, Args)]
struct EdgeArgs {
    #[arg(long, value_enum)]
    edge: EdgeArg,
    /// Ranks already stored in the group; malformed entries are skipped.
    #[arg(long, value_delimiter = ',')]
    existing: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum RepairCommand {
    Analyze(SelectionArgs),
    Plan(PlanArgs),
    Apply(ApplyArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    CheckOrder(BindingArgs),
}

#[derive(Debug, Args)]
struct BindingArgs {
    /// YAML file with `table`, `group_column`, and optional `id_column`/`rank_column`.
    #[arg(long, conflicts_with_all = ["table", "group_column"])]
    config: Option<PathBuf>,
    #[arg(long)]
    table: Option<String>,
    #[arg(long, default_value = "id")]
    id_column: String,
    #[arg(long)]
    group_column: Option<String>,
    #[arg(long, default_value = "position")]
    rank_column: String,
}

#[derive(Debug, Args)]
struct SelectionArgs {
    #[command(flatten)]
    binding: BindingArgs,
    /// Restrict the run to these record ids.
    #[arg(long, value_delimiter = ',')]
    ids: Vec<i64>,
    /// Restrict the run to these groups; repeatable.
    #[arg(long = "group")]
    groups: Vec<String>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long, value_enum, default_value_t = StrategyArg::FixAll)]
    strategy: StrategyArg,
    /// Save the plan as JSON for a later `repair apply --plan`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long, value_enum, default_value_t = StrategyArg::FixAll, conflicts_with = "plan")]
    strategy: StrategyArg,
    /// Apply a saved plan instead of computing a fresh one.
    #[arg(long)]
    plan: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Regenerate,
    FixMissing,
    FixDuplicates,
    FixAll,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EdgeArg {
    Top,
    Bottom,
}

impl From<EdgeArg> for Edge {
    fn from(value: EdgeArg) -> Self {
        match value {
            EdgeArg::Top => Self::Top,
            EdgeArg::Bottom => Self::Bottom,
        }
    }
}

impl From<StrategyArg> for RepairStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Regenerate => Self::Regenerate,
            StrategyArg::FixMissing => Self::FixMissing,
            StrategyArg::FixDuplicates => Self::FixDuplicates,
            StrategyArg::FixAll => Self::FixAll,
        }
    }
}

impl BindingArgs {
    fn resolve(&self) -> Result<TableBinding> {
        if let Some(config) = &self.config {
            return TableBinding::load(config);
        }

        let table =
            self.table.as_deref().ok_or_else(|| anyhow!("--table or --config is required"))?;
        let group_column = self
            .group_column
            .as_deref()
            .ok_or_else(|| anyhow!("--group-column or --config is required"))?;
        Ok(TableBinding::new(table, &self.id_column, group_column, &self.rank_column)?)
    }
}

impl SelectionArgs {
    fn filter(&self) -> RecordFilter {
        RecordFilter {
            ids: self.ids.iter().copied().map(RecordId).collect(),
            groups: self.groups.iter().map(|group| GroupKey::new(group.as_str())).collect(),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn generated_at() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Rank { command } => run_rank(command),
        Command::Repair { command } => {
            let mut store = RankStore::open(&cli.db)?;
            run_repair(*command, &mut store)
        }
        Command::Db { command } => {
            let store = RankStore::open(&cli.db)?;
            run_db(&command, &store)
        }
    }
}

fn parse_rank(raw: &str) -> Result<RankKey> {
    RankKey::validate(raw).with_context(|| format!("invalid rank {raw:?}"))
}

fn run_rank(command: RankCommand) -> Result<()> {
    let rank = match command {
        RankCommand::First => RankKey::for_empty_sequence(),
        RankCommand::After(args) => RankKey::after(&parse_rank(&args.rank)?)?,
        RankCommand::Before(args) => RankKey::before(&parse_rank(&args.rank)?)?,
        RankCommand::Between(args) => {
            RankKey::between(&parse_rank(&args.prev)?, &parse_rank(&args.next)?)?
        }
        RankCommand::Edge(args) => return run_rank_edge(&args),
        RankCommand::Validate(args) => return run_rank_validate(&args.rank),
    };

    emit_json(serde_json::json!({ "rank": rank }))
}

fn run_rank_edge(args: &EdgeArgs) -> Result<()> {
    let edge = Edge::from(args.edge);
    let rank = position_at_edge(edge, args.existing.iter().map(|raw| Some(raw.as_str())))?;
    emit_json(serde_json::json!({
        "edge": edge.as_str(),
        "rank": rank
    }))
}

fn run_rank_validate(raw: &str) -> Result<()> {
    match RankKey::validate(raw) {
        Ok(rank) => emit_json(serde_json::json!({
            "rank": rank,
            "valid": true
        })),
        Err(err) => emit_json(serde_json::json!({
            "rank": raw,
            "valid": false,
            "error": err.to_string()
        })),
    }
}

fn run_repair(command: RepairCommand, store: &mut RankStore) -> Result<()> {
    match command {
        RepairCommand::Analyze(args) => run_repair_analyze(&args, store),
        RepairCommand::Plan(args) => run_repair_plan(&args, store),
        RepairCommand::Apply(args) => run_repair_apply(&args, store),
    }
}

fn run_repair_analyze(args: &SelectionArgs, store: &mut RankStore) -> Result<()> {
    let binding = args.binding.resolve()?;
    let snapshot = store.load_positions(&binding, &args.filter())?;
    let analysis = analyze(&snapshot);

    emit_json(serde_json::json!({
        "generated_at": generated_at()?,
        "table": binding.table,
        "needs_repair": analysis.needs_repair(),
        "analysis": analysis
    }))
}

fn compute_plan(
    selection: &SelectionArgs,
    strategy: StrategyArg,
    store: &mut RankStore,
) -> Result<(TableBinding, usize, RepairPlan)> {
    let binding = selection.binding.resolve()?;
    let snapshot = store.load_positions(&binding, &selection.filter())?;
    let plan = compute_repair_plan(&snapshot, strategy.into())
        .with_context(|| format!("failed to compute repair plan for {}", binding.table))?;
    Ok((binding, snapshot.len(), plan))
}

fn plan_summary(plan: &RepairPlan) -> Value {
    serde_json::json!({
        "strategy": plan.strategy(),
        "assignments": plan.len(),
        "changes": plan.change_count(),
        "groups": plan.group_counts()
    })
}

fn run_repair_plan(args: &PlanArgs, store: &mut RankStore) -> Result<()> {
    let (binding, records, plan) = compute_plan(&args.selection, args.strategy, store)?;

    if let Some(out) = &args.out {
        write_plan(out, &plan)?;
    }

    emit_json(serde_json::json!({
        "generated_at": generated_at()?,
        "table": binding.table,
        "records": records,
        "summary": plan_summary(&plan),
        "out": args.out.as_ref().map(|path| path.display().to_string()),
        "plan": plan
    }))
}

fn run_repair_apply(args: &ApplyArgs, store: &mut RankStore) -> Result<()> {
    let (binding, plan) = match &args.plan {
        Some(path) => (args.selection.binding.resolve()?, read_plan(path)?),
        None => {
            let (binding, _, plan) = compute_plan(&args.selection, args.strategy, store)?;
            (binding, plan)
        }
    };

    let updated = store.apply_plan(&binding, &plan)?;
    emit_json(serde_json::json!({
        "generated_at": generated_at()?,
        "table": binding.table,
        "summary": plan_summary(&plan),
        "updated": updated
    }))
}

fn write_plan(path: &Path, plan: &RepairPlan) -> Result<()> {
    let body = serde_json::to_string_pretty(plan).context("failed to serialize repair plan")?;
    fs::write(path, body)
        .with_context(|| format!("failed to write repair plan {}", path.display()))
}

fn read_plan(path: &Path) -> Result<RepairPlan> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read repair plan {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse repair plan {}", path.display()))
}

fn run_db(command: &DbCommand, store: &RankStore) -> Result<()> {
    match command {
        DbCommand::CheckOrder(args) => {
            let binding = args.resolve()?;
            let report = store.verify_byte_order(&binding)?;
            emit_json(serde_json::json!({
                "table": binding.table,
                "column": binding.rank_column,
                "report": report
            }))
        }
    }
}
