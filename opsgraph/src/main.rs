mod declaration;
mod differ;
mod executor;
mod interrupt;
mod logging;
mod retry;
mod state;

use std::collections::BTreeMap;
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{ColorChoice, CommandFactory as _, Parser, Subcommand};

use opsgraph_core::{
    Action, ChangeSet, EntryStatus, LogicalName, Report, ResourceGraph, StateRecord,
};
use opsgraph_provider::ProviderRegistry;
use opsgraph_providers_local::LocalProvider;

use crate::declaration::Declaration;
use crate::executor::{Executor, ExecutorOptions};
use crate::interrupt::set_up_process_interrupt_handler;
use crate::retry::RetryPolicy;
use crate::state::{FileStateStore, StateStore};

/// Reconcile declared resources against recorded state.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(clap::Args)]
struct Options {
    /// The declaration file.
    #[arg(short = 'f', long, global = true, default_value = "opsgraph.json")]
    file: PathBuf,

    /// The state file.
    #[arg(long, global = true, default_value = "opsgraph.state.json")]
    state: PathBuf,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,
}

#[derive(clap::Args)]
struct ApplyOptions {
    /// Maximum number of provider operations in flight at once.
    #[arg(long, default_value_t = 4)]
    parallelism: usize,

    /// Attempts per provider operation before a transient failure becomes
    /// permanent.
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Print the report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the change set without applying it
    Plan,
    /// Apply the declared resources
    Apply {
        #[command(flatten)]
        options: ApplyOptions,

        /// Compute and print the change set, but do not touch any resource.
        #[arg(long)]
        dry_run: bool,
    },
    /// Tear down every recorded resource
    Destroy {
        #[command(flatten)]
        options: ApplyOptions,
    },
    /// Inspect the state file
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Generate a shell completion script
    #[command(hide = true)]
    GenerateCompletion {
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List the recorded resources
    List,
}

fn builtin_registry() -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    let local: Arc<LocalProvider> = Arc::new(LocalProvider::new());
    registry.register("file", local.clone());
    registry.register("memo", local);
    Arc::new(registry)
}

fn load_graph(options: &Options) -> Result<ResourceGraph> {
    let declaration = Declaration::from_path(&options.file)?;
    let graph = declaration.to_graph()?;
    graph
        .validate()
        .with_context(|| format!("invalid declaration in {}", options.file.display()))?;
    Ok(graph)
}

fn print_plan(change_set: &ChangeSet) {
    if change_set.is_settled() {
        eprintln!("Nothing to change; state matches the declaration.");
        return;
    }
    for entry in change_set.iter() {
        match entry.action {
            Action::NoOp => {}
            action => eprintln!("{}: {}", action, entry.name),
        }
    }
}

fn print_report(report: &Report) {
    for entry in &report.entries {
        if entry.status == EntryStatus::NoOp {
            continue;
        }
        match (&entry.error, &entry.blocked_on) {
            (Some(error), _) => {
                eprintln!("{} {}: {}: {}", entry.action, entry.name, entry.status, error)
            }
            (None, Some(blocked_on)) => eprintln!(
                "{} {}: {} (blocked on {})",
                entry.action, entry.name, entry.status, blocked_on
            ),
            (None, None) => eprintln!("{} {}: {}", entry.action, entry.name, entry.status),
        }
    }
    eprintln!(
        "Done: {} applied, {} unchanged, {} failed, {} skipped, {} cancelled.",
        report.count(EntryStatus::Succeeded),
        report.count(EntryStatus::NoOp),
        report.count(EntryStatus::Failed),
        report.count(EntryStatus::Skipped),
        report.count(EntryStatus::Cancelled),
    );
}

async fn run_apply(
    options: &Options,
    apply_options: &ApplyOptions,
    graph: ResourceGraph,
    dry_run: bool,
) -> Result<ExitCode> {
    let store = Arc::new(FileStateStore::open(&options.state)?);
    let state = store.load().await?;
    let change_set = differ::diff(&graph, &state)?;
    print_plan(&change_set);

    if dry_run || change_set.is_settled() {
        return Ok(ExitCode::SUCCESS);
    }

    let interrupt = set_up_process_interrupt_handler();
    let executor = Executor::new(
        builtin_registry(),
        store,
        ExecutorOptions {
            parallelism: apply_options.parallelism,
            retry: RetryPolicy::default().with_max_attempts(apply_options.max_attempts),
        },
        interrupt,
    );
    let report = executor.apply(&graph, &change_set, &state).await;

    print_report(&report);
    if apply_options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run_state_list(options: &Options) -> Result<ExitCode> {
    let store = FileStateStore::open(&options.state)?;
    let state: BTreeMap<LogicalName, StateRecord> = store.load().await?;
    for (name, record) in &state {
        println!("{}\t{}\t{}", name, record.type_, record.physical_id);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_command(args: Args) -> Result<ExitCode> {
    match args.command {
        Commands::Plan => {
            let graph = load_graph(&args.options)?;
            let store = FileStateStore::open(&args.options.state)?;
            let state = store.load().await?;
            let change_set = differ::diff(&graph, &state)?;
            print_plan(&change_set);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply { options, dry_run } => {
            let graph = load_graph(&args.options)?;
            run_apply(&args.options, &options, graph, dry_run).await
        }
        Commands::Destroy { options } => {
            // An empty declaration: everything in state becomes a delete.
            run_apply(&args.options, &options, ResourceGraph::new(), false).await
        }
        Commands::State { command } => match command {
            StateCommands::List => run_state_list(&args.options).await,
        },
        Commands::GenerateCompletion { shell } => {
            clap_complete::generate(
                shell,
                &mut Args::command(),
                "opsgraph",
                &mut std::io::stdout(),
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let color = match args.options.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stderr().is_terminal(),
    };
    if let Err(e) = logging::set_up(&logging::Options {
        verbose: args.options.verbose,
        color,
    }) {
        eprintln!("opsgraph error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run_command(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("opsgraph error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
