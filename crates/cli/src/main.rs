mod cmd;
mod output;
mod prompts;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{RunArgs, cmd_graph, cmd_info, cmd_list, cmd_run};
use output::{OutputFormat, print_error};

/// stackrun - run IaC actions across a tree of units in dependency order
#[derive(Parser)]
#[command(name = "stackrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging (RUST_LOG takes precedence)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run an action (plan, apply, destroy, ...) on a unit, or on every unit below it with --all
  Run(RunArgs),

  /// List discovered units and stacks
  List {
    /// Root directory to discover from (default: current directory)
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Print the unit dependency graph in Graphviz DOT format
  Graph {
    /// Root directory to discover from (default: current directory)
    #[arg(long)]
    working_dir: Option<PathBuf>,
  },

  /// Show version and configuration resolved from the environment
  Info,
}

fn init_tracing(verbose: bool) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let result = match cli.command {
    Commands::Run(args) => cmd_run(args),
    Commands::List { working_dir, format } => cmd_list(working_dir, format).map(|()| ExitCode::SUCCESS),
    Commands::Graph { working_dir } => cmd_graph(working_dir).map(|()| ExitCode::SUCCESS),
    Commands::Info => cmd_info().map(|()| ExitCode::SUCCESS),
  };

  match result {
    Ok(code) => code,
    Err(e) => {
      print_error(&format!("{:#}", e));
      ExitCode::FAILURE
    }
  }
}
