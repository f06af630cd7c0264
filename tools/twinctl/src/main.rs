//! twinctl - command line front end for the twinrule engine
//!
//! Validates rule files against a twin graph, replays telemetry files in batch
//! and follows live telemetry on stdin.

mod commands;
mod feed;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use common::LogConfig;
use std::path::PathBuf;
use tracing::Level;

const LOG_TO_FILE_ENV: &str = "TWINRULE_LOG_TO_FILE";

#[derive(Parser)]
#[command(name = "twinctl")]
#[command(about = "twinctl - rule evaluation over building telemetry")]
#[command(long_about = "twinctl - rule evaluation over building telemetry

Commands:
  validate    Parse and bind every rule, report disabled parameters
  replay      Batch run over a telemetry CSV, write outputs and insights
  watch       Realtime run over telemetry rows read from stdin
  eval        Evaluate a single formula

Examples:
  twinctl validate -r rules.yaml -t twins.yaml
  twinctl replay -r rules.yaml -t twins.yaml telemetry.csv --out-dir out
  tail -f feed.csv | twinctl watch -r rules.yaml -t twins.yaml
  twinctl eval 'IF(sat > 30, 1, 0)' --var sat=32.5

Use 'twinctl <command> --help' for more information on a specific command.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Also write daily log files (directory: TWINRULE_LOG_DIR or ./logs)
    #[arg(long, global = true)]
    log_file: bool,

    /// Engine configuration file (YAML); TWINRULE_* variables override it
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,
}

/// Rule and twin files shared by the engine commands
#[derive(clap::Args, Debug, Clone)]
pub struct Inputs {
    /// Rules and calculated points (YAML or JSON)
    #[arg(short, long)]
    pub rules: PathBuf,

    /// Twin graph snapshot (YAML or JSON)
    #[arg(short, long)]
    pub twins: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and bind every rule without running it
    Validate {
        #[command(flatten)]
        inputs: Inputs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-run every rule over a telemetry file
    Replay {
        #[command(flatten)]
        inputs: Inputs,

        /// CSV with `timestamp,point_id,value` rows
        telemetry: PathBuf,

        /// Directory for outputs.csv and insights.json (default: TWINRULE_OUT_DIR or ./out)
        #[arg(short, long)]
        out_dir: Option<String>,

        /// Number of reruns; each one writes the next output version
        #[arg(long, default_value_t = 1)]
        reruns: u32,
    },

    /// Follow telemetry rows on stdin until EOF or Ctrl+C
    Watch {
        #[command(flatten)]
        inputs: Inputs,

        /// Directory for outputs.csv and insights.json (default: TWINRULE_OUT_DIR or ./out)
        #[arg(short, long)]
        out_dir: Option<String>,
    },

    /// Evaluate one formula against literal variables
    Eval {
        formula: String,

        /// `name=value` bindings, repeatable
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Evaluation time, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let log_config = LogConfig {
        service_name: "twinctl".to_string(),
        level: if cli.verbose { Level::DEBUG } else { Level::INFO },
        log_to_file: common::get_config_value(cli.log_file.then_some(true), LOG_TO_FILE_ENV, false),
        ..Default::default()
    };
    if let Err(e) = common::logging::init_with_config(log_config) {
        eprintln!("{} Failed to initialize logging: {}", "WARN".yellow(), e);
    }

    match cli.command {
        Commands::Validate { inputs, json } => commands::validate(cli.config.as_deref(), &inputs, json).await,
        Commands::Replay {
            inputs,
            telemetry,
            out_dir,
            reruns,
        } => commands::replay(cli.config.as_deref(), &inputs, &telemetry, out_dir, reruns).await,
        Commands::Watch { inputs, out_dir } => commands::watch(cli.config.as_deref(), &inputs, out_dir).await,
        Commands::Eval { formula, vars, at } => commands::eval(&formula, &vars, at.as_deref()),
    }
}
