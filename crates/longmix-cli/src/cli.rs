//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colorchoice_clap::Color;

#[derive(Parser)]
#[command(
    name = "longmix",
    version,
    about = "Fit longitudinal mixed models across imputed datasets and pool them",
    long_about = "Fit one mixed model per outcome on each of M imputed datasets through R,\n\
                  fall back to simpler random-effects structures when fits fail,\n\
                  and pool the results with Rubin's rules (Barnard-Rubin df).\n\n\
                  Runs are resumable: completed cells in the result store are skipped."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Analysis configuration file.
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        default_value = "longmix.toml",
        global = true
    )]
    pub config: PathBuf,

    /// Adjust log verbosity (-v for info, -vv for debug, -q for errors only).
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// Control ANSI color output (auto, always, never).
    #[command(flatten)]
    pub color: Color,

    /// Explicit log level (overrides -v/-q flags).
    #[arg(long = "log-level", value_enum, global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Log output format (pretty for human, json for machine parsing).
    #[arg(
        long = "log-format",
        value_enum,
        default_value = "pretty",
        global = true
    )]
    pub log_format: LogFormatArg,

    /// Write logs to a file instead of stderr.
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fit every outcome on every imputation, then pool.
    Run(RunArgs),

    /// Pool the cells already in the result store.
    Pool(PoolArgs),

    /// Re-run the analysis under each configured alternate and compare.
    Sensitivity(SensitivityArgs),

    /// Summarize the cells and pooled results in the result store.
    Status(StoreArgs),

    /// Check that R and the required packages are installed.
    Doctor(DoctorArgs),
}

#[derive(Args, Clone, Default)]
pub struct StoreArgs {
    /// Result store directory (overrides [store].root).
    #[arg(long = "store", value_name = "DIR")]
    pub store: Option<PathBuf>,
}

#[derive(Args, Clone, Default)]
pub struct InputArgs {
    /// Directory with the imputed CSV files (overrides [data].directory).
    #[arg(long = "data", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Worker threads (overrides [engine].workers; 0 = all cores).
    #[arg(short = 'j', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Restrict the run to these outcomes (repeatable).
    #[arg(long = "outcome", value_name = "NAME")]
    pub outcomes: Vec<String>,

    /// Keep each cell at the ladder state it reached on its own.
    #[arg(long = "no-harmonize")]
    pub no_harmonize: bool,

    /// Hide the progress bar.
    #[arg(long = "no-progress")]
    pub no_progress: bool,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub input: InputArgs,

    /// Fit cells only; do not pool.
    #[arg(long = "no-pool")]
    pub no_pool: bool,
}

#[derive(Args)]
pub struct PoolArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Pool only these outcomes (repeatable).
    #[arg(long = "outcome", value_name = "NAME")]
    pub outcomes: Vec<String>,

    /// Complete-data degrees of freedom (overrides [pooling].complete_df).
    #[arg(long = "complete-df", value_name = "DF")]
    pub complete_df: Option<f64>,
}

#[derive(Args)]
pub struct SensitivityArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub input: InputArgs,

    /// Run only these alternates (repeatable).
    #[arg(long = "label", value_name = "LABEL")]
    pub labels: Vec<String>,
}

#[derive(Args)]
pub struct DoctorArgs {
    /// Rscript executable to probe (overrides [engine].rscript).
    #[arg(long = "rscript", value_name = "PATH")]
    pub rscript: Option<PathBuf>,
}

/// CLI log level choices.
#[derive(Clone, Copy, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// CLI log format choices.
#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}
