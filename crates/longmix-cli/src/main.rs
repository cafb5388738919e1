//! longmix command-line tool.

use std::io::{self, IsTerminal};

use clap::{ColorChoice, Parser};
use longmix_cli::logging::{LogConfig, LogFormat, init_logging};
use tracing::level_filters::LevelFilter;

mod cli;
mod commands;
mod summary;

use crate::cli::{Cli, Command, LogFormatArg, LogLevelArg};
use crate::commands::{run_analysis, run_doctor, run_pool, run_sensitivity, run_status};
use crate::summary::{
    print_doctor, print_pooled, print_run_summary, print_sensitivity, print_status,
};

fn main() {
    let cli = Cli::parse();
    cli.color.write_global();
    let log_config = log_config_from_cli(&cli);
    if let Err(error) = init_logging(&log_config) {
        eprintln!("error: failed to initialize logging: {error}");
        std::process::exit(1);
    }
    let config = &cli.config;
    let result = match &cli.command {
        Command::Run(args) => run_analysis(config, args).map(|summary| {
            print_run_summary(&summary);
            i32::from(summary.has_pooling_failures())
        }),
        Command::Pool(args) => run_pool(config, args).map(|pooled| {
            print_pooled(&pooled);
            i32::from(pooled.iter().any(|p| p.result.is_err()))
        }),
        Command::Sensitivity(args) => run_sensitivity(config, args).map(|runs| {
            print_sensitivity(&runs);
            0
        }),
        Command::Status(args) => run_status(config, args).map(|summary| {
            print_status(&summary);
            0
        }),
        Command::Doctor(args) => run_doctor(config, args).map(|report| {
            print_doctor(&report);
            i32::from(!report.is_ready())
        }),
    };
    let exit_code = match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

/// Build logging configuration from CLI flags with consistent precedence.
fn log_config_from_cli(cli: &Cli) -> LogConfig {
    let mut config = LogConfig {
        level_filter: cli.verbosity.tracing_level_filter(),
        ..LogConfig::default()
    };
    config.use_env_filter = !(cli.verbosity.is_present() || cli.log_level.is_some());
    if let Some(level) = cli.log_level {
        config.level_filter = match level {
            LogLevelArg::Error => LevelFilter::ERROR,
            LogLevelArg::Warn => LevelFilter::WARN,
            LogLevelArg::Info => LevelFilter::INFO,
            LogLevelArg::Debug => LevelFilter::DEBUG,
            LogLevelArg::Trace => LevelFilter::TRACE,
        };
    }
    config.format = match cli.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    config.log_file = cli.log_file.clone();
    config.with_ansi = match cli.color.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => cli.log_file.is_none() && io::stderr().is_terminal(),
    };
    config
}
