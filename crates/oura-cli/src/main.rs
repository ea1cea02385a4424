use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use oura_core::resolve_categories;
use oura_sync::{
    run_service, ServiceConfig, SyncConfig, SyncPipeline, DEFAULT_LOOKBACK_HOURS,
    DEFAULT_OUTPUT_DIR, DEFAULT_STATE_FILE,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oura-cli")]
#[command(about = "Collect Oura Ring metrics and store them in CSV files")]
struct Cli {
    /// Oura personal access token.
    #[arg(long, global = true, env = "OURA_PERSONAL_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Directory where category CSV files are stored.
    #[arg(long, global = true, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// JSON file tracking per-category fetch watermarks.
    #[arg(long, global = true, default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// Hours to look back for categories with no stored watermark.
    #[arg(long, global = true, default_value_t = DEFAULT_LOOKBACK_HOURS)]
    lookback_hours: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct CategorySelection {
    /// Categories to fetch, or `all`.
    #[arg(short = 'c', long, num_args = 1.., default_value = "all")]
    categories: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch data immediately.
    Fetch(CategorySelection),
    /// Fetch on a fixed interval until interrupted.
    Service {
        #[command(flatten)]
        selection: CategorySelection,
        /// How often, in hours, to pull data.
        #[arg(long, default_value_t = 2.0)]
        interval_hours: f64,
        /// Stop after this many runs.
        #[arg(long)]
        max_runs: Option<usize>,
    },
}

impl Commands {
    fn selection(&self) -> &CategorySelection {
        match self {
            Commands::Fetch(selection) => selection,
            Commands::Service { selection, .. } => selection,
        }
    }
}

fn build_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env();
    if let Some(token) = &cli.token {
        config.token = token.clone();
    }
    config.output_dir = cli.output_dir.clone();
    config.state_file = cli.state_file.clone();
    config.set_lookback_hours(cli.lookback_hours);
    config.categories = resolve_categories(&cli.command.selection().categories)?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    info!(
        categories = ?config.categories.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        output_dir = %config.output_dir.display(),
        state_file = %config.state_file.display(),
        "configuration resolved"
    );
    let pipeline = SyncPipeline::new(config)?;

    match cli.command {
        Commands::Fetch(_) => {
            let summary = pipeline.run_once().await?;
            summary.log();
            println!(
                "fetch complete: run_id={} categories={} fetched={} new_rows={}",
                summary.run_id,
                summary.results.len(),
                summary.total_records(),
                summary.new_records()
            );
        }
        Commands::Service {
            interval_hours,
            max_runs,
            ..
        } => {
            let service = ServiceConfig::from_hours(interval_hours, max_runs);
            let runs = run_service(&pipeline, &service).await;
            println!("service stopped after {runs} runs");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use oura_core::Category;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fetch_defaults_to_all_categories() {
        let cli = Cli::try_parse_from(["oura-cli", "--token", "t", "fetch"]).expect("parse");
        assert_eq!(cli.output_dir, PathBuf::from("data"));
        assert_eq!(cli.lookback_hours, 48);
        let config = build_config(&cli).expect("config");
        assert_eq!(config.categories, Category::ALL.to_vec());
        assert_eq!(config.token, "t");
    }

    #[test]
    fn service_accepts_categories_and_bounds() {
        let cli = Cli::try_parse_from([
            "oura-cli",
            "service",
            "-c",
            "sleep",
            "Workout",
            "--interval-hours",
            "0.5",
            "--max-runs",
            "3",
            "--token",
            "t",
            "--lookback-hours",
            "12",
        ])
        .expect("parse");

        let config = build_config(&cli).expect("config");
        assert_eq!(config.categories, vec![Category::Sleep, Category::Workout]);
        assert_eq!(config.lookback.num_hours(), 12);
        match cli.command {
            Commands::Service {
                interval_hours,
                max_runs,
                ..
            } => {
                assert_eq!(interval_hours, 0.5);
                assert_eq!(max_runs, Some(3));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_category_is_rejected() {
        let cli = Cli::try_parse_from(["oura-cli", "--token", "t", "fetch", "-c", "steps"]).expect("parse");
        let err = build_config(&cli).unwrap_err();
        assert!(err.to_string().contains("unknown category 'steps'"));
    }
}
