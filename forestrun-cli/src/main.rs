//! forestrun CLI — train the taxi-duration random forest and log the run.

use anyhow::Context;
use clap::Parser;
use forestrun_core::config::{ConfigOverrides, load_config};
use forestrun_ml::TrainingReport;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train a random-forest regressor on prepared splits and log the run
#[derive(Parser, Debug)]
#[command(name = "forestrun", version, about, long_about = None)]
struct Cli {
    /// Directory holding train.bin and valid.bin [default: ./output]
    #[arg(long = "data_path", value_name = "DIR")]
    data_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Lines printed to stdout for a finished run.
fn summary(report: &TrainingReport) -> [String; 2] {
    [
        format!("run {}: valid RMSE {:.4}", report.run_id, report.valid_rmse),
        format!("model saved to {}", report.model_path.display()),
    ]
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(cli.log_filter()));

    let log_dir = directories::ProjectDirs::from("dev", "forestrun", "forestrun")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "forestrun.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let overrides = ConfigOverrides {
        data_path: cli.data_path.clone(),
    };
    let config =
        load_config(cli.config.as_deref(), &overrides).context("Configuration error")?;
    info!(
        data_path = %config.data.data_path.display(),
        tracking_uri = %config.tracking.tracking_uri,
        experiment = %config.tracking.experiment_name,
        "forestrun starting"
    );

    let report = forestrun_ml::run_from_config(&config)
        .await
        .with_context(|| {
            format!(
                "Training on {} failed",
                config.data.data_path.display()
            )
        })?;

    info!(
        run_id = %report.run_id,
        experiment_id = %report.experiment_id,
        valid_rmse = report.valid_rmse,
        artifact = %report.artifact_uri,
        "forestrun finished"
    );
    if !cli.quiet {
        for line in summary(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_data_path_flag() {
        let cli = Cli::parse_from(["forestrun", "--data_path", "/tmp/splits"]);
        assert_eq!(cli.data_path, Some(PathBuf::from("/tmp/splits")));
        let cli = Cli::parse_from(["forestrun"]);
        assert_eq!(cli.data_path, None);
    }

    #[test]
    fn test_summary_lines() {
        let report = TrainingReport {
            run_id: "abc".into(),
            experiment_id: "1".into(),
            valid_rmse: 5.123456,
            model_path: PathBuf::from("models/random_forest_reg.bin"),
            model_sha256: String::new(),
            artifact_uri: String::new(),
            training_metrics: None,
        };
        assert_eq!(
            summary(&report),
            [
                "run abc: valid RMSE 5.1235".to_string(),
                "model saved to models/random_forest_reg.bin".to_string(),
            ]
        );
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(Cli::parse_from(["forestrun"]).log_filter(), "info");
        assert_eq!(Cli::parse_from(["forestrun", "-q"]).log_filter(), "error");
        assert_eq!(Cli::parse_from(["forestrun", "-vv"]).log_filter(), "trace");
    }
}
