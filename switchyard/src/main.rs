use clap::{Args, Parser};
use std::path::PathBuf;

mod config;
use config::{Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::future::Future;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the edge dispatcher
    Serve(ServeArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cmd = CliCommand::parse();

    match &cmd {
        CliCommand::Serve(serve_args) => {
            let config = Config::from_file(&serve_args.base.config_file_path)?;
            init_statsd_recorder("switchyard.dispatcher", config.metrics());

            let dispatcher_config = config
                .dispatcher
                .ok_or(CliError::InvalidConfig("Missing dispatcher config"))?;

            run_async(dispatcher::run(dispatcher_config))?;
            Ok(())
        }
        CliCommand::ShowMetrics => {
            let mut all = Vec::new();
            all.extend_from_slice(dispatcher::metrics_defs::ALL_METRICS);
            all.extend_from_slice(stores::metrics_defs::ALL_METRICS);
            println!("{}", generate_metrics_table(&all));
            Ok(())
        }
    }
}

fn generate_metrics_table(metrics: &[shared::metrics_defs::MetricDef]) -> String {
    use std::fmt::Write as _;

    let mut table = String::from("| Metric | Type | Description |\n|---|---|---|");
    for def in metrics {
        let _ = write!(
            table,
            "\n| `{}` | {} | {} |",
            def.name,
            def.metric_type.as_str(),
            def.description
        );
    }
    table
}

fn init_statsd_recorder(prefix: &str, metrics_config: Option<&MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host.clone(), *statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

/// Drives the dispatcher future on a fresh multi-thread runtime. An
/// error out of the serve loop is fatal for the process.
fn run_async(
    fut: impl Future<Output = Result<(), impl std::error::Error>>,
) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match runtime.block_on(fut) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "dispatcher exited with error");
            process::exit(1);
        }
    }
}

// Failures are logged as structured JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[derive(Args, Debug, Clone)]
struct BaseArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    base: BaseArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_table_lists_every_definition() {
        let mut all = Vec::new();
        all.extend_from_slice(dispatcher::metrics_defs::ALL_METRICS);
        all.extend_from_slice(stores::metrics_defs::ALL_METRICS);

        let table = generate_metrics_table(&all);
        for def in &all {
            assert!(table.contains(def.name), "missing {}", def.name);
        }
    }
}
