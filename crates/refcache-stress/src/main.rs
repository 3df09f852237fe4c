use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod config;
mod logging;
mod stresstest;
mod workloads;

use config::Config;
use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long = "workloads", short = 'w', value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long = "duration", short = 'd', value_parser = humantime::parse_duration)]
    duration: Duration,
}

fn main() {
    if let Err(error) = run() {
        logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: No runtime has been started yet, this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.extend(config.metrics.custom_tags.clone());

        refcache::metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(perform_stresstest(&config.cache, workloads, cli.duration))
}
