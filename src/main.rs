//! transit - Main Entry Point
//!
//! Loads a pipeline file, runs it until the source is exhausted and shuts it
//! down again.
//!
//! ```text
//! transit <pipeline.toml>      run a pipeline
//! transit --list               show the registered adaptors and functions
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use transit::{
    config::PipelineConfig,
    pipeline::PipelineBuilder,
    registry::Registry,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "transit",
    version,
    about = "Resumable record pipelines backed by a commit log"
)]
struct Cli {
    /// Path to the pipeline TOML file
    #[arg(required_unless_present = "list")]
    pipeline: Option<PathBuf>,

    /// List the registered adaptors and functions, then exit
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,transit=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let registry = Registry::with_builtins();

    if cli.list {
        print_registry(&registry);
        return Ok(());
    }
    let Some(path) = cli.pipeline else {
        anyhow::bail!("a pipeline file is required");
    };

    let config = PipelineConfig::load(&path)
        .with_context(|| format!("Failed to load pipeline from {}", path.display()))?;
    tracing::info!(file = %path.display(), version = %config.version, "Starting transit");

    let pipeline = PipelineBuilder::new(config, &registry)
        .build()
        .context("Failed to build pipeline")?;
    let result = pipeline.run();
    pipeline.stop();
    result.context("Pipeline failed")?;

    tracing::info!("Shutting down...");
    Ok(())
}

fn print_registry(registry: &Registry) {
    println!("adaptors:");
    for name in registry.adaptor_names() {
        let Some(info) = registry.adaptor_info(name) else {
            continue;
        };
        println!("  {:<10} {}", name, info.description);
        for line in info.sample_config.lines() {
            println!("      {}", line);
        }
    }
    println!("functions:");
    for name in registry.function_names() {
        println!("  {}", name);
    }
}
