mod report;

use anyhow::{Context, Result};
use clap::Parser;
use loadbench_core::{build_variants, mock_variants, Config, MatrixDriver};
use report::{OutputFormat, RunReport};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "loadbench")]
#[command(about = "Concurrent load and latency benchmark for LLM completion APIs")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/loadbench.toml")]
    config: PathBuf,

    /// Invocation mode: http (real targets) or mock (in-process simulation)
    #[arg(long, default_value = "http")]
    mode: String,

    /// Single concurrency level (overrides config)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Dispatch window per cell in milliseconds (overrides config)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Only print the resolved test matrix without running
    #[arg(long)]
    plan_only: bool,

    /// Report file format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Directory the report file is written to
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file_unvalidated(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(concurrency) = args.concurrency {
        config.test.concurrency = concurrency;
        config.test.concurrency_levels.clear();
    }
    if let Some(duration_ms) = args.duration_ms {
        config.test.duration_ms = duration_ms;
    }
    config
        .validate()
        .with_context(|| format!("Invalid config {:?}", args.config))?;

    if config.test.max_retries > 0 {
        debug!(
            "max_retries={} is configured but requests are attempted once",
            config.test.max_retries
        );
    }

    let variants = match args.mode.as_str() {
        "http" => build_variants(&config).context("Failed to initialise targets")?,
        "mock" => mock_variants(&config),
        _ => anyhow::bail!("Invalid mode: {}, must be 'http' or 'mock'", args.mode),
    };
    if variants.is_empty() {
        anyhow::bail!("Every configured model is marked skip = true");
    }

    let driver = MatrixDriver::from_config(&config, variants);
    print_plan(&driver);
    if args.plan_only {
        return Ok(());
    }

    info!(
        "Starting benchmark: duration={}ms timeout={}ms stream={} targets={}",
        config.test.duration_ms,
        config.test.request_timeout_ms,
        config.prompt.stream,
        driver.variants().len()
    );

    let results = driver.run().await.context("Benchmark aborted")?;

    let report = RunReport::new(
        &args.mode,
        config.prompt.stream,
        config.test.duration_ms,
        config.test.request_timeout_ms,
        &results,
    );
    println!("\n{}", report.render(OutputFormat::Text)?);

    let output_path = write_report(&args.out_dir, &report, args.output)?;
    info!("Report written to {}", output_path.display());

    Ok(())
}

fn print_plan(driver: &MatrixDriver) {
    println!("\n=== Test Matrix ===");
    for (variant, levels) in driver.plan() {
        println!("{}: concurrency {:?}", variant, levels);
    }
    println!();
}

fn write_report(out_dir: &Path, report: &RunReport<'_>, format: OutputFormat) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {:?}", out_dir))?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let kind = if report.stream { "stream" } else { "standard" };
    let output_path = out_dir.join(format!(
        "loadbench_{}_{}.{}",
        timestamp,
        kind,
        format.extension()
    ));

    let content = report.render(format)?;
    std::fs::write(&output_path, content)
        .with_context(|| format!("Failed to write {:?}", output_path))?;
    Ok(output_path)
}
