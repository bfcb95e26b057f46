//! passbench CLI - run a password-model evaluation matrix
//!
//! Loads the general settings and scenario files, expands them into runs,
//! executes the runs and prints a per-run summary:
//!
//! 1. Configuration: `passbench.toml` + scenario files + `--param` overrides
//! 2. Planning: every run validated before any work starts
//! 3. Execution: split cache, training with checkpoints, evaluation
//! 4. Reporting: results tables, run manifests, terminal summary

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use passbench::config::{Override, Scenario, Settings};
use passbench::{ExecutionContext, ModelRegistry, RunRecord, RunStatus, Runner};

/// Evaluate generative password-guessing models over a parameter matrix
///
/// Examples:
///   passbench                                   # settings + scenarios from ./passbench.toml
///   passbench -s scenarios/standard.toml        # one scenario file
///   passbench -p n_samples=1000000,5000000      # override a parameter
///   passbench --cache-stats                     # inspect the split cache
#[derive(Parser, Debug)]
#[command(name = "passbench")]
#[command(version)]
#[command(about, long_about = None)]
pub struct Cli {
    /// General settings file
    ///
    /// Defaults to passbench.toml in the current directory, or built-in
    /// defaults when there is none.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Scenario files (repeatable)
    ///
    /// Replaces the scenario list of the settings file.
    #[arg(short, long = "scenario", value_name = "FILE")]
    pub scenarios: Vec<PathBuf>,

    /// Only run scenarios with these names
    #[arg(long, value_name = "NAME")]
    pub only: Vec<String>,

    /// Parameter override `[group:]name=v1,v2` (repeatable)
    ///
    /// Overrides win over scenario files, which win over the settings file.
    #[arg(short, long = "param", value_name = "OVERRIDE")]
    pub params: Vec<String>,

    /// Clear the split cache before running
    #[arg(long)]
    pub refresh: bool,

    /// Print split cache statistics and exit
    #[arg(long)]
    pub cache_stats: bool,

    /// Expand and validate the matrix without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Override the number of concurrent runs
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let start = Instant::now();

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::discover(Path::new(".")).context("loading passbench.toml")?,
    };
    if let Some(jobs) = cli.jobs {
        settings.execution.parallel_runs = jobs;
    }

    let ctx = ExecutionContext::new(&settings, ModelRegistry::builtin());
    init_logging(&ctx)?;

    let runner = Runner::new(&ctx).context("opening datasets and split cache")?;

    if cli.cache_stats {
        let stats = runner.cache().stats();
        println!(
            "{} {} entries, {} ({})",
            "split cache:".bold(),
            stats.entries,
            stats.size_human(),
            runner.cache().path().display()
        );
        return Ok(());
    }

    if cli.refresh {
        runner.cache().clear().context("clearing split cache")?;
        tracing::info!("split cache cleared");
    }

    let scenarios = load_scenarios(&cli, &settings)?;
    let overrides = cli
        .params
        .iter()
        .map(|p| Override::parse(p))
        .collect::<passbench::Result<Vec<_>>>()
        .context("parsing --param")?;

    let runs = runner.plan(&settings, &scenarios, &overrides).context("planning runs")?;
    eprintln!(
        "{} {} runs from {} scenario(s), {} in parallel",
        "✓".green(),
        runs.len(),
        scenarios.len(),
        ctx.parallel_runs
    );

    if cli.dry_run {
        for run in &runs {
            println!("{} {} {}", run.model.cyan(), run.test_id.short(), run.run_dir.display().dimmed());
        }
        return Ok(());
    }

    let records = runner.run_all(&runs).context("run aborted")?;
    print_summary(&records);
    eprintln!("Total time: {:.2?}", start.elapsed());

    let failed = records.iter().filter(|r| !r.is_completed()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} runs did not complete", failed, records.len());
    }
    Ok(())
}

fn load_scenarios(cli: &Cli, settings: &Settings) -> Result<Vec<Scenario>> {
    let files = if cli.scenarios.is_empty() {
        &settings.execution.scenarios
    } else {
        &cli.scenarios
    };
    if files.is_empty() {
        anyhow::bail!("no scenario files given (use --scenario or [execution].scenarios)");
    }

    let mut scenarios = Vec::new();
    for file in files {
        let loaded = Scenario::load_file(file).with_context(|| format!("loading scenario {}", file.display()))?;
        scenarios.extend(loaded);
    }
    if !cli.only.is_empty() {
        scenarios.retain(|s| cli.only.contains(&s.name));
    }
    if scenarios.is_empty() {
        anyhow::bail!("no scenario selected");
    }
    Ok(scenarios)
}

/// Terminal logging, or `<logs>/passbench.log` when logs are not displayed.
fn init_logging(ctx: &ExecutionContext) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if ctx.display_logs {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return Ok(());
    }

    fs::create_dir_all(&ctx.paths.logs).with_context(|| format!("creating {}", ctx.paths.logs.display()))?;
    let path = ctx.paths.logs.join("passbench.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

fn print_summary(records: &[RunRecord]) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for record in records {
        let id = format!("{}/{} {}", record.scenario, record.model, record.test_hash.short());
        match &record.status {
            RunStatus::Completed { report, fast_eval, .. } => {
                let kind = if *fast_eval { "existing guesses" } else { report.mode.as_str() };
                println!(
                    "{} {} {}/{} matched ({}%) from {} guesses [{}]",
                    "✓".green(),
                    id.bold(),
                    report.matches,
                    report.test_size,
                    report.match_percentage(),
                    report.generated,
                    kind.dimmed()
                );
            }
            RunStatus::Failed { error } => println!("{} {} {}", "✗".red(), id.bold(), error.red()),
            RunStatus::Skipped => println!("{} {} skipped", "-".yellow(), id.dimmed()),
        }
    }
}
