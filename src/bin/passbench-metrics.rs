//! passbench-metrics - metrics over persisted guess files
//!
//! `evaluate` matches guess files against test files; `jaccard` and
//! `mergeability` compare the guesses of several runs and append one row per
//! combination to `<tables>/<metric>-<mode>.csv`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use passbench::metrics::{self, Metric};

#[derive(Parser, Debug)]
#[command(name = "passbench-metrics")]
#[command(version)]
#[command(about = "Cross-run metrics over persisted guess files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match guess files against test files
    Evaluate {
        /// Guess files (plain or gzip)
        #[arg(short, long, required = true, num_args = 1..)]
        guesses: Vec<PathBuf>,

        /// Test files (plain or gzip)
        #[arg(short, long, required = true, num_args = 1..)]
        test: Vec<PathBuf>,
    },
    /// Jaccard index of the guess sets of several runs
    Jaccard(CrossRunArgs),
    /// Share of distinct guesses produced by more than one run
    Mergeability(CrossRunArgs),
}

#[derive(Args, Debug)]
struct CrossRunArgs {
    /// Guess files, laid out as results/<scenario>/<model>/<dataset>/<settings>/<n>/<hash>/guesses/<file>
    #[arg(short, long, required = true, num_args = 1..)]
    guesses: Vec<PathBuf>,

    /// Subset size; 0 compares all files at once, larger than the file count compares nothing
    #[arg(short, long, default_value = "0")]
    combination: usize,

    /// Directory receiving the metric tables
    #[arg(long, default_value = ".")]
    tables: PathBuf,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    match Cli::parse().command {
        Command::Evaluate { guesses, test } => {
            let summary = metrics::evaluate(&guesses, &test).context("evaluating guess files")?;
            println!(
                "{} {}/{} matched ({:.2}%), {} distinct guesses",
                "✓".green(),
                summary.matches,
                summary.test_size,
                summary.match_percentage(),
                summary.uniques
            );
        }
        Command::Jaccard(args) => run_cross(Metric::Jaccard, &args)?,
        Command::Mergeability(args) => run_cross(Metric::Mergeability, &args)?,
    }
    Ok(())
}

fn run_cross(metric: Metric, args: &CrossRunArgs) -> Result<()> {
    let rows = metrics::cross_run(metric, &args.guesses, args.combination, &args.tables)
        .with_context(|| format!("computing {:?}", metric))?;
    if rows.is_empty() {
        eprintln!("{} no combination produced a value", "!".yellow());
    }
    for row in &rows {
        println!(
            "{} {:<32} {:.4} {}",
            row.label.dataset.dimmed(),
            row.combo.bold(),
            row.value,
            format!("({}/{})", row.overlap_intersection, row.overlap_union).dimmed()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_evaluate() {
        let cli = Cli::parse_from(["passbench-metrics", "evaluate", "-g", "a.gz", "b.gz", "-t", "test.txt"]);
        match cli.command {
            Command::Evaluate { guesses, test } => {
                assert_eq!(guesses.len(), 2);
                assert_eq!(test, vec![PathBuf::from("test.txt")]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_jaccard_defaults() {
        let cli = Cli::parse_from(["passbench-metrics", "jaccard", "--guesses", "a.gz", "b.gz"]);
        match cli.command {
            Command::Jaccard(args) => {
                assert_eq!(args.combination, 0);
                assert_eq!(args.tables, PathBuf::from("."));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
