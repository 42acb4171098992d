use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use krakenmerge_rs::errors::KrakenMergeError;
use krakenmerge_rs::merge;

#[derive(Parser)]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // Merge (assignment, report) pairs; later pairs take precedence
    Merge {
        // Assignment files ordered by preference (later = higher)
        #[arg(long = "in-assignments", num_args = 1.., required = true)]
        in_assignments: Vec<PathBuf>,

        // Report files ordered by preference, paired by position
        #[arg(long = "in-reports", num_args = 1.., required = true)]
        in_reports: Vec<PathBuf>,

        // Output prefix for the merged artifacts
        #[arg(long = "out-prefix", default_value = "merged")]
        out_prefix: String,

        // Verbosity
        #[arg(short = 'v', long = "verbose", default_value_t = false)]
        verbose: bool,
    },

    // Diagnose ledger/report consistency for one pair without merging
    Check {
        #[arg(long = "in-assignment", required = true)]
        in_assignment: PathBuf,

        #[arg(long = "in-report", required = true)]
        in_report: PathBuf,

        // Verbosity
        #[arg(short = 'v', long = "verbose", default_value_t = false)]
        verbose: bool,
    },

    // Merge assignment ledgers only, skipping report bookkeeping
    MergeAssignments {
        #[arg(long = "in-assignments", num_args = 1.., required = true)]
        in_assignments: Vec<PathBuf>,

        #[arg(short = 'o', long = "output", required = true)]
        output: PathBuf,

        // Verbosity
        #[arg(short = 'v', long = "verbose", default_value_t = false)]
        verbose: bool,
    },
}

/// Initializes the logger; `--verbose` lowers the filter to debug.
fn init_log(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("Invalid spinner template"),
    );
    bar.set_message(message.to_string());
    bar
}

fn run(cli: Cli) -> Result<(), KrakenMergeError> {
    match cli.command {
        Commands::Merge {
            in_assignments,
            in_reports,
            out_prefix,
            verbose,
        } => {
            init_log(verbose);
            let bar = spinner(&format!("Merging {} pairs...", in_assignments.len()));
            let result = merge::merge(&in_assignments, &in_reports, &out_prefix);
            bar.finish_with_message(match &result {
                Ok(()) => format!("Merged into {out_prefix}.kraken_assignments.tsv and {out_prefix}.kraken_report.txt"),
                Err(_) => "Merge failed".to_string(),
            });
            result
        }

        Commands::Check {
            in_assignment,
            in_report,
            verbose,
        } => {
            init_log(verbose);
            merge::check_pair_files(&in_assignment, &in_report)
        }

        Commands::MergeAssignments {
            in_assignments,
            output,
            verbose,
        } => {
            init_log(verbose);
            let changes = merge::merge_all_assignments(&in_assignments, &output)?;
            log::info!(
                "Merged {} assignment files into {} ({} distinct reassignments)",
                in_assignments.len(),
                output.display(),
                changes.len()
            );
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("ERROR: {err}");
        std::process::exit(err.exit_code());
    }
}
