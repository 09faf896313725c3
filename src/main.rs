mod chunker;
mod config;
mod context;
mod depgraph;
mod error;
mod ledger;
mod lifecycle;
mod oracle;
mod parse;
mod record;
mod score;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use crate::lifecycle::PassOptions;
use crate::oracle::{CommandOracle, OllamaOracle, Oracle};
use crate::record::PatchStore;

#[derive(Parser)]
#[command(
    name = "repatch",
    version,
    about = "LLM-assisted source rewriting with validation, scoring and rollback",
    long_about = "Proposes per-unit rewrites of Python sources via an external model, \
validates them against the file's interface, scores them, and records reversible \
file-level patches that can be applied and rolled back."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one rewrite pass over a repository, proposing patch records
    Run {
        /// Repository root
        #[arg(short = 'C', long, default_value = ".")]
        root: PathBuf,

        /// Use an external command as the oracle (prompt on stdin, code on
        /// stdout) instead of the configured Ollama endpoint
        #[arg(long)]
        oracle_cmd: Option<String>,

        /// Override the configured sandbox test command
        #[arg(long)]
        test_cmd: Option<String>,

        /// Override the configured minimum mean score
        #[arg(long)]
        min_score: Option<u8>,
    },

    /// List patch records and their lifecycle state
    List {
        #[arg(short = 'C', long, default_value = ".")]
        root: PathBuf,
    },

    /// Apply pending patch records by id (reverts automatically if tests fail)
    Apply {
        /// Patch ids, as printed by `list`
        #[arg(required = true)]
        ids: Vec<String>,

        #[arg(short = 'C', long, default_value = ".")]
        root: PathBuf,

        /// Override the configured test command
        #[arg(long)]
        test_cmd: Option<String>,
    },

    /// Show which files depend on a file (or on one of its symbols)
    Impact {
        /// Source file, relative to the repository root
        file: String,

        #[arg(short = 'C', long, default_value = ".")]
        root: PathBuf,

        /// Restrict the report to a single symbol defined in the file
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Create default config file
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    match cli.command {
        Commands::Run {
            root,
            oracle_cmd,
            test_cmd,
            min_score,
        } => {
            let mut opts = PassOptions::from_config(&config, cli.verbose);
            if let Some(cmd) = test_cmd {
                opts.test_cmd = cmd;
            }
            if let Some(score) = min_score {
                opts.min_score = score;
            }

            let oracle: Box<dyn Oracle> = match oracle_cmd {
                Some(command) => Box::new(CommandOracle { command }),
                None => Box::new(OllamaOracle {
                    host: config.oracle.host.clone(),
                    model: config.oracle.model.clone(),
                    timeout_ms: config.oracle.timeout_ms,
                }),
            };

            if cli.verbose > 0 {
                eprintln!(
                    "{} pass over {} (oracle: {}, min score {})",
                    "repatch:".dimmed(),
                    root.display(),
                    oracle.name(),
                    opts.min_score
                );
            }
            let summary = lifecycle::run_pass(&root, oracle.as_ref(), &opts)?;
            println!(
                "{} files, {} patch(es) proposed, {} skipped (pending {}, parse {}, score {}, empty {}), {} failed tests",
                summary.files_seen,
                summary.patches_created,
                summary.skipped_pending
                    + summary.skipped_parse
                    + summary.skipped_low_score
                    + summary.skipped_no_candidates,
                summary.skipped_pending,
                summary.skipped_parse,
                summary.skipped_low_score,
                summary.skipped_no_candidates,
                summary.tests_failed,
            );
        }

        Commands::List { root } => {
            let store = PatchStore::open(&root)?;
            let records = store.list()?;
            if records.is_empty() {
                println!("no patch records");
                return Ok(());
            }
            let graph =
                depgraph::DependencyGraph::build(&root, &config.filters.ignore_dirs);
            for r in records {
                let state = match r.state {
                    record::PatchState::Proposed => r.state.to_string().yellow(),
                    record::PatchState::TestsPassed => r.state.to_string().green(),
                    record::PatchState::Rejected | record::PatchState::Reverted => {
                        r.state.to_string().red()
                    }
                    _ => r.state.to_string().normal(),
                };
                let dependents = graph.get_dependents(&r.target_file).len();
                println!(
                    "{}  {}  {}  score {}/10  {} dependent file(s)",
                    r.id, state, r.target_file, r.score, dependents
                );
                if cli.verbose > 0 {
                    println!("    {}", r.description.dimmed());
                }
            }
        }

        Commands::Apply {
            ids,
            root,
            test_cmd,
        } => {
            let mut opts = PassOptions::from_config(&config, cli.verbose);
            if let Some(cmd) = test_cmd {
                opts.test_cmd = cmd;
            }
            let mut failures = 0usize;
            for id in &ids {
                if !lifecycle::apply_record(&root, id, &opts)? {
                    failures += 1;
                }
            }
            if failures > 0 {
                anyhow::bail!("{failures} of {} patch(es) not applied", ids.len());
            }
        }

        Commands::Impact { file, root, symbol } => {
            let graph =
                depgraph::DependencyGraph::build(&root, &config.filters.ignore_dirs);
            match symbol {
                Some(name) => {
                    let broken = graph.will_break(&name);
                    if broken.is_empty() {
                        println!("no file uses `{name}`");
                    } else {
                        println!("removing `{name}` would break:");
                        for f in broken {
                            println!("  {f}");
                        }
                    }
                }
                None => {
                    let dependents = graph.get_dependents(&file);
                    if dependents.is_empty() {
                        println!("no file depends on {file}");
                    } else {
                        println!("{} file(s) depend on {file}:", dependents.len());
                        for f in dependents {
                            println!("  {f}");
                        }
                    }
                    let dependencies = graph.get_dependencies(&file);
                    if !dependencies.is_empty() {
                        println!("{file} depends on:");
                        for f in dependencies {
                            println!("  {f}");
                        }
                    }
                    for (symbol, files) in graph.duplicate_defines() {
                        println!(
                            "{} `{symbol}` defined in multiple files: {}",
                            "warning:".yellow(),
                            files.join(", ")
                        );
                    }
                }
            }
        }

        Commands::Config { command } => match command {
            ConfigCommands::Show => config::show_config()?,
            ConfigCommands::Init => {
                let path = config::Config::create_default()?;
                println!("Created config: {}", path.display());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_parses_run_with_overrides() {
        let cli = Cli::parse_from([
            "repatch", "run", "-C", "/tmp/repo", "--oracle-cmd", "cat", "--min-score", "5",
        ]);
        match cli.command {
            Commands::Run {
                root,
                oracle_cmd,
                min_score,
                ..
            } => {
                assert_eq!(root, PathBuf::from("/tmp/repo"));
                assert_eq!(oracle_cmd.as_deref(), Some("cat"));
                assert_eq!(min_score, Some(5));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_apply_ids() {
        let cli = Cli::parse_from(["repatch", "apply", "PATCH_a", "PATCH_b"]);
        match cli.command {
            Commands::Apply { ids, .. } => assert_eq!(ids.len(), 2),
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_pass_options_from_config() {
        let config = config::Config::default();
        let opts = PassOptions::from_config(&config, 1);
        assert_eq!(opts.min_score, 3);
        assert_eq!(opts.test_timeout, Duration::from_secs(10));
    }
}
