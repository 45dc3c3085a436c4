//! Rill CLI - run streaming SQL rules over JSON lines files

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rill_cli::config::RuleFile;
use rill_cli::{check_sql, parse_sql, run_rule, RunOptions};

#[derive(Parser)]
#[command(name = "rill")]
#[command(version)]
#[command(about = "Rill - streaming SQL rules over event streams", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error), overrides the rule file
    #[arg(long, global = true, env = "RILL_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rule file until its inputs are consumed
    Run {
        /// Path to the rule file (YAML or TOML)
        file: PathBuf,

        /// Write results to this file instead of the rule file's output
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Milliseconds to keep running after the inputs end
        #[arg(long, default_value = "1000")]
        linger_ms: u64,
    },

    /// Parse a statement and show the AST
    Parse {
        /// SQL statement
        sql: String,
    },

    /// Parse and validate a statement
    Check {
        /// SQL statement
        sql: String,
    },

    /// Print an example rule file
    Example {
        /// Print TOML instead of YAML
        #[arg(long)]
        toml: bool,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let level: Level = level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level {}", level))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            output,
            linger_ms,
        } => {
            let rule_file = RuleFile::load(&file)?;
            let level = cli
                .log_level
                .as_deref()
                .unwrap_or(&rule_file.logging.level);
            init_logging(level)?;

            let opts = RunOptions {
                linger: Duration::from_millis(linger_ms),
                output,
            };
            let metrics = run_rule(&rule_file, &opts).await?;
            for (name, value) in metrics.iter().filter(|(_, v)| **v > 0) {
                info!("{} = {}", name, value);
            }
        }

        Commands::Parse { sql } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"))?;
            println!("{}", parse_sql(&sql)?);
        }

        Commands::Check { sql } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"))?;
            let diagnostics = check_sql(&sql)?;
            print!("{}", diagnostics);
            println!("OK");
        }

        Commands::Example { toml } => {
            if toml {
                print!("{}", RuleFile::example_toml());
            } else {
                print!("{}", RuleFile::example_yaml());
            }
        }
    }

    Ok(())
}
