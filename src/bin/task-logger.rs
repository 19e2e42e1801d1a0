//! task-logger CLI: drive a batch through the attempt log, inspect it, repair it.
//!
//! Keys are read from stdin, one per line, parts separated by TAB:
//!
//! ```text
//! find data -name '*.sdf' | task-logger run --log import.json -- ./import.sh
//! ```
//!
//! Set RUST_LOG=task_logger=debug for per-attempt state transitions.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::{Command as Process, Stdio};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use task_logger::config::Config;
use task_logger::model::fields;
use task_logger::telemetry::{TelemetryConfig, init_telemetry};
use task_logger::{ArgKey, AttemptRecord, NonSuppressedError, Session, SessionOptions, State};
use tracing::info;

#[derive(Parser)]
#[command(name = "task-logger", about = "Per-item processing tracker")]
struct Cli {
    /// TOML config file (environment variables override it)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run PROGRAM once per key read from stdin, skipping completed keys
    Run {
        /// Log file (default: TASK_LOGGER_LOG or default-log.json)
        #[arg(long)]
        log: Option<PathBuf>,
        /// Stop the batch on the first failing key
        #[arg(long)]
        propagate_errors: bool,
        /// Do not write the log when a key starts processing
        #[arg(long)]
        no_checkpoint: bool,
        /// Program and leading arguments; key parts are appended
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        program: Vec<String>,
    },
    /// Print every record in a log
    Summary {
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Force one record into a state (e.g. clear a stale "attempting")
    Reset {
        #[arg(long)]
        log: Option<PathBuf>,
        /// Target state
        #[arg(long, default_value = "new")]
        state: String,
        /// Key parts
        #[arg(required = true)]
        key: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    let _telemetry = init_telemetry(TelemetryConfig::from_config(&config))?;

    match cli.command {
        Command::Run {
            log,
            propagate_errors,
            no_checkpoint,
            program,
        } => {
            if let Some(log) = log {
                config.log_path = log;
            }
            if propagate_errors {
                config.suppress_errors = false;
            }
            if no_checkpoint {
                config.checkpoint_on_entry = false;
            }
            tokio::task::spawn_blocking(move || cmd_run(&config, &program)).await?
        }
        Command::Summary { log } => {
            if let Some(log) = log {
                config.log_path = log;
            }
            tokio::task::spawn_blocking(move || cmd_summary(&config)).await?
        }
        Command::Reset { log, state, key } => {
            if let Some(log) = log {
                config.log_path = log;
            }
            tokio::task::spawn_blocking(move || cmd_reset(&config, &state, key)).await?
        }
    }
}

fn cmd_run(config: &Config, program: &[String]) -> anyhow::Result<()> {
    let keys = read_keys(std::io::stdin().lock())?;
    info!(keys = keys.len(), log = %config.log_path.display(), "starting batch");

    let summary = Session::scope(
        &config.log_path,
        SessionOptions::from(config),
        |session| -> anyhow::Result<String> {
            session.run_batch(keys, |key, record| run_program(program, key, record))?;
            Ok(session.summarize()?)
        },
    )?;

    println!("{summary}");
    Ok(())
}

fn cmd_summary(config: &Config) -> anyhow::Result<()> {
    let session = Session::open_read_only(&config.log_path)
        .with_context(|| format!("cannot read log {}", config.log_path.display()))?;
    println!("{}", session.summarize()?);
    Ok(())
}

fn cmd_reset(config: &Config, state: &str, key: Vec<String>) -> anyhow::Result<()> {
    let state: State = state.parse()?;
    let key = ArgKey::from(key);

    let mut session = Session::open_session(&config.log_path)?;
    let previous = session.reset(&key, state)?;
    session.close()?;

    match previous {
        Some(previous) => println!("{key}: {previous} -> {state}"),
        None => bail!("no record for {key} in {}", config.log_path.display()),
    }
    Ok(())
}

/// Non-empty stdin lines, TAB-separated into key parts.
fn read_keys(input: impl BufRead) -> anyhow::Result<Vec<ArgKey>> {
    let mut keys = Vec::new();
    for line in input.lines() {
        let line = line.context("failed to read keys from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        keys.push(ArgKey::new(line.split('\t')));
    }
    Ok(keys)
}

/// Processing step: run the program with the key appended.
///
/// A program that cannot be started stops the batch; a non-zero exit only
/// fails this key. Stdout is kept as the record's `results`.
fn run_program(program: &[String], key: &ArgKey, record: &mut AttemptRecord) -> anyhow::Result<()> {
    let Some((bin, args)) = program.split_first() else {
        return Err(NonSuppressedError::new("no program given").into());
    };

    let output = Process::new(bin)
        .args(args)
        .args(key.parts())
        .stdin(Stdio::null())
        .output()
        .map_err(|e| NonSuppressedError::wrapping(format!("cannot run {bin}"), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{bin} exited with {}: {}", output.status, stderr.trim());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    record.set(fields::RESULTS, stdout.trim().to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_keys_splits_tabs_and_skips_blank_lines() {
        let input = "a.sdf\n\nb.sdf\tfast\n   \n";
        let keys = read_keys(input.as_bytes()).unwrap();
        assert_eq!(keys, vec![ArgKey::from("a.sdf"), ArgKey::from(["b.sdf", "fast"])]);
    }
}
