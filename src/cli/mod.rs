//! Command-line interface for keystone.
//!
//! Provides commands for running tasks through the pipeline, verifying and
//! summarizing the receipt ledger, evaluating deploy gates, and inspecting
//! configuration.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::{self, ResolvedConfig};
use crate::core::ledger::{parse_date, today};
use crate::core::{DeployGateEvaluator, ReceiptLedger, RunOptions, TaskPipeline};
use crate::domain::{Decision, ExecutionMode, GateContext};

/// Exit status for a denied deploy
const EXIT_DENIED: i32 = 2;

/// keystone - Fail-closed task pipeline with hash-chained receipts
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a configured task against a target
    Run {
        /// Task name (declared under `tasks:` in .keystone/config.yaml)
        task: String,

        /// Target the task runs against (selects the circuit breaker)
        #[arg(short, long, default_value = "local")]
        target: String,

        /// Task arguments as JSON
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Actor recorded on the receipt
        #[arg(long)]
        actor: Option<String>,

        /// Intent recorded on the receipt
        #[arg(long)]
        intent: Option<String>,

        /// Skip the result cache
        #[arg(long)]
        no_cache: bool,

        /// Return a flagged simulated result for unregistered tasks
        #[arg(long)]
        simulate: bool,
    },

    /// Verify the receipt chain for a day
    Verify {
        /// Day to verify (YYYY-MM-DD, default: today UTC)
        #[arg(short, long)]
        date: Option<String>,

        /// Print the verification report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize receipts for a day
    Summary {
        /// Day to summarize (YYYY-MM-DD, default: today UTC)
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Evaluate deploy gates (exit status 2 on DENY)
    Gate {
        /// Context file (JSON or YAML); reads stdin if not provided
        #[arg(short, long)]
        context: Option<PathBuf>,
    },

    /// Show ledger tip, configured tasks and breaker state
    Status,

    /// Print the resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                task,
                target,
                args,
                actor,
                intent,
                no_cache,
                simulate,
            } => {
                let options = RunOptions {
                    actor,
                    intent,
                    mode: simulate.then_some(ExecutionMode::Simulated),
                    bypass_cache: no_cache,
                    cost: None,
                };
                run_task(&task, &target, &args, options).await
            }
            Commands::Verify { date, json } => verify(date, json).await,
            Commands::Summary { date } => summary(date).await,
            Commands::Gate { context } => gate(context).await,
            Commands::Status => status().await,
            Commands::Config => show_config(),
        }
    }
}

/// Open the ledger at the configured receipts directory
async fn open_ledger(cfg: &ResolvedConfig) -> Result<ReceiptLedger> {
    ReceiptLedger::open(cfg.receipts_dir.clone())
        .await
        .with_context(|| format!("Failed to open receipt ledger: {}", cfg.receipts_dir.display()))
}

/// Requested day, or today (UTC) when none was given
fn resolve_date(date: Option<String>) -> Result<String> {
    let date = date.unwrap_or_else(today);
    if parse_date(&date).is_none() {
        anyhow::bail!("Invalid date '{}', expected YYYY-MM-DD", date);
    }
    Ok(date)
}

/// Run a single task and print its result
async fn run_task(task: &str, target: &str, args: &str, options: RunOptions) -> Result<()> {
    let cfg = config::config()?;
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;

    let ledger = open_ledger(cfg).await?;
    let pipeline = TaskPipeline::from_config(Arc::new(ledger), cfg);

    match pipeline.run(task, args, target, options).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output.value)?);
            let note = if output.simulated {
                " (simulated)"
            } else if output.cached {
                " (cached)"
            } else {
                ""
            };
            eprintln!("\n[Task {} completed{}, receipt {}]", task, note, output.receipt.receipt_id);
            Ok(())
        }
        Err(failure) => {
            match &failure.receipt {
                Some(receipt) => eprintln!(
                    "\n[Task {} failed: {}, receipt {}]",
                    task, failure.error, receipt.receipt_id
                ),
                None => eprintln!("\n[Task {} failed: {}, no receipt recorded]", task, failure.error),
            }
            std::process::exit(1);
        }
    }
}

/// Verify one day of receipts
async fn verify(date: Option<String>, as_json: bool) -> Result<()> {
    let date = resolve_date(date)?;
    let cfg = config::config()?;
    let ledger = open_ledger(cfg).await?;

    let report = ledger.verify_chain(&date).await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Date:     {}", report.date);
        println!("Receipts: {}", report.receipts_checked);
        println!("Valid:    {}", report.valid);
        for error in &report.errors {
            println!("  - {}", error);
        }
    }

    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

/// Print cost and provider totals for one day
async fn summary(date: Option<String>) -> Result<()> {
    let date = resolve_date(date)?;
    let cfg = config::config()?;
    let ledger = open_ledger(cfg).await?;

    let summary = ledger.summary_for(&date).await?;

    println!("Date:       {}", summary.date);
    println!("Receipts:   {}", summary.total_receipts);
    println!("Total cost: ${:.6}", summary.total_cost_usd);
    if !summary.providers.is_empty() {
        println!();
        println!("{:<24} {:>8}", "PROVIDER", "RECEIPTS");
        println!("{}", "-".repeat(33));
        for (provider, count) in &summary.providers {
            println!("{:<24} {:>8}", provider, count);
        }
    }

    Ok(())
}

/// Read a gate context from a file or stdin
fn read_context(path: Option<PathBuf>) -> Result<GateContext> {
    let raw = if let Some(path) = path {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No gate context provided. Use --context <file> or pipe to stdin");
    };

    // YAML is a superset of JSON
    serde_yaml::from_str(&raw).context("Failed to parse gate context")
}

/// Evaluate deploy gates against a context snapshot
async fn gate(context_path: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;
    let mut context = read_context(context_path)?;

    // Fill in the receipt chain outcome when tooling did not supply it
    if context.ledger_verified.is_none() {
        let ledger = open_ledger(cfg).await?;
        let report = ledger.verify_chain(&today()).await;
        context.ledger_verified = Some(report.valid);
    }

    let evaluator = DeployGateEvaluator::new(cfg.gates.clone());
    let result = evaluator.evaluate(context);

    for outcome in &result.gates {
        let mark = if outcome.passed { "PASS" } else { "FAIL" };
        match &outcome.fail_msg {
            Some(msg) => println!("  [{}] {:<28} {}", mark, outcome.name, msg),
            None => println!("  [{}] {}", mark, outcome.name),
        }
    }
    println!();
    println!("Decision: {}", result.decision);

    if result.decision == Decision::Deny {
        std::process::exit(EXIT_DENIED);
    }
    Ok(())
}

/// Show ledger and pipeline state
async fn status() -> Result<()> {
    let cfg = config::config()?;
    let ledger = Arc::new(open_ledger(cfg).await?);
    let state = ledger.state().await;
    let today_summary = ledger.today_summary().await?;

    let pipeline = TaskPipeline::from_config(Arc::clone(&ledger), cfg);
    let summary = pipeline.config_summary();

    println!("Ledger:");
    println!("  Directory:      {}", ledger.dir().display());
    println!("  Chain tip:      {}", state.last_hash);
    println!("  Receipts today: {}", today_summary.total_receipts);
    println!();
    println!("Pipeline:");
    println!("  Code version:   {}", summary.code_version);
    println!("  Mode:           {}", summary.mode);
    println!("  Cache entries:  {} (max {})", summary.cache.entries, summary.cache.max_entries);
    println!();

    if summary.tasks.is_empty() {
        println!("No tasks configured. Declare them under `tasks:` in .keystone/config.yaml");
    } else {
        println!("Tasks: {}", summary.tasks.join(", "));
    }

    if !summary.breakers.is_empty() {
        println!();
        println!("{:<24} {:<10} {:>10}", "TARGET", "STATE", "FAILURES");
        println!("{}", "-".repeat(46));
        for (target, breaker) in &summary.breakers {
            println!(
                "{:<24} {:<10} {:>10}",
                target,
                breaker.state.to_string(),
                breaker.consecutive_failures
            );
        }
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Receipts: {}", cfg.receipts_dir.display());
    println!();
    println!("Execution:");
    println!("  Mode:         {}", cfg.mode);
    println!("  Code version: {}", cfg.code_version);
    println!();
    println!("Circuit breaker:");
    println!("  Enabled:           {}", cfg.breaker.enabled);
    println!("  Failure threshold: {}", cfg.breaker.failure_threshold);
    println!("  Reset timeout:     {}ms", cfg.breaker.reset_timeout_ms);
    for (target, b) in &cfg.breaker_targets {
        println!(
            "  {}: enabled={} threshold={} reset={}ms",
            target, b.enabled, b.failure_threshold, b.reset_timeout_ms
        );
    }
    println!();
    println!("Cache:");
    match cfg.cache.ttl_seconds {
        Some(ttl) => println!("  TTL:         {}s", ttl),
        None => println!("  TTL:         (none)"),
    }
    println!("  Max entries: {}", cfg.cache.max_entries);
    println!();
    println!("Gates:");
    println!("  Allowed risk grades: {}", cfg.gates.allowed_grades.join(", "));
    println!("  History:             {}", cfg.gates.max_history);
    println!();
    println!("Tasks:");
    if cfg.tasks.is_empty() {
        println!("  (none)");
    } else {
        for (name, task) in &cfg.tasks {
            println!(
                "  {}: {} {} (timeout {}s)",
                name,
                task.command,
                task.args.join(" "),
                task.timeout_seconds
            );
        }
    }

    Ok(())
}
