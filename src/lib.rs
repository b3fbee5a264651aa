//! keystone - Fail-closed task pipeline with hash-chained receipts
//!
//! A small trust-and-execution core: a task dispatcher that never reports
//! success for work it does not recognize, per-target circuit breakers, an
//! all-or-nothing deploy gate evaluator, and a SHA-256 hash-chained receipt
//! for every dispatched action.
//!
//! # Architecture
//!
//! - A caller asks `TaskPipeline` to run task `T` with args `A` against target `X`
//! - `CircuitBreaker[X]` rejects the call outright while open
//! - Results are cached under a key derived from `(T, A, code_version)`
//! - Every outcome (cached, failed, rejected) is sealed into a receipt that
//!   links to the previous receipt's hash
//! - `DeployGateEvaluator` allows a release only if every gate passes
//!
//! # Modules
//!
//! - `core`: Breakers, cache, ledger, gates and the pipeline
//! - `domain`: Data structures (Receipt, GateContext, ExecutionMode)
//! - `handlers`: Task handler trait and the subprocess handler
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a configured task
//! keystone run build --target edge-1 --args '{"site": "docs"}'
//!
//! # Verify today's receipt chain
//! keystone verify
//!
//! # Gate a deploy (exit status 2 on DENY)
//! keystone gate --context ci-context.json
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod handlers;

// Re-export main types at crate root for convenience
pub use core::{
    CircuitBreaker, CircuitState, DeployGateEvaluator, PipelineError, ReceiptLedger, RunFailure,
    RunOptions, RunOutput, TaskPipeline,
};
pub use domain::{Decision, ExecutionMode, GateContext, GateResult, Receipt};
pub use handlers::{CommandHandler, TaskHandler};
