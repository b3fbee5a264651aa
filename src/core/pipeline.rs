//! Fail-closed task dispatch.
//!
//! `TaskPipeline::run` resolves a handler, consults the target's circuit
//! breaker, checks the result cache, invokes the handler and records a
//! receipt for every outcome. A task with no registered handler never
//! reports success: it fails with `UnregisteredTask` unless the pipeline (or
//! the call) runs in `ExecutionMode::Simulated`, in which case the result is
//! explicitly flagged as simulated.
//!
//! Concurrent runs with the same cache key are not coalesced; each one
//! follows the full path and writes its own receipt.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ResolvedConfig;
use crate::domain::{
    CacheStatus, Cost, ExecutionMode, Receipt, ReceiptParams, ReceiptResult, ResultStatus,
    Routing,
};
use crate::handlers::{CommandHandler, FnHandler, TaskHandler};

use super::breaker::{BreakerConfig, BreakerRegistry, BreakerStatus, CircuitBreaker};
use super::cache::{build_cache_key, CacheConfig, CacheStats, ResultCache};
use super::ledger::{LedgerError, ReceiptLedger};

/// Dispatch errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Task '{task}' has no registered handler")]
    UnregisteredTask { task: String },

    #[error("Circuit breaker for target '{target}' is open")]
    CircuitOpen { target: String },

    #[error("Handler for task '{task}' failed: {source}")]
    HandlerFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to record receipt: {0}")]
    Ledger(#[from] LedgerError),
}

impl PipelineError {
    /// Stable identifier recorded on receipts
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnregisteredTask { .. } => "unregistered_task",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::HandlerFailed { .. } => "handler_failed",
            PipelineError::Ledger(_) => "ledger_error",
        }
    }
}

/// A failed run, with the receipt describing it when one could be written
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: PipelineError,
    pub receipt: Option<Box<Receipt>>,
}

/// A successful run
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub value: Value,

    /// Served from the result cache without invoking the handler
    pub cached: bool,

    /// No handler ran; the value is a simulation placeholder
    pub simulated: bool,

    pub receipt: Receipt,
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Initiator recorded on the receipt (default: "pipeline")
    pub actor: Option<String>,

    /// Human-readable intent (default derived from task and target)
    pub intent: Option<String>,

    /// Override the pipeline's execution mode for this call
    pub mode: Option<ExecutionMode>,

    /// Skip the cache lookup (the fresh result is still stored)
    pub bypass_cache: bool,

    /// Cost to record when the handler reports none
    pub cost: Option<Cost>,
}

/// Read-only snapshot for health endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub code_version: String,
    pub mode: ExecutionMode,
    pub tasks: Vec<String>,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub cache: CacheStats,
}

/// Task dispatcher guarded by per-target breakers
pub struct TaskPipeline {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    breakers: BreakerRegistry,
    cache: ResultCache,
    ledger: Arc<ReceiptLedger>,
    code_version: String,
    mode: ExecutionMode,
}

impl TaskPipeline {
    /// Create a strict pipeline with default breaker and cache settings
    pub fn new(ledger: Arc<ReceiptLedger>, code_version: impl Into<String>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            cache: ResultCache::new(CacheConfig::default()),
            ledger,
            code_version: code_version.into(),
            mode: ExecutionMode::Strict,
        }
    }

    /// Build a pipeline from resolved configuration, registering a
    /// `CommandHandler` for every configured task
    pub fn from_config(ledger: Arc<ReceiptLedger>, config: &ResolvedConfig) -> Self {
        let pipeline = Self::new(ledger, config.code_version.clone())
            .with_mode(config.mode)
            .with_breakers(config.breaker_registry())
            .with_cache(config.cache.clone());

        for (name, task) in &config.tasks {
            let handler = CommandHandler::new(name.clone(), task.command.clone())
                .with_args(task.args.clone())
                .with_timeout(Duration::from_secs(task.timeout_seconds));
            pipeline.register_handler(name.clone(), handler);
        }

        pipeline
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_breakers(mut self, breakers: BreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = ResultCache::new(config);
        self
    }

    /// Register (or replace) the handler for a task name
    pub fn register_handler(&self, task: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task = task.into();
        info!(%task, handler = handler.name(), "Handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task, Arc::new(handler));
    }

    /// Register an async closure as the handler for a task name
    pub fn register_fn<F, Fut>(&self, task: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task = task.into();
        let handler = FnHandler::new(task.clone(), f);
        self.register_handler(task, handler);
    }

    /// Whether a handler is registered for `task`
    pub fn is_registered(&self, task: &str) -> bool {
        self.handler(task).is_some()
    }

    fn handler(&self, task: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task)
            .cloned()
    }

    /// Breaker guarding `target`
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(target)
    }

    /// Receipt ledger this pipeline writes to
    pub fn ledger(&self) -> &Arc<ReceiptLedger> {
        &self.ledger
    }

    /// Code version baked into cache keys
    pub fn code_version(&self) -> &str {
        &self.code_version
    }

    /// Run a task against a target
    #[instrument(skip(self, args, options), fields(code_version = %self.code_version))]
    pub async fn run(
        &self,
        task: &str,
        args: Value,
        target: &str,
        options: RunOptions,
    ) -> Result<RunOutput, RunFailure> {
        let mode = options.mode.unwrap_or(self.mode);
        let mut record = RunRecord::new(task, target, mode, &options);

        // 1. Resolve the handler; unknown tasks never succeed silently
        let Some(handler) = self.handler(task) else {
            return match mode {
                ExecutionMode::Strict => {
                    warn!(%task, "Rejected unregistered task");
                    let error = PipelineError::UnregisteredTask {
                        task: task.to_string(),
                    };
                    self.fail(record, ResultStatus::Rejected, error).await
                }
                ExecutionMode::Simulated => {
                    warn!(%task, "No handler registered, returning simulated result");
                    record.tools.push("simulate".to_string());
                    let value = json!({
                        "simulated": true,
                        "task": task,
                        "target": target,
                        "message": format!("[SIMULATED] no handler registered for task '{}'", task),
                    });
                    let result = ReceiptResult {
                        status: ResultStatus::Simulated,
                        error_kind: None,
                        detail: Some("no handler registered".to_string()),
                    };
                    self.succeed(record, result, value, false, true).await
                }
            };
        };
        record.routing.handler = Some(handler.name().to_string());

        // 2. Circuit breaker (read-only; a cache hit must not use up the probe)
        let breaker = self.breakers.get(target);
        record.tools.push(format!("breaker:{}", target));
        record.routing.breaker_state = Some(breaker.state());
        if breaker.is_blocked() {
            return self.reject_open(record, task, target).await;
        }

        // 3. Cache
        let key = build_cache_key(task, &args, &self.code_version);
        if !options.bypass_cache {
            if let Some(value) = self.cache.get(&key) {
                debug!(%task, %key, "Cache hit");
                record.routing.cache = CacheStatus::Hit;
                record.tools.push("cache:hit".to_string());
                let result = ReceiptResult::completed("served from cache");
                return self.succeed(record, result, value, true, false).await;
            }
            record.routing.cache = CacheStatus::Miss;
            record.tools.push("cache:miss".to_string());
        }

        // Admission for the real call; may take the half-open probe
        let allowed = breaker.can_execute();
        record.routing.breaker_state = Some(breaker.state());
        if !allowed {
            return self.reject_open(record, task, target).await;
        }

        // 4. Handler
        record.tools.push(format!("handler:{}", handler.name()));
        let started = Instant::now();
        let outcome = handler.execute(&args).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                breaker.record_success();
                record.tools.extend(output.tools);
                if let Some(cost) = output.cost {
                    record.cost = cost;
                }
                info!(%task, %target, duration_ms, "Task completed");

                let result = ReceiptResult::completed(format!("completed in {}ms", duration_ms));
                let done = self.succeed(record, result, output.value, false, false).await?;
                self.cache.insert(key, done.value.clone());
                Ok(done)
            }
            Err(source) => {
                breaker.record_failure();
                error!(%task, %target, duration_ms, error = %source, "Task failed");
                let error = PipelineError::HandlerFailed {
                    task: task.to_string(),
                    source,
                };
                self.fail(record, ResultStatus::Failed, error).await
            }
        }
    }

    async fn reject_open<T>(
        &self,
        record: RunRecord,
        task: &str,
        target: &str,
    ) -> Result<T, RunFailure> {
        warn!(%task, %target, "Circuit open, call rejected");
        let error = PipelineError::CircuitOpen {
            target: target.to_string(),
        };
        self.fail(record, ResultStatus::Rejected, error).await
    }

    /// Seal a receipt for a successful run. If the receipt cannot be written
    /// the run is reported as failed.
    async fn succeed(
        &self,
        record: RunRecord,
        result: ReceiptResult,
        value: Value,
        cached: bool,
        simulated: bool,
    ) -> Result<RunOutput, RunFailure> {
        match self.ledger.generate_receipt(record.into_params(result)).await {
            Ok(receipt) => Ok(RunOutput {
                value,
                cached,
                simulated,
                receipt,
            }),
            Err(e) => {
                error!(error = %e, "Failed to record receipt, reporting run as failed");
                Err(RunFailure {
                    error: PipelineError::Ledger(e),
                    receipt: None,
                })
            }
        }
    }

    /// Seal a receipt for a failed run and return the failure
    async fn fail<T>(
        &self,
        record: RunRecord,
        status: ResultStatus,
        error: PipelineError,
    ) -> Result<T, RunFailure> {
        let result = ReceiptResult::failure(status, error.kind(), error.to_string());

        let receipt = match self.ledger.generate_receipt(record.into_params(result)).await {
            Ok(receipt) => Some(Box::new(receipt)),
            Err(e) => {
                error!(error = %e, "Failed to record receipt for failed run");
                None
            }
        };

        Err(RunFailure { error, receipt })
    }

    /// Snapshot of registered tasks, breakers and cache counters
    pub fn config_summary(&self) -> PipelineSummary {
        let mut tasks: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tasks.sort();

        PipelineSummary {
            code_version: self.code_version.clone(),
            mode: self.mode,
            tasks,
            breakers: self.breakers.statuses(),
            cache: self.cache.stats(),
        }
    }
}

/// Receipt content accumulated while a run progresses
struct RunRecord {
    intent: String,
    actor: String,
    routing: Routing,
    tools: Vec<String>,
    cost: Cost,
}

impl RunRecord {
    fn new(task: &str, target: &str, mode: ExecutionMode, options: &RunOptions) -> Self {
        Self {
            intent: options
                .intent
                .clone()
                .unwrap_or_else(|| format!("run task '{}' against '{}'", task, target)),
            actor: options.actor.clone().unwrap_or_else(|| "pipeline".to_string()),
            routing: Routing {
                task: task.to_string(),
                target: Some(target.to_string()),
                handler: None,
                cache: CacheStatus::Bypass,
                breaker_state: None,
                mode,
            },
            tools: vec![format!("dispatch:{}", task)],
            cost: options.cost.clone().unwrap_or_default(),
        }
    }

    fn into_params(self, result: ReceiptResult) -> ReceiptParams {
        ReceiptParams {
            intent: self.intent,
            actor: self.actor,
            routing: self.routing,
            tools_executed: self.tools,
            cost: self.cost,
            result,
        }
    }
}
