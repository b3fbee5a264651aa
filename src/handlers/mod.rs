//! Task handler interface.
//!
//! Handlers are the pluggable capabilities the pipeline dispatches to. The
//! pipeline never inspects argument schemas; validating `args` is the
//! handler's (or the caller's) job.

pub mod command;

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::domain::Cost;

pub use command::CommandHandler;

/// Output from a handler execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Result value returned to the caller and cached
    pub value: Value,

    /// Usage accounting reported by the handler (if any)
    pub cost: Option<Cost>,

    /// Sub-actions performed, appended to the receipt in order
    pub tools: Vec<String>,
}

impl HandlerOutput {
    /// Output with just a value
    pub fn new(value: Value) -> Self {
        Self {
            value,
            cost: None,
            tools: Vec::new(),
        }
    }

    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }
}

/// A capability that executes a named task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Human-readable handler name (recorded in receipts)
    fn name(&self) -> &str;

    /// Execute the task. An `Err` counts as a failure against the target's breaker.
    async fn execute(&self, args: &Value) -> Result<HandlerOutput>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, args: &Value) -> Result<HandlerOutput> {
        let value = (self.f)(args.clone()).await?;
        Ok(HandlerOutput::new(value))
    }
}
