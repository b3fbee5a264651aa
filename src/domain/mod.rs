//! Domain types for keystone.
//!
//! This module contains the core data structures:
//! - Receipt: Hash-chained audit records
//! - Gate: Deploy gate context and results
//! - ExecutionMode: Strict vs simulated dispatch

pub mod execution;
pub mod gate;
pub mod receipt;

// Re-export commonly used types
pub use execution::ExecutionMode;
pub use gate::{Decision, GateContext, GateOutcome, GateResult, GateStatus};
pub use receipt::{
    CacheStatus, Cost, Receipt, ReceiptParams, ReceiptResult, ResultStatus, Routing,
    GENESIS_HASH, RECEIPT_VERSION, SIGNATURE_PREFIX,
};
