//! Core execution logic.
//!
//! This module contains:
//! - Breaker: Per-target circuit breakers
//! - Cache: Deterministic cache keys and the TTL result cache
//! - Ledger: Hash-chained receipt log
//! - Gates: All-or-nothing deploy gate evaluation
//! - Pipeline: Fail-closed task dispatch

pub mod breaker;
pub mod cache;
pub mod gates;
pub mod hashing;
pub mod ledger;
pub mod pipeline;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitState};
pub use cache::{build_cache_key, CacheConfig, CacheStats, ResultCache};
pub use gates::{standard_gates, DeployGateEvaluator, Gate, GatePredicate, GatesConfig};
pub use hashing::{canonical_json, hash_canonical_json, sha256_hex};
pub use ledger::{
    verify_receipt, verify_receipt_value, ChainVerification, ChainVerificationError, LedgerError,
    LedgerState, LedgerSummary, ReceiptLedger, ReceiptVerification,
};
pub use pipeline::{PipelineError, PipelineSummary, RunFailure, RunOptions, RunOutput, TaskPipeline};
