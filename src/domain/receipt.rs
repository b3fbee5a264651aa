//! Receipts: immutable, hash-chained records of pipeline executions.
//!
//! A receipt's `hash` is the SHA-256 of the canonical JSON of every other
//! field (everything except `hash` and `signature`). The `signature` is the
//! hash's first 16 hex characters behind a fixed prefix: a tamper indicator
//! bound to the hash, not a cryptographic signature.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::execution::ExecutionMode;
use crate::core::breaker::CircuitState;
use crate::core::hashing::hash_canonical_json;

/// Schema version stamped on every receipt
pub const RECEIPT_VERSION: &str = "1.0.0";

/// `previous_hash` of the first receipt in a fresh chain
pub const GENESIS_HASH: &str =
    "GENESIS_0000000000000000000000000000000000000000000000000000000000000000";

/// Prefix of the derived signature
pub const SIGNATURE_PREFIX: &str = "ks_sig_";

/// Hash characters carried in the signature
const SIGNATURE_HASH_CHARS: usize = 16;

/// Whether the cache answered the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Cache not consulted (rejected before lookup, or bypassed)
    #[default]
    Bypass,
}

/// Where and how a task was executed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    /// Task name as requested
    pub task: String,

    /// Downstream target the task ran against
    pub target: Option<String>,

    /// Name of the handler that served the task
    pub handler: Option<String>,

    pub cache: CacheStatus,

    /// Breaker state observed at dispatch
    pub breaker_state: Option<CircuitState>,

    pub mode: ExecutionMode,
}

/// Usage accounting. Non-finite `cost_usd` is zeroed when sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    #[serde(default)]
    pub tokens_used: u64,

    #[serde(default)]
    pub cost_usd: f64,

    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "unknown".to_string()
}

impl Cost {
    /// NaN and infinities have no JSON form; they are recorded as zero
    fn finite(mut self) -> Self {
        if !self.cost_usd.is_finite() {
            warn!(cost_usd = %self.cost_usd, provider = %self.provider, "Non-finite cost recorded as 0");
            self.cost_usd = 0.0;
        }
        self
    }
}

impl Default for Cost {
    fn default() -> Self {
        Self {
            tokens_used: 0,
            cost_usd: 0.0,
            provider: default_provider(),
        }
    }
}

/// Final status recorded on a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    #[default]
    Completed,
    Failed,
    /// Refused before the handler ran (unregistered task, open circuit)
    Rejected,
    /// No handler ran; the result was fabricated in simulation mode
    Simulated,
}

/// Outcome summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptResult {
    pub status: ResultStatus,

    /// Machine-readable failure kind (e.g. "circuit_open")
    pub error_kind: Option<String>,

    /// Human-readable detail (NO secrets)
    pub detail: Option<String>,
}

impl ReceiptResult {
    pub fn completed(detail: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Completed,
            error_kind: None,
            detail: Some(detail.into()),
        }
    }

    pub fn failure(status: ResultStatus, kind: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            error_kind: Some(kind.to_string()),
            detail: Some(detail.into()),
        }
    }
}

/// Caller-supplied content of a new receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptParams {
    pub intent: String,
    pub actor: String,
    pub routing: Routing,
    pub tools_executed: Vec<String>,
    pub cost: Cost,
    pub result: ReceiptResult,
}

impl Default for ReceiptParams {
    fn default() -> Self {
        Self {
            intent: "unknown".to_string(),
            actor: "system".to_string(),
            routing: Routing::default(),
            tools_executed: Vec::new(),
            cost: Cost::default(),
            result: ReceiptResult::default(),
        }
    }
}

/// A sealed receipt as written to the daily log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: String,
    pub version: String,

    /// Creation time, ISO 8601 with millisecond precision
    pub timestamp: String,

    pub intent: String,
    pub actor: String,
    pub routing: Routing,
    pub tools_executed: Vec<String>,
    pub cost: Cost,
    pub result: ReceiptResult,
    pub previous_hash: String,
    pub hash: String,
    pub signature: String,
}

impl Receipt {
    /// Build and seal a receipt linked to `previous_hash`
    pub fn seal(
        params: ReceiptParams,
        previous_hash: String,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let simple = Uuid::new_v4().simple().to_string();
        let mut receipt = Self {
            receipt_id: format!("rcpt_{}_{}", now.timestamp_millis(), &simple[..8]),
            version: RECEIPT_VERSION.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            intent: params.intent,
            actor: params.actor,
            routing: params.routing,
            tools_executed: params.tools_executed,
            cost: params.cost.finite(),
            result: params.result,
            previous_hash,
            hash: String::new(),
            signature: String::new(),
        };

        let hash = content_hash(&serde_json::to_value(&receipt)?);
        receipt.signature = signature_for(&hash);
        receipt.hash = hash;
        Ok(receipt)
    }

    /// UTC calendar date of the receipt, `YYYY-MM-DD`
    pub fn date(&self) -> &str {
        self.timestamp.get(..10).unwrap_or(&self.timestamp)
    }
}

/// Hash over every field except `hash` and `signature`
pub fn content_hash(receipt: &Value) -> String {
    let mut body = receipt.clone();
    if let Some(map) = body.as_object_mut() {
        map.remove("hash");
        map.remove("signature");
    }
    hash_canonical_json(&body)
}

/// Signature derived from a content hash
pub fn signature_for(hash: &str) -> String {
    let prefix = hash.get(..SIGNATURE_HASH_CHARS).unwrap_or(hash);
    format!("{}{}", SIGNATURE_PREFIX, prefix)
}
