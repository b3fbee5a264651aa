//! Append-only receipt ledger with a SHA-256 hash chain.
//!
//! Receipts are stored as newline-delimited JSON, one file per UTC day
//! (`receipts-YYYY-MM-DD.jsonl`). Each receipt embeds the hash of the one
//! written before it.
//!
//! The chain tip is recovered from the newest log file when the ledger is
//! opened, so a restart continues the existing chain instead of starting a
//! new one from genesis.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::receipt::{content_hash, signature_for, Receipt, ReceiptParams, GENESIS_HASH};

/// Ledger I/O errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access receipt log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize receipt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
}

/// Problems found while verifying a day's log
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainVerificationError {
    #[error("Invalid date '{date}', expected YYYY-MM-DD")]
    InvalidDate { date: String },

    #[error("Log file not found: {path}")]
    LogNotFound { path: String },

    #[error("Failed to read log: {reason}")]
    Unreadable { reason: String },

    #[error("Receipt {index}: Parse error: {reason}")]
    Parse { index: usize, reason: String },

    #[error("Receipt {index}: {reason}")]
    InvalidReceipt { index: usize, reason: String },

    #[error("Receipt {index}: Chain broken, previous_hash {found} does not match {expected}")]
    ChainBroken {
        index: usize,
        expected: String,
        found: String,
    },
}

/// Outcome of verifying one receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptVerification {
    pub valid: bool,
    pub reason: String,
}

/// Outcome of verifying a day's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub date: String,
    pub valid: bool,
    pub receipts_checked: usize,
    pub errors: Vec<ChainVerificationError>,
}

/// Aggregate of a day's receipts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub date: String,
    pub total_receipts: usize,
    pub total_cost_usd: f64,
    /// Receipt count per cost provider
    pub providers: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiptFault {
    MissingHash,
    HashMismatch,
    SignatureInvalid,
}

impl ReceiptFault {
    fn reason(self) -> &'static str {
        match self {
            ReceiptFault::MissingHash => "Receipt has no hash field",
            ReceiptFault::HashMismatch => "Hash mismatch, receipt has been tampered with",
            ReceiptFault::SignatureInvalid => "Signature invalid",
        }
    }
}

fn check_receipt_value(receipt: &Value) -> Result<(), ReceiptFault> {
    let hash = receipt
        .get("hash")
        .and_then(Value::as_str)
        .ok_or(ReceiptFault::MissingHash)?;

    if content_hash(receipt) != hash {
        return Err(ReceiptFault::HashMismatch);
    }

    let signature = receipt.get("signature").and_then(Value::as_str);
    if signature != Some(signature_for(hash).as_str()) {
        return Err(ReceiptFault::SignatureInvalid);
    }

    Ok(())
}

impl From<Result<(), ReceiptFault>> for ReceiptVerification {
    fn from(check: Result<(), ReceiptFault>) -> Self {
        match check {
            Ok(()) => Self {
                valid: true,
                reason: "Receipt integrity verified".to_string(),
            },
            Err(fault) => Self {
                valid: false,
                reason: fault.reason().to_string(),
            },
        }
    }
}

/// Recompute a receipt's hash and signature and compare
pub fn verify_receipt(receipt: &Receipt) -> ReceiptVerification {
    match serde_json::to_value(receipt) {
        Ok(value) => verify_receipt_value(&value),
        Err(e) => ReceiptVerification {
            valid: false,
            reason: format!("Receipt cannot be serialized: {}", e),
        },
    }
}

/// Verify a receipt in its raw JSON form (as read from the log)
pub fn verify_receipt_value(receipt: &Value) -> ReceiptVerification {
    check_receipt_value(receipt).into()
}

/// Mutable chain state owned by one ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerState {
    /// Hash of the most recently written receipt (or the genesis sentinel)
    pub last_hash: String,

    /// Receipts written by this ledger instance
    pub receipts_written: u64,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self::from_tip(GENESIS_HASH)
    }
}

impl LedgerState {
    /// State continuing an existing chain
    pub fn from_tip(last_hash: impl Into<String>) -> Self {
        Self {
            last_hash: last_hash.into(),
            receipts_written: 0,
        }
    }
}

/// File name for a day's log
pub fn log_file_name(date: &str) -> String {
    format!("receipts-{}.jsonl", date)
}

fn io_error(path: &Path, source: io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append one line under an exclusive advisory lock
fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;

    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.flush()?;

    // Lock is released when the file is dropped
    Ok(())
}

/// Hash-chained receipt log rooted at a directory
#[derive(Debug)]
pub struct ReceiptLedger {
    dir: PathBuf,
    state: Mutex<LedgerState>,
}

impl ReceiptLedger {
    /// Open a ledger, creating the directory and recovering the chain tip
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let tip = Self::recover_tip(&dir).await?;
        match &tip {
            Some(hash) => info!(dir = %dir.display(), tip = %hash, "Receipt chain resumed"),
            None => info!(dir = %dir.display(), "Receipt chain starting from genesis"),
        }

        let state = tip.map(LedgerState::from_tip).unwrap_or_default();
        Ok(Self::with_state(dir, state))
    }

    /// Build a ledger with an explicit chain state (no recovery).
    /// The directory is created on first append.
    pub fn with_state(dir: impl Into<PathBuf>, state: LedgerState) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(state),
        }
    }

    /// Directory holding the daily logs
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path to the log for `date` (`YYYY-MM-DD`)
    pub fn log_path(&self, date: &str) -> PathBuf {
        self.dir.join(log_file_name(date))
    }

    /// Current chain tip
    pub async fn tip(&self) -> String {
        self.state.lock().await.last_hash.clone()
    }

    /// Snapshot of the chain state
    pub async fn state(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    /// Find the hash of the last receipt in the newest log file
    async fn recover_tip(dir: &Path) -> Result<Option<String>, LedgerError> {
        let mut logs = Vec::new();
        let mut entries = fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("receipts-") && name.ends_with(".jsonl") {
                    logs.push(entry.path());
                }
            }
        }

        // Date-stamped names sort chronologically
        logs.sort();

        for path in logs.iter().rev() {
            let content = fs::read_to_string(path)
                .await
                .map_err(|e| io_error(path, e))?;

            let tip = content.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line)
                    .ok()?
                    .get("hash")?
                    .as_str()
                    .map(str::to_string)
            });

            if tip.is_some() {
                return Ok(tip);
            }
            warn!(path = %path.display(), "Receipt log holds no readable receipts");
        }

        Ok(None)
    }

    /// Seal a receipt onto the chain and append it to today's log.
    ///
    /// Reading the tip, hashing, appending and advancing the tip happen under
    /// one lock, so concurrent callers never share a `previous_hash`. If the
    /// append fails the tip is left unchanged and the error is returned.
    pub async fn generate_receipt(&self, params: ReceiptParams) -> Result<Receipt, LedgerError> {
        let mut state = self.state.lock().await;

        let receipt = Receipt::seal(params, state.last_hash.clone(), Utc::now())?;
        let line = serde_json::to_string(&receipt)?;
        let path = self.log_path(receipt.date());

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let append_path = path.clone();
        tokio::task::spawn_blocking(move || append_line(&append_path, &line))
            .await
            .map_err(|e| io_error(&path, io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(|e| io_error(&path, e))?;

        state.last_hash = receipt.hash.clone();
        state.receipts_written += 1;

        debug!(receipt_id = %receipt.receipt_id, hash = %receipt.hash, "Receipt appended");
        Ok(receipt)
    }

    /// Read every receipt of a day in file order
    pub async fn read_day(&self, date: &str) -> Result<Vec<Receipt>, LedgerError> {
        check_date(date)?;
        let path = self.log_path(date);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        let mut receipts = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            receipts.push(serde_json::from_str(line)?);
        }
        Ok(receipts)
    }

    /// Verify every receipt of a day and the links between them.
    ///
    /// All problems are collected; the scan never stops at the first one.
    pub async fn verify_chain(&self, date: &str) -> ChainVerification {
        let path = self.log_path(date);
        let mut result = ChainVerification {
            date: date.to_string(),
            valid: false,
            receipts_checked: 0,
            errors: Vec::new(),
        };

        if parse_date(date).is_none() {
            result.errors.push(ChainVerificationError::InvalidDate {
                date: date.to_string(),
            });
            return result;
        }

        if !path.exists() {
            result.errors.push(ChainVerificationError::LogNotFound {
                path: path.display().to_string(),
            });
            return result;
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                result
                    .errors
                    .push(ChainVerificationError::Unreadable { reason: e.to_string() });
                return result;
            }
        };

        let mut prev_hash: Option<String> = None;

        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            result.receipts_checked += 1;

            let receipt: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(e) => {
                    result.errors.push(ChainVerificationError::Parse {
                        index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Err(fault) = check_receipt_value(&receipt) {
                result.errors.push(ChainVerificationError::InvalidReceipt {
                    index,
                    reason: fault.reason().to_string(),
                });
            }

            let previous = receipt
                .get("previous_hash")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(expected) = &prev_hash {
                if previous != expected {
                    result.errors.push(ChainVerificationError::ChainBroken {
                        index,
                        expected: expected.clone(),
                        found: previous.to_string(),
                    });
                }
            }

            prev_hash = receipt
                .get("hash")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        result.valid = result.errors.is_empty();
        if !result.valid {
            warn!(date, errors = result.errors.len(), "Receipt chain verification failed");
        }
        result
    }

    /// Aggregate a day's receipts without re-verifying hashes
    pub async fn summary_for(&self, date: &str) -> Result<LedgerSummary, LedgerError> {
        check_date(date)?;
        let mut summary = LedgerSummary {
            date: date.to_string(),
            total_receipts: 0,
            total_cost_usd: 0.0,
            providers: BTreeMap::new(),
        };

        let path = self.log_path(date);
        if !path.exists() {
            return Ok(summary);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            summary.total_receipts += 1;

            let Ok(receipt) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let cost = receipt.get("cost");
            summary.total_cost_usd += cost
                .and_then(|c| c.get("cost_usd"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let provider = cost
                .and_then(|c| c.get("provider"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            *summary.providers.entry(provider.to_string()).or_insert(0) += 1;
        }

        Ok(summary)
    }

    /// Summary of today's (UTC) log
    pub async fn today_summary(&self) -> Result<LedgerSummary, LedgerError> {
        self.summary_for(&today()).await
    }
}

/// Today's UTC date as `YYYY-MM-DD`
pub fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

/// Validate a `YYYY-MM-DD` string. Only the zero-padded form is accepted,
/// so every valid date maps to exactly one log file.
pub fn parse_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .filter(|d| d.format("%Y-%m-%d").to_string() == date)
}

fn check_date(date: &str) -> Result<(), LedgerError> {
    match parse_date(date) {
        Some(_) => Ok(()),
        None => Err(LedgerError::InvalidDate(date.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::receipt::{Cost, Routing};
    use tempfile::TempDir;

    fn params(intent: &str, cost_usd: f64, provider: &str) -> ReceiptParams {
        ReceiptParams {
            intent: intent.to_string(),
            actor: "test".to_string(),
            routing: Routing {
                task: "deploy-site".to_string(),
                ..Default::default()
            },
            cost: Cost {
                tokens_used: 10,
                cost_usd,
                provider: provider.to_string(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_receipt_links_to_genesis() {
        let temp = TempDir::new().unwrap();
        let ledger = ReceiptLedger::open(temp.path()).await.unwrap();

        let first = ledger.generate_receipt(params("a", 0.0, "p")).await.unwrap();
        let second = ledger.generate_receipt(params("b", 0.0, "p")).await.unwrap();

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(ledger.tip().await, second.hash);
        assert_eq!(ledger.state().await.receipts_written, 2);
    }

    #[tokio::test]
    async fn test_receipts_written_to_daily_file() {
        let temp = TempDir::new().unwrap();
        let ledger = ReceiptLedger::open(temp.path()).await.unwrap();

        let receipt = ledger.generate_receipt(params("a", 0.0, "p")).await.unwrap();
        let path = temp.path().join(format!("receipts-{}.jsonl", receipt.date()));
        assert!(path.exists());

        let stored = ledger.read_day(receipt.date()).await.unwrap();
        assert_eq!(stored, vec![receipt]);
    }

    #[tokio::test]
    async fn test_directory_created_on_first_use() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("receipts");
        let ledger = ReceiptLedger::with_state(&dir, LedgerState::default());

        ledger.generate_receipt(params("a", 0.0, "p")).await.unwrap();
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_verify_receipt_detects_tampering() {
        let temp = TempDir::new().unwrap();
        let ledger = ReceiptLedger::open(temp.path()).await.unwrap();
        let receipt = ledger.generate_receipt(params("a", 0.0, "p")).await.unwrap();

        assert!(verify_receipt(&receipt).valid);

        let mut tampered = receipt.clone();
        tampered.intent = "b".to_string();
        let check = verify_receipt(&tampered);
        assert!(!check.valid);
        assert!(check.reason.contains("Hash mismatch"));

        let mut forged = receipt;
        forged.signature = "ks_sig_0000000000000000".to_string();
        let check = verify_receipt(&forged);
        assert!(!check.valid);
        assert_eq!(check.reason, "Signature invalid");
    }

    #[tokio::test]
    async fn test_verify_missing_log() {
        let temp = TempDir::new().unwrap();
        let ledger = ReceiptLedger::open(temp.path()).await.unwrap();

        let result = ledger.verify_chain("1999-01-01").await;
        assert!(!result.valid);
        assert_eq!(result.receipts_checked, 0);
        assert!(matches!(
            result.errors[0],
            ChainVerificationError::LogNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_summary_aggregates_costs() {
        let temp = TempDir::new().unwrap();
        let ledger = ReceiptLedger::open(temp.path()).await.unwrap();

        ledger.generate_receipt(params("a", 0.25, "alpha")).await.unwrap();
        ledger.generate_receipt(params("b", 0.5, "alpha")).await.unwrap();
        ledger.generate_receipt(params("c", 1.0, "beta")).await.unwrap();

        let summary = ledger.today_summary().await.unwrap();
        assert_eq!(summary.total_receipts, 3);
        assert!((summary.total_cost_usd - 1.75).abs() < 1e-9);
        assert_eq!(summary.providers.get("alpha"), Some(&2));
        assert_eq!(summary.providers.get("beta"), Some(&1));
    }

    #[tokio::test]
    async fn test_summary_of_empty_day() {
        let temp = TempDir::new().unwrap();
        let ledger = ReceiptLedger::open(temp.path()).await.unwrap();

        let summary = ledger.summary_for("1999-01-01").await.unwrap();
        assert_eq!(summary.total_receipts, 0);
        assert!(summary.providers.is_empty());
    }

    #[tokio::test]
    async fn test_append_failure_keeps_tip() {
        let temp = TempDir::new().unwrap();
        // A regular file where the directory should be makes every append fail
        let blocker = temp.path().join("receipts");
        std::fs::write(&blocker, "not a directory").unwrap();

        let ledger = ReceiptLedger::with_state(&blocker, LedgerState::default());
        let result = ledger.generate_receipt(params("a", 0.0, "p")).await;

        assert!(matches!(result, Err(LedgerError::Io { .. })));
        assert_eq!(ledger.tip().await, GENESIS_HASH);
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("2026-10-19").is_some());
        assert!(parse_date("2026-13-01").is_none());
        assert!(parse_date("../etc/passwd").is_none());
        assert!(parse_date("2026-1-9").is_none());
        assert!(parse_date("2026-10-19/..").is_none());
    }
}
