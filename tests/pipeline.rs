//! End-to-end tests for fail-closed dispatch through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use keystone::core::breaker::{BreakerConfig, BreakerRegistry, CircuitState};
use keystone::core::ledger::{verify_receipt, ReceiptLedger};
use keystone::core::{PipelineError, RunOptions, TaskPipeline};
use keystone::domain::{ExecutionMode, ResultStatus, GENESIS_HASH};

async fn pipeline_with_threshold(temp: &TempDir, threshold: u32) -> TaskPipeline {
    let ledger = ReceiptLedger::open(temp.path().join("receipts")).await.unwrap();
    TaskPipeline::new(Arc::new(ledger), "v1").with_breakers(BreakerRegistry::new(BreakerConfig {
        enabled: true,
        failure_threshold: threshold,
        reset_timeout_ms: 60_000,
    }))
}

#[tokio::test]
async fn test_breaker_opens_and_every_call_is_receipted() {
    let temp = TempDir::new().unwrap();
    let pipeline = pipeline_with_threshold(&temp, 3).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    pipeline.register_fn("deploy-site", move |_args: Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(anyhow::anyhow!("edge unreachable"))
        }
    });

    for _ in 0..3 {
        let failure = pipeline
            .run("deploy-site", json!({"site": "a"}), "edge-1", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, PipelineError::HandlerFailed { .. }));
    }
    assert_eq!(pipeline.breaker("edge-1").state(), CircuitState::Open);

    let failure = pipeline
        .run("deploy-site", json!({"site": "a"}), "edge-1", RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::CircuitOpen { ref target } if target == "edge-1"));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "handler must not run while open");

    // Four receipts, in order, each linked to its predecessor
    let last = failure.receipt.unwrap();
    let ledger = pipeline.ledger();
    let receipts = ledger.read_day(last.date()).await.unwrap();
    assert_eq!(receipts.len(), 4);
    assert_eq!(receipts[0].previous_hash, GENESIS_HASH);
    for pair in receipts.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
    }
    for receipt in &receipts {
        assert!(verify_receipt(receipt).valid);
    }

    let statuses: Vec<ResultStatus> = receipts.iter().map(|r| r.result.status).collect();
    assert_eq!(
        statuses,
        vec![
            ResultStatus::Failed,
            ResultStatus::Failed,
            ResultStatus::Failed,
            ResultStatus::Rejected
        ]
    );
    assert_eq!(receipts[3].routing.breaker_state, Some(CircuitState::Open));

    let report = ledger.verify_chain(last.date()).await;
    assert!(report.valid, "{:?}", report.errors);
    assert_eq!(report.receipts_checked, 4);
}

#[tokio::test]
async fn test_unregistered_tasks_never_succeed() {
    let temp = TempDir::new().unwrap();
    let pipeline = pipeline_with_threshold(&temp, 5).await;
    pipeline.register_fn("known", |_args: Value| async move { Ok(json!("ok")) });

    for task in ["unknown", "", "KNOWN", "known "] {
        let failure = pipeline
            .run(task, json!({}), "edge-1", RunOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(failure.error, PipelineError::UnregisteredTask { .. }),
            "task {:?} should be rejected",
            task
        );
        assert_eq!(failure.receipt.unwrap().result.status, ResultStatus::Rejected);
    }

    // Rejected tasks do not count against the target
    assert_eq!(pipeline.breaker("edge-1").status().consecutive_failures, 0);
}

#[tokio::test]
async fn test_simulated_results_are_flagged() {
    let temp = TempDir::new().unwrap();
    let pipeline = pipeline_with_threshold(&temp, 5).await;

    let options = RunOptions {
        mode: Some(ExecutionMode::Simulated),
        ..Default::default()
    };
    let output = pipeline.run("unknown", json!({}), "edge-1", options).await.unwrap();

    assert!(output.simulated);
    assert!(!output.cached);
    assert_eq!(output.receipt.result.status, ResultStatus::Simulated);
    assert!(output.value["message"].as_str().unwrap().starts_with("[SIMULATED]"));
}

#[tokio::test]
async fn test_recovery_after_success_closes_breaker() {
    let temp = TempDir::new().unwrap();
    let pipeline = pipeline_with_threshold(&temp, 2).await;
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let flag = Arc::clone(&healthy);
    pipeline.register_fn("ping", move |_args: Value| {
        let flag = Arc::clone(&flag);
        async move {
            if flag.load(Ordering::SeqCst) {
                Ok(json!("pong"))
            } else {
                Err(anyhow::anyhow!("timeout"))
            }
        }
    });

    let bypass = RunOptions {
        bypass_cache: true,
        ..Default::default()
    };
    for _ in 0..2 {
        pipeline.run("ping", json!({}), "db", bypass.clone()).await.unwrap_err();
    }
    assert_eq!(pipeline.breaker("db").state(), CircuitState::Open);

    // Skip the cooldown and let the probe through
    pipeline.breaker("db").force_state(CircuitState::HalfOpen);
    healthy.store(true, Ordering::SeqCst);

    let output = pipeline.run("ping", json!({}), "db", bypass).await.unwrap();
    assert_eq!(output.value, json!("pong"));
    assert_eq!(output.receipt.routing.breaker_state, Some(CircuitState::HalfOpen));

    let status = pipeline.breaker("db").status();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn test_chain_continues_across_pipeline_restart() {
    let temp = TempDir::new().unwrap();

    let first_hash = {
        let pipeline = pipeline_with_threshold(&temp, 5).await;
        pipeline.register_fn("build", |_args: Value| async move { Ok(json!(1)) });
        let output = pipeline
            .run("build", json!({}), "edge-1", RunOptions::default())
            .await
            .unwrap();
        output.receipt.hash
    };

    let pipeline = pipeline_with_threshold(&temp, 5).await;
    pipeline.register_fn("build", |_args: Value| async move { Ok(json!(1)) });
    let output = pipeline
        .run("build", json!({}), "edge-1", RunOptions::default())
        .await
        .unwrap();

    // The cache does not survive a restart, the chain does
    assert!(!output.cached);
    assert_eq!(output.receipt.previous_hash, first_hash);
    assert!(pipeline.ledger().verify_chain(output.receipt.date()).await.valid);
}

#[tokio::test]
async fn test_cache_hit_keeps_half_open_slot_for_real_call() {
    let temp = TempDir::new().unwrap();
    let ledger = ReceiptLedger::open(temp.path().join("receipts")).await.unwrap();
    let pipeline = TaskPipeline::new(Arc::new(ledger), "v1").with_breakers(BreakerRegistry::new(
        BreakerConfig {
            enabled: true,
            failure_threshold: 1,
            reset_timeout_ms: 200,
        },
    ));
    pipeline.register_fn("fetch", |args: Value| async move {
        if args["fail"] == json!(true) {
            Err(anyhow::anyhow!("upstream 503"))
        } else {
            Ok(json!({ "page": args["page"] }))
        }
    });

    pipeline
        .run("fetch", json!({"page": 1}), "api", RunOptions::default())
        .await
        .unwrap();
    pipeline
        .run("fetch", json!({"fail": true}), "api", RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(pipeline.breaker("api").state(), CircuitState::Open);

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let hit = pipeline
        .run("fetch", json!({"page": 1}), "api", RunOptions::default())
        .await
        .unwrap();
    assert!(hit.cached);

    // The half-open trial call goes to the first uncached request
    let fresh = pipeline
        .run("fetch", json!({"page": 2}), "api", RunOptions::default())
        .await
        .unwrap();
    assert!(!fresh.cached);
    assert_eq!(fresh.value, json!({"page": 2}));
    assert_eq!(pipeline.breaker("api").state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_non_finite_cost_keeps_day_readable() {
    let temp = TempDir::new().unwrap();
    let pipeline = pipeline_with_threshold(&temp, 5).await;
    pipeline.register_fn("build", |_args: Value| async move { Ok(json!("ok")) });

    let options = RunOptions {
        cost: Some(keystone::domain::Cost {
            tokens_used: 1,
            cost_usd: f64::NAN,
            provider: "metered".to_string(),
        }),
        ..Default::default()
    };
    let output = pipeline.run("build", json!({}), "edge-1", options).await.unwrap();
    assert_eq!(output.receipt.cost.cost_usd, 0.0);

    let date = output.receipt.date();
    assert_eq!(pipeline.ledger().read_day(date).await.unwrap().len(), 1);
    assert!(pipeline.ledger().verify_chain(date).await.valid);
}
