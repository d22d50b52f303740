//! End-to-end scheduler scenarios exercised against a real SQLite file,
//! a fake Stream Client, a fake Epoch Oracle, and a fake Settlement
//! Executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use stream_agency_client::{EpochOracle, StreamClient, StreamResponse};
use stream_agency_config::RuntimeConfig;
use stream_agency_core::Scheduler;
use stream_agency_schemas::{now_ms, AgencyError};
use stream_agency_settlement::{SettlementExecutor, SettlementOutcome};

struct FakeStreamClient {
    queued: Mutex<VecDeque<StreamResponse>>,
}

impl FakeStreamClient {
    fn new(responses: Vec<StreamResponse>) -> Self {
        Self {
            queued: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl StreamClient for FakeStreamClient {
    async fn post_stream(&self, _address: &str, _signature: &str) -> StreamResponse {
        self.queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StreamResponse {
                ok: false,
                status: 0,
                body: "no queued response".to_string(),
                parsed: None,
            })
    }
}

fn success(end_stream_ms: i64) -> StreamResponse {
    StreamResponse {
        ok: true,
        status: 200,
        body: format!("{{\"end_stream\": {end_stream_ms}}}"),
        parsed: Some(serde_json::json!({ "end_stream": end_stream_ms })),
    }
}

fn already_streaming(end_stream_ms: i64) -> StreamResponse {
    StreamResponse {
        ok: false,
        status: 403,
        body: "Agent is already streaming".to_string(),
        parsed: Some(serde_json::json!({ "end_stream": end_stream_ms })),
    }
}

fn transport_failure() -> StreamResponse {
    StreamResponse {
        ok: false,
        status: 0,
        body: "URLError: timed out".to_string(),
        parsed: None,
    }
}

struct FakeEpochOracle {
    epoch: Mutex<Result<i64, String>>,
}

impl FakeEpochOracle {
    fn ok(epoch: i64) -> Self {
        Self {
            epoch: Mutex::new(Ok(epoch)),
        }
    }

    fn err(msg: &str) -> Self {
        Self {
            epoch: Mutex::new(Err(msg.to_string())),
        }
    }
}

#[async_trait]
impl EpochOracle for FakeEpochOracle {
    async fn get_epoch(&self) -> Result<i64, AgencyError> {
        self.epoch
            .lock()
            .unwrap()
            .clone()
            .map_err(AgencyError::EpochUnavailable)
    }
}

struct FakeSettlementExecutor {
    outcomes: Mutex<VecDeque<SettlementOutcome>>,
}

impl FakeSettlementExecutor {
    fn new(outcomes: Vec<SettlementOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

impl SettlementExecutor for FakeSettlementExecutor {
    fn bill(&self, _agent_address: &str, _epoch: i64, _windows: i64) -> SettlementOutcome {
        self.outcomes.lock().unwrap().pop_front().unwrap_or(SettlementOutcome {
            ok: false,
            return_code: -1,
            stdout: String::new(),
            stderr: "no queued outcome".to_string(),
        })
    }
}

async fn fresh_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agency.db");
    let pool = stream_agency_db::connect(path.to_str().unwrap()).await.unwrap();
    stream_agency_db::migrate(&pool).await.unwrap();
    (pool, dir)
}

fn base_cfg() -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    cfg.lead_seconds = 360;
    cfg.jitter_seconds = 0;
    cfg.reward_per_window = 1.0;
    cfg
}

#[tokio::test]
async fn first_success_credits_usage_and_schedules_next_attempt() {
    let (pool, _dir) = fresh_pool().await;
    let agent = stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500)
        .await
        .unwrap();
    assert!(agent.next_attempt_ms.is_none());

    let stream_client = Arc::new(FakeStreamClient::new(vec![success(2_000_000)]));
    let epoch_oracle = Arc::new(FakeEpochOracle::ok(42));
    let mut cfg = base_cfg();
    cfg.billing_enabled = true;

    let scheduler = Scheduler::new(pool.clone(), stream_client, Some(epoch_oracle), None, cfg);
    let report = scheduler.execute_tick().await.unwrap();
    assert_eq!(report.stream.ok, 1);
    assert_eq!(report.stream.usage_windows_added, 1);

    let agent = stream_agency_db::get_agent_by_address(&pool, "claw1aaaaaaaaaa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.expected_end_ms, Some(2_000_000));
    assert_eq!(agent.next_attempt_ms, Some(1_640_000));
    assert_eq!(agent.success_count, 1);
    assert!((agent.fee_due_claw - 0.05).abs() < 1e-9);

    let usage: i64 = sqlx::query("SELECT windows FROM usage_windows WHERE agent_id = ?1 AND epoch = 42")
        .bind(agent.id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("windows")
        .unwrap();
    assert_eq!(usage, 1);
}

#[tokio::test]
async fn already_streaming_resyncs_without_crediting_success() {
    let (pool, _dir) = fresh_pool().await;
    stream_agency_db::upsert_agent(&pool, "claw1bbbbbbbbbb", "0xdead", 500)
        .await
        .unwrap();

    let stream_client = Arc::new(FakeStreamClient::new(vec![already_streaming(5_000)]));
    let scheduler = Scheduler::new(pool.clone(), stream_client, None, None, base_cfg());
    scheduler.execute_tick().await.unwrap();

    let agent = stream_agency_db::get_agent_by_address(&pool, "claw1bbbbbbbbbb")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.expected_end_ms, Some(5_000));
    assert_eq!(agent.retry_step, 0);
    assert_eq!(agent.success_count, 0);
}

#[tokio::test]
async fn backoff_ladder_escalates_across_consecutive_failures() {
    let (pool, _dir) = fresh_pool().await;
    let agent = stream_agency_db::upsert_agent(&pool, "claw1cccccccccc", "0xdead", 500)
        .await
        .unwrap();

    let cfg = base_cfg();
    let expected_offsets_ms = [30_000i64, 60_000, 120_000];

    for expected_offset in expected_offsets_ms {
        let stream_client = Arc::new(FakeStreamClient::new(vec![transport_failure()]));
        let scheduler = Scheduler::new(pool.clone(), stream_client, None, None, cfg.clone());
        let before = now_ms();
        scheduler.execute_tick().await.unwrap();
        let after = now_ms();

        let row = stream_agency_db::get_agent_by_address(&pool, "claw1cccccccccc")
            .await
            .unwrap()
            .unwrap();
        let next = row.next_attempt_ms.unwrap();
        assert!(next >= before + expected_offset && next <= after + expected_offset + 1_000);

        // Force the agent due again, simulating the passage of time.
        sqlx::query("UPDATE agents SET next_attempt_ms = ?1 WHERE id = ?2")
            .bind(now_ms())
            .bind(agent.id)
            .execute(&pool)
            .await
            .unwrap();
    }

    let agent = stream_agency_db::get_agent_by_address(&pool, "claw1cccccccccc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.retry_step, 3);
    assert_eq!(agent.failure_count, 3);
}

#[tokio::test]
async fn epoch_unavailable_skips_usage_and_billing() {
    let (pool, _dir) = fresh_pool().await;
    stream_agency_db::upsert_agent(&pool, "claw1dddddddddd", "0xdead", 500)
        .await
        .unwrap();

    let stream_client = Arc::new(FakeStreamClient::new(vec![success(2_000_000)]));
    let epoch_oracle = Arc::new(FakeEpochOracle::err("network unreachable"));
    let mut cfg = base_cfg();
    cfg.billing_enabled = true;

    let scheduler = Scheduler::new(pool.clone(), stream_client, Some(epoch_oracle), None, cfg);
    let report = scheduler.execute_tick().await.unwrap();

    assert_eq!(report.stream.ok, 1);
    assert_eq!(report.stream.usage_windows_added, 0);
    assert_eq!(report.billing.billing_candidates, 0);
    assert!(report.chain_epoch.is_none());
    assert!(report.epoch_error.is_some());
}

#[tokio::test]
async fn billing_sweep_only_touches_closed_epochs() {
    let (pool, _dir) = fresh_pool().await;
    let a = stream_agency_db::upsert_agent(&pool, "claw1eeeeeeeeee", "0xdead", 500)
        .await
        .unwrap();
    let b = stream_agency_db::upsert_agent(&pool, "claw1ffffffffff", "0xdead", 500)
        .await
        .unwrap();

    for (agent_id, epoch, windows) in [(a.id, 41, 3), (b.id, 41, 1), (a.id, 42, 2)] {
        sqlx::query(
            "INSERT INTO usage_windows(agent_id, epoch, windows, billed) VALUES (?1, ?2, ?3, 0)",
        )
        .bind(agent_id)
        .bind(epoch)
        .bind(windows)
        .execute(&pool)
        .await
        .unwrap();
    }

    let stream_client = Arc::new(FakeStreamClient::new(vec![]));
    let epoch_oracle = Arc::new(FakeEpochOracle::ok(42));
    let executor = Arc::new(FakeSettlementExecutor::new(vec![
        SettlementOutcome { ok: true, return_code: 0, stdout: "ok".into(), stderr: String::new() },
        SettlementOutcome { ok: true, return_code: 0, stdout: "ok".into(), stderr: String::new() },
    ]));
    let mut cfg = base_cfg();
    cfg.billing_enabled = true;

    let scheduler = Scheduler::new(pool.clone(), stream_client, Some(epoch_oracle), Some(executor), cfg);
    let report = scheduler.execute_tick().await.unwrap();

    assert_eq!(report.billing.billing_candidates, 2);
    assert_eq!(report.billing.billing_ok, 2);

    let billed_41_a: i64 = sqlx::query("SELECT billed FROM usage_windows WHERE agent_id = ?1 AND epoch = 41")
        .bind(a.id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("billed")
        .unwrap();
    assert_eq!(billed_41_a, 1);

    let billed_42_a: i64 = sqlx::query("SELECT billed FROM usage_windows WHERE agent_id = ?1 AND epoch = 42")
        .bind(a.id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("billed")
        .unwrap();
    assert_eq!(billed_42_a, 0);
}

#[tokio::test]
async fn settlement_failure_records_error_and_retries_next_tick() {
    let (pool, _dir) = fresh_pool().await;
    let a = stream_agency_db::upsert_agent(&pool, "claw1gggggggggg", "0xdead", 500)
        .await
        .unwrap();

    sqlx::query("INSERT INTO usage_windows(agent_id, epoch, windows, billed) VALUES (?1, 41, 2, 0)")
        .bind(a.id)
        .execute(&pool)
        .await
        .unwrap();

    let epoch_oracle = Arc::new(FakeEpochOracle::ok(42));
    let executor = Arc::new(FakeSettlementExecutor::new(vec![SettlementOutcome {
        ok: false,
        return_code: 1,
        stdout: String::new(),
        stderr: "nonce too low".into(),
    }]));
    let mut cfg = base_cfg();
    cfg.billing_enabled = true;

    let scheduler = Scheduler::new(
        pool.clone(),
        Arc::new(FakeStreamClient::new(vec![])),
        Some(epoch_oracle),
        Some(executor),
        cfg,
    );
    let report = scheduler.execute_tick().await.unwrap();
    assert_eq!(report.billing.billing_fail, 1);

    let row = sqlx::query("SELECT billed, last_error FROM usage_windows WHERE agent_id = ?1 AND epoch = 41")
        .bind(a.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let billed: i64 = row.try_get("billed").unwrap();
    let last_error: String = row.try_get("last_error").unwrap();
    assert_eq!(billed, 0);
    assert_eq!(last_error, "nonce too low");

    let attempts = stream_agency_db::recent_billing_attempts(&pool, 10).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt.ok, false);
    assert_eq!(attempts[0].attempt.return_code, 1);

    // Next tick still finds it, since billed remains false.
    let candidates = stream_agency_db::list_billing_candidates(&pool, 42).await.unwrap();
    assert_eq!(candidates.len(), 1);
}
