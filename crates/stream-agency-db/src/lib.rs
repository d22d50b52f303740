//! Durable, single-writer store for the Stream Agency daemon.
//!
//! Backed by an embedded SQLite database opened in WAL mode. Every mutating
//! function here is one transaction; functions that are meant to share a
//! transaction with a caller (attempt recording + agent update + usage
//! increment, all committed together) take an open
//! `&mut Transaction<'_, Sqlite>` instead of a `&SqlitePool`.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;

use stream_agency_schemas::{
    now_ms, AgencyError, Agent, AgentReport, AgentStatus, BillingAttempt, BillingAttemptReport,
    BillingCandidate, StreamAttempt,
};

pub const ENV_DB_PATH: &str = "STREAM_AGENCY_DB_PATH";
const RESPONSE_BODY_CAP: usize = 4_000;
const ERROR_MESSAGE_CAP: usize = 300;

/// Connect to the SQLite file named by `STREAM_AGENCY_DB_PATH` (or the
/// default `stream-agency/agency.db`), creating its parent directory if
/// needed, with `journal_mode=WAL` and `foreign_keys=ON`.
pub async fn connect_from_env() -> Result<SqlitePool> {
    let path = std::env::var(ENV_DB_PATH).unwrap_or_else(|_| "stream-agency/agency.db".into());
    connect(&path).await
}

pub async fn connect(db_path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {parent:?}"))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
        .with_context(|| format!("invalid sqlite path {db_path}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    // Single-writer per database file: one connection avoids `SQLITE_BUSY`
    // races between concurrent writers in-process.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open sqlite database")?;

    Ok(pool)
}

/// Run the embedded migrations. Idempotent: safe to call on every startup.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

fn normalize_signature(sig: &str) -> String {
    sig.trim().strip_prefix("0x").unwrap_or(sig.trim()).to_string()
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> Result<Agent> {
    let status_str: String = row.try_get("status")?;
    let status = AgentStatus::from_str(&status_str)
        .map_err(|e| anyhow::anyhow!("corrupt agent status in db: {e}"))?;
    Ok(Agent {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        stream_signature: row.try_get("stream_signature")?,
        fee_bps: row.try_get("fee_bps")?,
        status,
        expected_end_ms: row.try_get("expected_end_ms")?,
        next_attempt_ms: row.try_get("next_attempt_ms")?,
        retry_step: row.try_get("retry_step")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        fee_due_claw: row.try_get("fee_due_claw")?,
        last_success_ms: row.try_get("last_success_ms")?,
        last_error: row.try_get("last_error")?,
        created_ms: row.try_get("created_ms")?,
        updated_ms: row.try_get("updated_ms")?,
    })
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> Result<StreamAttempt> {
    Ok(StreamAttempt {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        attempted_ms: row.try_get("attempted_ms")?,
        ok: row.try_get::<i64, _>("ok")? != 0,
        status_code: row.try_get("status_code")?,
        reason: row.try_get::<Option<String>, _>("reason")?.unwrap_or_default(),
        end_stream_ms: row.try_get("end_stream_ms")?,
        response_body_truncated: row
            .try_get::<Option<String>, _>("response_body")?
            .unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Agent lifecycle (Admin Surface backing)
// ---------------------------------------------------------------------------

/// Insert a new agent or, on address conflict, update signature/fee/status.
/// The signature is normalized by stripping a leading `0x`.
pub async fn upsert_agent(
    pool: &SqlitePool,
    address: &str,
    signature: &str,
    fee_bps: i64,
) -> Result<Agent> {
    let ts = now_ms();
    let sig = normalize_signature(signature);
    let address = address.trim();

    let row = sqlx::query(
        r#"
        INSERT INTO agents(address, stream_signature, fee_bps, status, next_attempt_ms, created_ms, updated_ms)
        VALUES (?1, ?2, ?3, 'active', NULL, ?4, ?4)
        ON CONFLICT(address) DO UPDATE SET
            stream_signature = excluded.stream_signature,
            fee_bps = excluded.fee_bps,
            status = 'active',
            updated_ms = excluded.updated_ms
        RETURNING *
        "#,
    )
    .bind(address)
    .bind(&sig)
    .bind(fee_bps)
    .bind(ts)
    .fetch_one(pool)
    .await
    .context("upsert_agent failed")?;

    row_to_agent(&row)
}

/// Set an agent's status. Fails with `NotFound` if no such agent exists.
pub async fn set_status(pool: &SqlitePool, address: &str, status: AgentStatus) -> Result<()> {
    let result = sqlx::query("UPDATE agents SET status = ?1, updated_ms = ?2 WHERE address = ?3")
        .bind(status.as_str())
        .bind(now_ms())
        .bind(address)
        .execute(pool)
        .await
        .context("set_status failed")?;

    if result.rows_affected() == 0 {
        return Err(AgencyError::NotFound(address.to_string()).into());
    }
    Ok(())
}

/// Delete an agent and all dependent rows in one transaction. Fails with
/// `NotFound` if no such agent exists.
pub async fn remove_agent(pool: &SqlitePool, address: &str) -> Result<()> {
    let mut tx = pool.begin().await.context("begin remove_agent tx")?;

    let row = sqlx::query("SELECT id FROM agents WHERE address = ?1")
        .bind(address)
        .fetch_optional(&mut *tx)
        .await
        .context("lookup agent for removal")?;

    let Some(row) = row else {
        return Err(AgencyError::NotFound(address.to_string()).into());
    };
    let agent_id: i64 = row.try_get("id")?;

    sqlx::query("DELETE FROM billing_attempts WHERE agent_id = ?1")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM usage_windows WHERE agent_id = ?1")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM attempts WHERE agent_id = ?1")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM agents WHERE id = ?1")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await.context("commit remove_agent tx")?;
    Ok(())
}

/// Pre-populate `expected_end_ms`/`next_attempt_ms` from a live enroll-time
/// probe, using the same derived values the *ArmSuccess* transition would
/// compute. Not part of the tick transaction, so this is a standalone
/// statement rather than a `Transaction` parameter.
pub async fn apply_enroll_probe(
    pool: &SqlitePool,
    agent_id: i64,
    expected_end_ms: i64,
    next_attempt_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE agents
        SET expected_end_ms = ?1, next_attempt_ms = ?2, retry_step = 0, last_error = NULL, updated_ms = ?3
        WHERE id = ?4
        "#,
    )
    .bind(expected_end_ms)
    .bind(next_attempt_ms)
    .bind(now_ms())
    .bind(agent_id)
    .execute(pool)
    .await
    .context("apply_enroll_probe failed")?;
    Ok(())
}

pub async fn get_agent_by_address(pool: &SqlitePool, address: &str) -> Result<Option<Agent>> {
    let row = sqlx::query("SELECT * FROM agents WHERE address = ?1")
        .bind(address)
        .fetch_optional(pool)
        .await
        .context("get_agent_by_address failed")?;
    row.as_ref().map(row_to_agent).transpose()
}

/// All due agents, ordered by `next_attempt_ms` ascending with unset
/// treated as due-now.
pub async fn list_due_agents(pool: &SqlitePool, now_ms: i64) -> Result<Vec<Agent>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM agents
        WHERE status = 'active'
          AND (next_attempt_ms IS NULL OR next_attempt_ms <= ?1)
        ORDER BY COALESCE(next_attempt_ms, 0) ASC
        "#,
    )
    .bind(now_ms)
    .fetch_all(pool)
    .await
    .context("list_due_agents failed")?;

    rows.iter().map(row_to_agent).collect()
}

// ---------------------------------------------------------------------------
// Scheduler tick: attempt recording + state transition
// ---------------------------------------------------------------------------

pub async fn begin(pool: &SqlitePool) -> Result<Transaction<'_, Sqlite>> {
    pool.begin().await.context("begin tick tx")
}

/// Append one attempt row. Never mutated afterward.
pub async fn record_attempt(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: i64,
    ok: bool,
    status_code: i64,
    reason: &str,
    end_stream_ms: Option<i64>,
    response_body: &str,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO attempts(agent_id, attempted_ms, ok, status_code, reason, end_stream_ms, response_body)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(agent_id)
    .bind(now_ms())
    .bind(ok as i64)
    .bind(status_code)
    .bind(reason)
    .bind(end_stream_ms)
    .bind(truncate(response_body, RESPONSE_BODY_CAP))
    .execute(&mut **tx)
    .await
    .context("record_attempt failed")?;

    Ok(result.last_insert_rowid())
}

/// Apply the *ArmSuccess* transition. `fee_delta` and `next_attempt_ms` are
/// precomputed by the Scheduler so the Store stays a pure persistence
/// layer.
pub async fn apply_arm_success(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: i64,
    expected_end_ms: i64,
    next_attempt_ms: i64,
    fee_delta: f64,
) -> Result<Agent> {
    let ts = now_ms();
    let row = sqlx::query(
        r#"
        UPDATE agents
        SET
            expected_end_ms = ?1,
            next_attempt_ms = ?2,
            retry_step = 0,
            success_count = success_count + 1,
            fee_due_claw = fee_due_claw + ?3,
            last_success_ms = ?4,
            last_error = NULL,
            updated_ms = ?4
        WHERE id = ?5
        RETURNING *
        "#,
    )
    .bind(expected_end_ms)
    .bind(next_attempt_ms)
    .bind(fee_delta)
    .bind(ts)
    .bind(agent_id)
    .fetch_one(&mut **tx)
    .await
    .context("apply_arm_success failed")?;

    row_to_agent(&row)
}

/// Apply the *ReSync* transition. No fee accrual, no success-count bump (the
/// window was already credited by the original arm).
pub async fn apply_already_streaming(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: i64,
    expected_end_ms: i64,
    next_attempt_ms: i64,
) -> Result<Agent> {
    let ts = now_ms();
    let row = sqlx::query(
        r#"
        UPDATE agents
        SET
            expected_end_ms = ?1,
            next_attempt_ms = ?2,
            retry_step = 0,
            updated_ms = ?3
        WHERE id = ?4
        RETURNING *
        "#,
    )
    .bind(expected_end_ms)
    .bind(next_attempt_ms)
    .bind(ts)
    .bind(agent_id)
    .fetch_one(&mut **tx)
    .await
    .context("apply_already_streaming failed")?;

    row_to_agent(&row)
}

/// Apply the *Backoff* transition. `error_message` is truncated to 300
/// bytes before persistence.
pub async fn apply_failure(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: i64,
    next_attempt_ms: i64,
    next_retry_step: i64,
    error_message: &str,
) -> Result<Agent> {
    let ts = now_ms();
    let row = sqlx::query(
        r#"
        UPDATE agents
        SET
            next_attempt_ms = ?1,
            retry_step = ?2,
            failure_count = failure_count + 1,
            last_error = ?3,
            updated_ms = ?4
        WHERE id = ?5
        RETURNING *
        "#,
    )
    .bind(next_attempt_ms)
    .bind(next_retry_step)
    .bind(truncate(error_message, ERROR_MESSAGE_CAP))
    .bind(ts)
    .bind(agent_id)
    .fetch_one(&mut **tx)
    .await
    .context("apply_failure failed")?;

    row_to_agent(&row)
}

/// Increment `(agent_id, epoch)` by exactly one, atomically with the
/// caller's arm-success update (same transaction).
pub async fn increment_usage(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: i64,
    epoch: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO usage_windows(agent_id, epoch, windows, billed)
        VALUES (?1, ?2, 1, 0)
        ON CONFLICT(agent_id, epoch) DO UPDATE SET windows = windows + 1
        "#,
    )
    .bind(agent_id)
    .bind(epoch)
    .execute(&mut **tx)
    .await
    .context("increment_usage failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Billing sweep
// ---------------------------------------------------------------------------

/// Billing candidates for `chain_epoch`: unbilled, closed-epoch, nonzero
/// usage rows, ordered `(epoch asc, agent_id asc)` for deterministic
/// processing order.
pub async fn list_billing_candidates(
    pool: &SqlitePool,
    chain_epoch: i64,
) -> Result<Vec<BillingCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT uw.agent_id AS agent_id, uw.epoch AS epoch, uw.windows AS windows, a.address AS address
        FROM usage_windows uw
        JOIN agents a ON a.id = uw.agent_id
        WHERE uw.billed = 0
          AND uw.epoch < ?1
          AND uw.windows > 0
          AND a.status IN ('active', 'paused', 'suspended')
        ORDER BY uw.epoch ASC, uw.agent_id ASC
        "#,
    )
    .bind(chain_epoch)
    .fetch_all(pool)
    .await
    .context("list_billing_candidates failed")?;

    rows.iter()
        .map(|row| {
            Ok(BillingCandidate {
                agent_id: row.try_get("agent_id")?,
                address: row.try_get("address")?,
                epoch: row.try_get("epoch")?,
                windows: row.try_get("windows")?,
            })
        })
        .collect()
}

/// Append one billing-attempt row. stdout/stderr truncated to 4000 bytes.
pub async fn record_billing_attempt(
    pool: &SqlitePool,
    agent_id: i64,
    epoch: i64,
    windows: i64,
    ok: bool,
    return_code: i64,
    stdout: &str,
    stderr: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_attempts(agent_id, epoch, windows, attempted_ms, ok, return_code, stdout, stderr)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(agent_id)
    .bind(epoch)
    .bind(windows)
    .bind(now_ms())
    .bind(ok as i64)
    .bind(return_code)
    .bind(truncate(stdout, RESPONSE_BODY_CAP))
    .bind(truncate(stderr, RESPONSE_BODY_CAP))
    .execute(pool)
    .await
    .context("record_billing_attempt failed")?;

    Ok(())
}

/// Mark `(agent_id, epoch)` billed. Terminal — callers must not mutate
/// this row again after this succeeds.
pub async fn mark_billed(pool: &SqlitePool, agent_id: i64, epoch: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE usage_windows
        SET billed = 1, billed_at_ms = ?1, last_error = NULL
        WHERE agent_id = ?2 AND epoch = ?3
        "#,
    )
    .bind(now_ms())
    .bind(agent_id)
    .bind(epoch)
    .execute(pool)
    .await
    .context("mark_billed failed")?;
    Ok(())
}

pub async fn record_billing_failure(
    pool: &SqlitePool,
    agent_id: i64,
    epoch: i64,
    err: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE usage_windows
        SET last_error = ?1
        WHERE agent_id = ?2 AND epoch = ?3
        "#,
    )
    .bind(truncate(err, ERROR_MESSAGE_CAP))
    .bind(agent_id)
    .bind(epoch)
    .execute(pool)
    .await
    .context("record_billing_failure failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reporting (Admin Surface reads)
// ---------------------------------------------------------------------------

pub async fn collect_report_data(pool: &SqlitePool) -> Result<Vec<AgentReport>> {
    let usage_rows = sqlx::query(
        r#"
        SELECT
            agent_id,
            SUM(CASE WHEN billed = 0 THEN windows ELSE 0 END) AS pending,
            SUM(CASE WHEN billed = 1 THEN windows ELSE 0 END) AS billed
        FROM usage_windows
        GROUP BY agent_id
        "#,
    )
    .fetch_all(pool)
    .await
    .context("collect_report_data usage query failed")?;

    let mut pending_by_agent = std::collections::HashMap::new();
    let mut billed_by_agent = std::collections::HashMap::new();
    for row in &usage_rows {
        let agent_id: i64 = row.try_get("agent_id")?;
        pending_by_agent.insert(agent_id, row.try_get::<i64, _>("pending")?);
        billed_by_agent.insert(agent_id, row.try_get::<i64, _>("billed")?);
    }

    let agent_rows = sqlx::query("SELECT * FROM agents ORDER BY id")
        .fetch_all(pool)
        .await
        .context("collect_report_data agents query failed")?;

    agent_rows
        .iter()
        .map(|row| {
            let agent = row_to_agent(row)?;
            Ok(AgentReport {
                id: agent.id,
                address: agent.address,
                fee_bps: agent.fee_bps,
                status: agent.status,
                success_count: agent.success_count,
                failure_count: agent.failure_count,
                pending_windows: pending_by_agent.get(&agent.id).copied().unwrap_or(0),
                billed_windows: billed_by_agent.get(&agent.id).copied().unwrap_or(0),
                next_attempt_ms: agent.next_attempt_ms,
                expected_end_ms: agent.expected_end_ms,
                last_success_ms: agent.last_success_ms,
                last_error: agent.last_error,
            })
        })
        .collect()
}

/// Most recent stream attempts for one agent. `NotFound` if the address
/// doesn't exist.
pub async fn recent_attempts(
    pool: &SqlitePool,
    address: &str,
    limit: i64,
) -> Result<Vec<StreamAttempt>> {
    let agent = get_agent_by_address(pool, address).await?;
    let Some(agent) = agent else {
        return Err(AgencyError::NotFound(address.to_string()).into());
    };

    let rows = sqlx::query(
        r#"
        SELECT id, agent_id, attempted_ms, ok, status_code, reason, end_stream_ms, response_body
        FROM attempts
        WHERE agent_id = ?1
        ORDER BY attempted_ms DESC
        LIMIT ?2
        "#,
    )
    .bind(agent.id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_attempts failed")?;

    rows.iter().map(row_to_attempt).collect()
}

pub async fn recent_billing_attempts(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<BillingAttemptReport>> {
    let rows = sqlx::query(
        r#"
        SELECT ba.id AS id, ba.agent_id AS agent_id, ba.epoch AS epoch, ba.windows AS windows,
               ba.attempted_ms AS attempted_ms, ba.ok AS ok, ba.return_code AS return_code,
               ba.stdout AS stdout, ba.stderr AS stderr, a.address AS address
        FROM billing_attempts ba
        JOIN agents a ON a.id = ba.agent_id
        ORDER BY ba.attempted_ms DESC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_billing_attempts failed")?;

    rows.iter()
        .map(|row| {
            Ok(BillingAttemptReport {
                address: row.try_get("address")?,
                attempt: BillingAttempt {
                    id: row.try_get("id")?,
                    agent_id: row.try_get("agent_id")?,
                    epoch: row.try_get("epoch")?,
                    windows: row.try_get("windows")?,
                    attempted_ms: row.try_get("attempted_ms")?,
                    ok: row.try_get::<i64, _>("ok")? != 0,
                    return_code: row.try_get("return_code")?,
                    stdout: row.try_get::<Option<String>, _>("stdout")?.unwrap_or_default(),
                    stderr: row.try_get::<Option<String>, _>("stderr")?.unwrap_or_default(),
                },
            })
        })
        .collect()
}

/// Uniform jitter in `[0, jitter_seconds]` seconds, expressed in
/// milliseconds. Exposed here because it's the one piece of the
/// Scheduler's math that needs an RNG, and callers otherwise shouldn't
/// need a `rand` dependency.
pub fn jitter_ms(jitter_seconds: i64) -> i64 {
    let upper = (jitter_seconds.max(0) * 1000) as u64;
    if upper == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=upper) as i64
}
