use sqlx::{Row, SqlitePool};
use stream_agency_schemas::AgentStatus;

async fn fresh_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agency.db");
    let pool = stream_agency_db::connect(path.to_str().unwrap()).await.unwrap();
    stream_agency_db::migrate(&pool).await.unwrap();
    (pool, dir)
}

#[tokio::test]
async fn upsert_inserts_then_updates_signature_and_fee_on_conflict() {
    let (pool, _dir) = fresh_pool().await;

    let agent = stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500)
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Active);
    assert_eq!(agent.stream_signature, "dead");

    let updated = stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xbeef", 750)
        .await
        .unwrap();
    assert_eq!(updated.id, agent.id);
    assert_eq!(updated.stream_signature, "beef");
    assert_eq!(updated.fee_bps, 750);
    assert_eq!(updated.status, AgentStatus::Active);
}

#[tokio::test]
async fn enroll_pause_resume_enroll_leaves_agent_active_with_new_signature() {
    let (pool, _dir) = fresh_pool().await;
    stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500).await.unwrap();
    stream_agency_db::set_status(&pool, "claw1aaaaaaaaaa", AgentStatus::Paused).await.unwrap();
    stream_agency_db::set_status(&pool, "claw1aaaaaaaaaa", AgentStatus::Active).await.unwrap();
    stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xbeef", 600).await.unwrap();

    let agent = stream_agency_db::get_agent_by_address(&pool, "claw1aaaaaaaaaa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Active);
    assert_eq!(agent.stream_signature, "beef");
    assert_eq!(agent.fee_bps, 600);
}

#[tokio::test]
async fn set_status_on_unknown_address_is_not_found() {
    let (pool, _dir) = fresh_pool().await;
    let err = stream_agency_db::set_status(&pool, "claw1missing", AgentStatus::Paused)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn remove_agent_cascades_attempts_and_usage() {
    let (pool, _dir) = fresh_pool().await;
    let agent = stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500)
        .await
        .unwrap();

    let mut tx = stream_agency_db::begin(&pool).await.unwrap();
    stream_agency_db::record_attempt(&mut tx, agent.id, true, 200, "ok", Some(1000), "{}")
        .await
        .unwrap();
    stream_agency_db::increment_usage(&mut tx, agent.id, 1).await.unwrap();
    tx.commit().await.unwrap();

    stream_agency_db::remove_agent(&pool, "claw1aaaaaaaaaa").await.unwrap();

    assert!(stream_agency_db::get_agent_by_address(&pool, "claw1aaaaaaaaaa")
        .await
        .unwrap()
        .is_none());

    let attempt_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM attempts WHERE agent_id = ?1")
        .bind(agent.id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("c")
        .unwrap();
    assert_eq!(attempt_count, 0);
}

#[tokio::test]
async fn list_due_agents_orders_by_next_attempt_and_treats_null_as_due_now() {
    let (pool, _dir) = fresh_pool().await;
    stream_agency_db::upsert_agent(&pool, "claw1cccccccccc", "0xdead", 500).await.unwrap();
    stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500).await.unwrap();
    let b = stream_agency_db::upsert_agent(&pool, "claw1bbbbbbbbbb", "0xdead", 500).await.unwrap();

    sqlx::query("UPDATE agents SET next_attempt_ms = 999999999999999 WHERE id = ?1")
        .bind(b.id)
        .execute(&pool)
        .await
        .unwrap();

    let due = stream_agency_db::list_due_agents(&pool, stream_agency_schemas::now_ms())
        .await
        .unwrap();
    let addresses: Vec<_> = due.iter().map(|a| a.address.as_str()).collect();
    assert_eq!(addresses, vec!["claw1cccccccccc", "claw1aaaaaaaaaa"]);
}

#[tokio::test]
async fn paused_agents_are_never_due() {
    let (pool, _dir) = fresh_pool().await;
    stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500).await.unwrap();
    stream_agency_db::set_status(&pool, "claw1aaaaaaaaaa", AgentStatus::Paused).await.unwrap();

    let due = stream_agency_db::list_due_agents(&pool, stream_agency_schemas::now_ms())
        .await
        .unwrap();
    assert!(due.is_empty());
}

#[tokio::test]
async fn response_body_and_error_message_truncation_is_char_boundary_safe() {
    let (pool, _dir) = fresh_pool().await;
    let agent = stream_agency_db::upsert_agent(&pool, "claw1aaaaaaaaaa", "0xdead", 500)
        .await
        .unwrap();

    let long_body: String = "x".repeat(5000);
    let mut tx = stream_agency_db::begin(&pool).await.unwrap();
    stream_agency_db::record_attempt(&mut tx, agent.id, true, 200, "ok", None, &long_body)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let attempts = stream_agency_db::recent_attempts(&pool, "claw1aaaaaaaaaa", 1)
        .await
        .unwrap();
    assert_eq!(attempts[0].response_body_truncated.len(), 4000);

    let long_error: String = "e".repeat(500);
    let mut tx = stream_agency_db::begin(&pool).await.unwrap();
    let updated = stream_agency_db::apply_failure(&mut tx, agent.id, 0, 1, &long_error)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(updated.last_error.unwrap().len(), 300);
}
