//! Human-readable rendering for `report` / `attempts` / `billing-attempts`.

use chrono::{TimeZone, Utc};
use stream_agency_schemas::{AgentReport, BillingAttemptReport, StreamAttempt};

pub fn fmt_ts(epoch_ms: Option<i64>) -> String {
    match epoch_ms {
        Some(ms) if ms != 0 => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        _ => "-".to_string(),
    }
}

pub fn print_report(rows: &[AgentReport]) {
    if rows.is_empty() {
        println!("No agents enrolled.");
        return;
    }

    println!(
        "address                              status  fee_bps  ok/fail  pending/billed  next_attempt(UTC)                 expected_end(UTC)"
    );
    println!("{}", "-".repeat(146));
    for row in rows {
        let mut addr = row.address.clone();
        if addr.len() > 34 {
            addr.truncate(31);
            addr.push_str("...");
        }
        println!(
            "{addr:<34} {status:<9} {fee_bps:<7} {ok}/{fail:<7} {pending}/{billed:<13} {next:<32} {end:<32}",
            addr = addr,
            status = row.status.as_str(),
            fee_bps = row.fee_bps,
            ok = row.success_count,
            fail = row.failure_count,
            pending = row.pending_windows,
            billed = row.billed_windows,
            next = fmt_ts(row.next_attempt_ms),
            end = fmt_ts(row.expected_end_ms),
        );
    }
}

pub fn print_attempts(attempts: &[StreamAttempt]) {
    if attempts.is_empty() {
        println!("No attempts recorded.");
        return;
    }
    for a in attempts {
        println!(
            "{} ok={} status={} reason={} end_stream_ms={}",
            fmt_ts(Some(a.attempted_ms)),
            a.ok,
            a.status_code,
            a.reason,
            a.end_stream_ms.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        );
    }
}

pub fn print_billing_attempts(rows: &[BillingAttemptReport]) {
    if rows.is_empty() {
        println!("No billing attempts recorded.");
        return;
    }
    for row in rows {
        println!(
            "{} agent={} epoch={} windows={} ok={} rc={}",
            fmt_ts(Some(row.attempt.attempted_ms)),
            row.address,
            row.attempt.epoch,
            row.attempt.windows,
            row.attempt.ok,
            row.attempt.return_code,
        );
        if !row.attempt.stderr.is_empty() {
            let mut stderr = row.attempt.stderr.clone();
            stderr.truncate(260);
            println!("  stderr={stderr}");
        }
    }
}
