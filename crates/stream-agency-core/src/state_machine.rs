//! The per-agent state transition: classifies a stream response into an
//! outcome and derives the timestamps/fee that follow from it.
//!
//! Kept free of I/O so the classification and the derived timestamps can be
//! unit-tested without a database or network.

use stream_agency_client::StreamResponse;

/// Tagged outcome of one stream call, feeding the state-update function in
/// `scheduler.rs`.
#[derive(Debug, Clone, PartialEq)]
pub enum ArmOutcome {
    ArmSuccess { end_stream_ms: i64 },
    ReSync { end_stream_ms: i64 },
    Backoff { status_code: i64, body: String },
}

/// Attempt-log `reason` string, computed independently of the state
/// transition: an `already_streaming` reply without `end_stream_ms` is
/// still logged as `already_streaming`, even though it drives *Backoff*.
pub fn classify_reason(resp: &StreamResponse) -> &'static str {
    if resp.ok {
        "ok"
    } else if resp.is_already_streaming() {
        "already_streaming"
    } else {
        "error"
    }
}

pub fn classify_outcome(resp: &StreamResponse) -> ArmOutcome {
    if resp.ok {
        return match resp.end_stream_ms() {
            Some(end_stream_ms) => ArmOutcome::ArmSuccess { end_stream_ms },
            None => ArmOutcome::Backoff {
                status_code: resp.status,
                body: resp.body.clone(),
            },
        };
    }

    if resp.is_already_streaming() {
        if let Some(end_stream_ms) = resp.end_stream_ms() {
            return ArmOutcome::ReSync { end_stream_ms };
        }
    }

    ArmOutcome::Backoff {
        status_code: resp.status,
        body: resp.body.clone(),
    }
}

/// `next_attempt_ms = expected_end_ms - lead_seconds*1000 + jitter_ms`.
pub fn next_attempt_ms(end_stream_ms: i64, lead_seconds: i64, jitter_ms: i64) -> i64 {
    end_stream_ms - lead_seconds * 1000 + jitter_ms
}

pub fn fee_for_success(reward_per_window: f64, fee_bps: i64) -> f64 {
    reward_per_window * (fee_bps as f64 / 10_000.0)
}

/// `d(0)=30s, d(1)=60s, d(2)=120s, d(k>=3)=180s`.
pub fn backoff_delay_seconds(retry_step: i64) -> i64 {
    match retry_step.clamp(0, 3) {
        0 => 30,
        1 => 60,
        2 => 120,
        _ => 180,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(ok: bool, status: i64, body: &str, parsed: Option<serde_json::Value>) -> StreamResponse {
        StreamResponse {
            ok,
            status,
            body: body.to_string(),
            parsed,
        }
    }

    #[test]
    fn success_with_end_stream_is_arm_success() {
        let r = resp(true, 200, "", Some(serde_json::json!({"end_stream": 2_000_000})));
        assert_eq!(classify_outcome(&r), ArmOutcome::ArmSuccess { end_stream_ms: 2_000_000 });
        assert_eq!(classify_reason(&r), "ok");
    }

    #[test]
    fn success_without_end_stream_is_backoff() {
        let r = resp(true, 200, "", Some(serde_json::json!({"unrelated": 1})));
        assert!(matches!(classify_outcome(&r), ArmOutcome::Backoff { .. }));
    }

    #[test]
    fn already_streaming_with_end_stream_is_resync() {
        let r = resp(
            false,
            403,
            "already streaming",
            Some(serde_json::json!({"end_stream": 5_000})),
        );
        assert_eq!(classify_outcome(&r), ArmOutcome::ReSync { end_stream_ms: 5_000 });
        assert_eq!(classify_reason(&r), "already_streaming");
    }

    #[test]
    fn already_streaming_without_end_stream_falls_through_to_backoff() {
        let r = resp(false, 403, "already streaming", None);
        assert!(matches!(classify_outcome(&r), ArmOutcome::Backoff { .. }));
        assert_eq!(classify_reason(&r), "already_streaming");
    }

    #[test]
    fn transport_failure_is_backoff_with_error_reason() {
        let r = resp(false, 0, "URLError: timed out", None);
        assert!(matches!(classify_outcome(&r), ArmOutcome::Backoff { .. }));
        assert_eq!(classify_reason(&r), "error");
    }

    #[test]
    fn backoff_ladder_escalates_then_caps() {
        assert_eq!(backoff_delay_seconds(0), 30);
        assert_eq!(backoff_delay_seconds(1), 60);
        assert_eq!(backoff_delay_seconds(2), 120);
        assert_eq!(backoff_delay_seconds(3), 180);
        assert_eq!(backoff_delay_seconds(10), 180);
    }

    #[test]
    fn next_attempt_ms_applies_lead_and_jitter() {
        assert_eq!(next_attempt_ms(2_000_000, 360, 0), 1_640_000);
        assert_eq!(next_attempt_ms(2_000_000, 360, 500), 1_640_500);
    }

    #[test]
    fn fee_uses_basis_points() {
        assert!((fee_for_success(1.0, 500) - 0.05).abs() < 1e-9);
    }
}
