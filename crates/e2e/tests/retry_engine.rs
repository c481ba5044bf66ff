//! Retry engine behaviour
//!
//! Attempt counts, the backoff schedule as observed on the clock, and the
//! diagnostic capture taken before the final attempt.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alertwatch_common::config::RetryConfig;
use alertwatch_e2e::diagnostics::DiagnosticCapture;
use alertwatch_e2e::retry::{retry, RetryEngine, RetryPolicy};
use alertwatch_e2e::{E2eError, E2eResult};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Records captures into a shared event log
struct RecordingCapture {
    events: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl DiagnosticCapture for RecordingCapture {
    async fn capture(&self, label: &str) -> E2eResult<PathBuf> {
        self.events.lock().push(format!("capture:{}", label));
        if self.fail {
            return Err(E2eError::Driver("screenshot failed".into()));
        }
        Ok(PathBuf::from(format!("{}.png", label)))
    }
}

fn engine_with_log(max_attempts: u32, fail_capture: bool) -> (RetryEngine, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let engine = RetryEngine::new(RetryPolicy::new(max_attempts, Duration::from_millis(1)))
        .with_diagnostics(Arc::new(RecordingCapture {
            events: events.clone(),
            fail: fail_capture,
        }));
    (engine, events)
}

#[tokio::test]
async fn always_failing_operation_is_tried_exactly_max_attempts() {
    let calls = AtomicU32::new(0);

    let err = retry("open-stack", 3, Duration::from_millis(1), |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(E2eError::Driver("row never rendered".into())) }
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match &err {
        E2eError::RetryExhausted {
            operation,
            attempts,
            source,
        } => {
            assert_eq!(operation, "open-stack");
            assert_eq!(*attempts, 3);
            assert!(source.to_string().contains("row never rendered"));
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    let message = err.to_string();
    assert!(message.contains("open-stack"));
    assert!(message.contains('3'));
}

#[tokio::test]
async fn success_on_a_later_attempt_returns_its_value() {
    let calls = AtomicU32::new(0);

    let value = retry("flaky", 4, Duration::from_millis(1), |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if ctx.attempt < 3 {
                Err(E2eError::Timeout("toast".into()))
            } else {
                Ok(ctx.attempt * 10)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 30);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn backoff_doubles_between_attempts() {
    // Delays before attempts 2 and 3 are 10 ms and 20 ms
    let start = Instant::now();
    let result = retry("x", 3, Duration::from_millis(10), |_ctx| async {
        Err::<(), _>(E2eError::Driver("nope".into()))
    })
    .await;

    assert!(result.is_err());
    assert!(
        start.elapsed() >= Duration::from_millis(30),
        "elapsed {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn first_attempt_runs_without_delay() {
    let start = Instant::now();
    let value = retry("fast", 3, Duration::from_secs(5), |_ctx| async { Ok(7) })
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn diagnostics_captured_before_final_attempt() {
    let (engine, events) = engine_with_log(3, false);

    let result = engine
        .retry("create-alert", |ctx| {
            events.lock().push(format!("attempt:{}", ctx.attempt));
            async { Err::<(), _>(E2eError::Driver("form closed".into())) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(
        *events.lock(),
        vec![
            "attempt:1",
            "attempt:2",
            "capture:create-alert-before-final-attempt",
            "attempt:3",
        ]
    );
}

#[tokio::test]
async fn no_capture_when_first_attempt_succeeds() {
    let (engine, events) = engine_with_log(3, false);

    engine.retry("ok", |_ctx| async { Ok(()) }).await.unwrap();

    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn single_attempt_policy_never_captures() {
    let (engine, events) = engine_with_log(1, false);

    let result = engine
        .retry("login-admin", |_ctx| async {
            Err::<(), _>(E2eError::Driver("rejected".into()))
        })
        .await;

    assert!(matches!(
        result,
        Err(E2eError::RetryExhausted { attempts: 1, .. })
    ));
    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn failing_capture_does_not_stop_the_final_attempt() {
    let (engine, events) = engine_with_log(2, true);

    let value = engine
        .retry("dispatch", |ctx| async move {
            if ctx.is_final_attempt() {
                Ok("sent")
            } else {
                Err(E2eError::Driver("busy".into()))
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "sent");
    assert_eq!(events.lock().len(), 1);
}

#[test]
fn policy_from_config_clamps_attempts() {
    let policy = RetryPolicy::from(&RetryConfig {
        max_attempts: 0,
        base_delay_ms: 250,
    });

    assert_eq!(policy.max_attempts, 1);
    assert_eq!(policy.base_delay, Duration::from_millis(250));
    assert_eq!(policy.delay_before(1), Duration::ZERO);
}
