//! Teardown semantics
//!
//! Registry ordering and failure classification, plus the stack-aware
//! reversal routines against a scripted dashboard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alertwatch_common::config::WaitConfig;
use alertwatch_common::BoundingBox;
use alertwatch_e2e::cleanup::{CleanupCoordinator, CleanupRegistry, Criticality};
use alertwatch_e2e::driver::BrowserDriver;
use alertwatch_e2e::testing::FakeDriver;
use alertwatch_e2e::wait::AdaptiveWaiter;
use alertwatch_e2e::workflow::DashboardLocators;
use alertwatch_e2e::E2eError;
use parking_lot::Mutex;

const BASE: &str = "https://dash.example.test";

fn fast_waits() -> WaitConfig {
    WaitConfig {
        element_timeout_ms: 300,
        stability_attempts: 3,
        stability_interval_ms: 1,
        count_minimum_wait_ms: 1,
        count_max_wait_ms: 200,
        count_check_interval_ms: 2,
        count_required_stable_checks: 2,
    }
}

fn coordinator(driver: &Arc<FakeDriver>) -> CleanupCoordinator {
    let driver: Arc<dyn BrowserDriver> = driver.clone();
    CleanupCoordinator::new(AdaptiveWaiter::new(driver, &fast_waits()), BASE)
        .with_step_timeout(Duration::from_millis(50))
}

fn suppressions(p: &alertwatch_e2e::testing::FakePage) -> usize {
    p.var("suppressions")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Suppressions page with `rows` entries. When `removable` is false the
/// confirm dialog closes but the row stays, like a backend that rejects deletes.
fn suppression_page(rows: usize, removable: bool) -> Arc<FakeDriver> {
    let driver = FakeDriver::shared();
    let l = DashboardLocators::default();
    driver.with_page(|p| p.set_var("suppressions", &rows.to_string()));

    let loc = l.clone();
    driver.on_goto(&format!("{}{}", BASE, l.suppressions_path), move |p| {
        p.clear_elements();
        p.show(&loc.suppression_table);
        let n = suppressions(p);
        p.set_count(&loc.suppression_rows, n);
        p.set_count(&loc.suppression_remove_button, n);
        Ok(())
    });

    let loc = l.clone();
    driver.on_click(&l.suppression_remove_button, move |p| {
        p.show(&loc.confirm_button);
        Ok(())
    });

    let loc = l.clone();
    driver.on_click(&l.confirm_button, move |p| {
        p.remove(&loc.confirm_button);
        if removable {
            let n = suppressions(p).saturating_sub(1);
            p.set_var("suppressions", &n.to_string());
            p.set_count(&loc.suppression_rows, n);
            p.set_count(&loc.suppression_remove_button, n);
        }
        Ok(())
    });

    driver
}

#[tokio::test]
async fn best_effort_failure_does_not_stop_later_actions() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CleanupRegistry::new();

    for name in ["delete alert", "close drawer"] {
        let ran = ran.clone();
        registry.best_effort(name, move || async move {
            ran.lock().push(name);
            Ok(())
        });
    }
    registry.best_effort("reset filters", || async {
        Err::<(), _>(E2eError::Timeout("filter chip".into()))
    });

    let report = registry.run().await;

    assert_eq!(report.outcomes[0].name, "reset filters");
    assert_eq!(*ran.lock(), vec!["close drawer", "delete alert"]);
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.best_effort_failures().len(), 1);
    assert!(!report.all_succeeded());
    assert!(report.into_result().is_ok());
}

#[tokio::test]
async fn mandatory_failure_fails_after_everything_ran() {
    let after = Arc::new(AtomicUsize::new(0));
    let mut registry = CleanupRegistry::new();

    let counter = after.clone();
    registry.best_effort("delete alert", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    registry.mandatory("unsuppress all", || async {
        Err::<(), _>(E2eError::StepFailed {
            step: "unsuppress all".into(),
            reason: "2 suppressions remain".into(),
        })
    });

    let report = registry.run().await;
    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(report.mandatory_failures().len(), 1);

    match report.into_result() {
        Err(E2eError::CleanupFailed { failures }) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("unsuppress all"));
            assert!(failures[0].contains("2 suppressions remain"));
        }
        other => panic!("expected CleanupFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn mandatory_registered_first_is_still_reported_by_name() {
    let mut registry = CleanupRegistry::new();
    registry.register_once("unsuppress all", Criticality::Mandatory, || async { Ok(()) });
    registry.register_once("unsuppress all", Criticality::BestEffort, || async {
        Err::<(), _>(E2eError::Driver("never runs".into()))
    });

    assert_eq!(registry.names(), vec!["unsuppress all"]);
    let report = registry.run().await;
    assert_eq!(report.outcomes[0].criticality, Criticality::Mandatory);
    assert!(report.all_succeeded());
}

#[tokio::test]
async fn unsuppress_all_removes_every_row() {
    let driver = suppression_page(3, true);
    let l = DashboardLocators::default();

    let report = coordinator(&driver).unsuppress_all().await.unwrap();

    assert_eq!(report.initial, 3);
    assert_eq!(report.iterations, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(driver.clicks(&l.suppression_remove_button), 3);
    assert_eq!(driver.clicks(&l.confirm_button), 3);
}

#[tokio::test]
async fn unsuppress_all_on_empty_table_does_nothing() {
    let driver = suppression_page(0, true);
    let l = DashboardLocators::default();

    let report = coordinator(&driver).unsuppress_all().await.unwrap();

    assert_eq!(report.iterations, 0);
    assert_eq!(driver.clicks(&l.suppression_remove_button), 0);
}

#[tokio::test]
async fn unsuppress_all_stops_at_the_iteration_ceiling() {
    let driver = suppression_page(3, false);
    let l = DashboardLocators::default();

    let err = coordinator(&driver)
        .with_max_unsuppress_iterations(4)
        .unsuppress_all()
        .await
        .unwrap_err();

    assert_eq!(driver.clicks(&l.suppression_remove_button), 4);
    match err {
        E2eError::StepFailed { step, reason } => {
            assert_eq!(step, "unsuppress all");
            assert!(reason.contains("3 suppressions remain after 4"), "{}", reason);
        }
        other => panic!("expected StepFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn stuck_suppression_fails_the_mandatory_cleanup() {
    let driver = suppression_page(1, false);
    let cleanup = coordinator(&driver).with_max_unsuppress_iterations(2);

    let mut registry = CleanupRegistry::new();
    registry.mandatory("unsuppress all", move || async move {
        cleanup.unsuppress_all().await.map(|_| ())
    });

    let result = registry.run().await.into_result();
    assert!(matches!(result, Err(E2eError::CleanupFailed { .. })));
}

#[tokio::test]
async fn delete_alert_removes_the_row() {
    let driver = FakeDriver::shared();
    let l = DashboardLocators::default();
    let title = "e2e disk full on db-02";
    let row = l.row_by_title(title);
    let delete = l.in_row(title, &l.alert_delete_button);

    let loc = l.clone();
    let (r, d) = (row.clone(), delete.clone());
    driver.on_goto(&l.stack_url(BASE, "all"), move |p| {
        p.show(&loc.stack_ready);
        p.set_count(&loc.alert_rows, 1);
        if p.var("deleted").is_none() {
            p.set_bbox(&r, BoundingBox::new(0.0, 120.0, 900.0, 48.0));
            p.show(&d);
        }
        Ok(())
    });
    let loc = l.clone();
    driver.on_click(&delete, move |p| {
        p.show(&loc.confirm_button);
        Ok(())
    });
    let (loc, r, d) = (l.clone(), row.clone(), delete.clone());
    driver.on_click(&l.confirm_button, move |p| {
        p.remove(&loc.confirm_button);
        p.remove(&r);
        p.remove(&d);
        p.set_count(&loc.alert_rows, 0);
        p.set_var("deleted", "true");
        Ok(())
    });

    coordinator(&driver).delete_alert(title).await.unwrap();

    assert_eq!(driver.count_calls(&format!("hover:{}", row)), 1);
    assert_eq!(driver.clicks(&delete), 1);
    assert_eq!(driver.with_page(|p| p.count(&row)), 0);

    // Second run finds nothing to do
    driver.reset_calls();
    coordinator(&driver).delete_alert(title).await.unwrap();
    assert_eq!(driver.clicks(&delete), 0);
}

#[tokio::test]
async fn reset_filters_clears_active_chip() {
    let driver = FakeDriver::shared();
    let l = DashboardLocators::default();

    let loc = l.clone();
    driver.on_goto(&l.stack_url(BASE, "critical"), move |p| {
        p.show(&loc.stack_ready);
        p.set_count(&loc.alert_rows, 2);
        if p.var("filtered").is_some() {
            p.show(&loc.active_filter_chip);
            p.show(&loc.clear_filters_button);
        }
        Ok(())
    });
    let loc = l.clone();
    driver.on_click(&l.clear_filters_button, move |p| {
        p.unset_var("filtered");
        p.hide(&loc.active_filter_chip);
        Ok(())
    });

    driver.with_page(|p| p.set_var("filtered", "source"));
    coordinator(&driver).reset_stack_filters("critical").await.unwrap();
    assert_eq!(driver.clicks(&l.clear_filters_button), 1);

    // Already clear: no click
    coordinator(&driver).reset_stack_filters("critical").await.unwrap();
    assert_eq!(driver.clicks(&l.clear_filters_button), 1);
}
