//! Adaptive wait policies against the scripted browser
//!
//! Stability is sampled from scripted bounding boxes, counts from scripted
//! count sequences, so every assertion is about sample numbers rather than
//! wall-clock luck.

use std::sync::Arc;
use std::time::Duration;

use alertwatch_common::config::WaitConfig;
use alertwatch_common::BoundingBox;
use alertwatch_e2e::driver::{BrowserDriver, WaitState};
use alertwatch_e2e::testing::FakeDriver;
use alertwatch_e2e::wait::{
    AdaptiveWaiter, CountStableOptions, ElementWait, Signature, StabilityOptions,
};
use alertwatch_e2e::E2eError;

fn waiter_for(driver: &Arc<FakeDriver>) -> AdaptiveWaiter {
    let driver: Arc<dyn BrowserDriver> = driver.clone();
    AdaptiveWaiter::new(
        driver,
        &WaitConfig {
            element_timeout_ms: 300,
            ..WaitConfig::default()
        },
    )
}

fn fast_stability(attempts: u32) -> StabilityOptions {
    StabilityOptions {
        attempts,
        interval: Duration::from_millis(1),
        threshold: 2,
    }
}

fn fast_counts(max_wait: Duration) -> CountStableOptions {
    CountStableOptions {
        minimum_wait: Duration::from_millis(1),
        max_wait,
        check_interval: Duration::from_millis(2),
        required_stable_checks: 2,
    }
}

fn bbox_at(x: f64) -> BoundingBox {
    BoundingBox::new(x, 40.0, 320.0, 48.0)
}

#[tokio::test]
async fn geometry_that_settles_after_three_samples_is_stable_by_the_fifth() {
    let driver = FakeDriver::shared();
    driver.script_boxes(
        "[data-testid=\"alert-row\"]",
        vec![bbox_at(0.0), bbox_at(60.0), bbox_at(120.0)],
    );

    let report = waiter_for(&driver)
        .wait_for_element_stable("[data-testid=\"alert-row\"]", Some(fast_stability(8)))
        .await;

    assert!(report.stable);
    assert!(report.samples_taken <= 5, "took {} samples", report.samples_taken);
    assert_eq!(report.samples_taken, 4);
    assert_eq!(report.signature, Some(Signature::Geometry(120, 40, 320, 48)));
}

#[tokio::test]
async fn geometry_that_never_repeats_gives_up_after_attempts() {
    let driver = FakeDriver::shared();
    let boxes = (0..20).map(|i| bbox_at(i as f64 * 10.0)).collect();
    driver.script_boxes("#drawer", boxes);

    let report = waiter_for(&driver)
        .wait_for_element_stable("#drawer", Some(fast_stability(5)))
        .await;

    assert!(!report.stable);
    assert_eq!(report.samples_taken, 5);
}

#[tokio::test]
async fn sub_pixel_jitter_counts_as_stable() {
    let driver = FakeDriver::shared();
    driver.script_boxes("#toast", vec![bbox_at(10.2), bbox_at(10.4)]);

    let report = waiter_for(&driver)
        .wait_for_element_stable("#toast", Some(fast_stability(4)))
        .await;

    assert!(report.stable);
    assert_eq!(report.samples_taken, 2);
}

#[tokio::test]
async fn text_is_sampled_when_there_is_no_geometry() {
    let driver = FakeDriver::shared();
    driver.with_page(|p| p.set_text("#status", "3 open"));

    let report = waiter_for(&driver)
        .wait_for_element_stable("#status", Some(fast_stability(4)))
        .await;

    assert!(report.stable);
    assert_eq!(report.signature, Some(Signature::Text("3 open".to_string())));
}

#[tokio::test]
async fn missing_element_is_never_stable() {
    let driver = FakeDriver::shared();

    let report = waiter_for(&driver)
        .wait_for_element_stable("#ghost", Some(fast_stability(3)))
        .await;

    assert!(!report.stable);
    assert_eq!(report.samples_taken, 3);
    assert_eq!(report.signature, None);
}

#[tokio::test]
async fn fallback_selector_matches_when_primary_is_absent() {
    let driver = FakeDriver::shared();
    driver.with_page(|p| p.show(".legacy-save"));

    let matched = waiter_for(&driver)
        .wait_for_element(
            "[data-testid=\"save\"]",
            ElementWait::visible()
                .with_timeout(Duration::from_millis(200))
                .with_fallbacks(["button.save", ".legacy-save"]),
        )
        .await
        .unwrap();

    assert_eq!(matched, ".legacy-save");
}

#[tokio::test]
async fn primary_selector_wins_when_present() {
    let driver = FakeDriver::shared();
    driver.with_page(|p| {
        p.show("[data-testid=\"save\"]");
        p.show(".legacy-save");
    });

    let matched = waiter_for(&driver)
        .wait_for_element(
            "[data-testid=\"save\"]",
            ElementWait::visible().with_fallbacks([".legacy-save"]),
        )
        .await
        .unwrap();

    assert_eq!(matched, "[data-testid=\"save\"]");
}

#[tokio::test]
async fn exhausted_fallbacks_report_every_selector() {
    let driver = FakeDriver::shared();

    let err = waiter_for(&driver)
        .wait_for_element(
            "#primary",
            ElementWait::visible()
                .with_timeout(Duration::from_millis(150))
                .with_fallbacks(["#secondary"]),
        )
        .await
        .unwrap_err();

    match err {
        E2eError::ElementNotFound {
            selectors,
            timeout_ms,
        } => {
            assert_eq!(selectors, vec!["#primary", "#secondary"]);
            assert_eq!(timeout_ms, 150);
        }
        other => panic!("expected ElementNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn detached_state_waits_for_removal() {
    let driver = FakeDriver::shared();
    driver.with_page(|p| p.show("#spinner"));

    let remover = driver.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        remover.with_page(|p| p.remove("#spinner"));
    });

    waiter_for(&driver)
        .wait_for_element(
            "#spinner",
            ElementWait::visible()
                .with_state(WaitState::Detached)
                .with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(driver.with_page(|p| p.count("#spinner")), 0);
}

#[tokio::test]
async fn count_settles_on_the_final_value() {
    let driver = FakeDriver::shared();
    driver.script_counts(".alert-row", vec![0, 2, 4, 5, 5, 5]);

    let report = waiter_for(&driver)
        .wait_for_count_stable(".alert-row", Some(fast_counts(Duration::from_secs(2))))
        .await
        .unwrap();

    assert!(report.stable);
    assert_eq!(report.count, 5);
    assert_eq!(report.polls, 6);
}

#[tokio::test]
async fn count_that_keeps_changing_returns_last_value_unstable() {
    let driver = FakeDriver::shared();
    driver.script_counts(".alert-row", (1..=10_000).collect());

    let report = waiter_for(&driver)
        .wait_for_count_stable(".alert-row", Some(fast_counts(Duration::from_millis(60))))
        .await
        .unwrap();

    assert!(!report.stable);
    assert!(report.count >= 1);
    assert_eq!(report.count as u32, report.polls);
}

#[tokio::test]
async fn empty_view_settles_at_zero() {
    let driver = FakeDriver::shared();

    let report = waiter_for(&driver)
        .wait_for_count_stable(".suppression-row", Some(fast_counts(Duration::from_secs(1))))
        .await
        .unwrap();

    assert!(report.stable);
    assert_eq!(report.count, 0);
}

#[tokio::test]
async fn any_visible_returns_the_key_that_appeared() {
    let driver = FakeDriver::shared();
    let shower = driver.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shower.with_page(|p| p.show("#signed-out"));
    });

    let candidates = [
        ("picker", "#account-picker".to_string()),
        ("signed_out", "#signed-out".to_string()),
    ];
    let key = waiter_for(&driver)
        .wait_for_any_visible(&candidates, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(key, "signed_out");
}

#[tokio::test]
async fn any_visible_times_out_when_nothing_shows() {
    let driver = FakeDriver::shared();
    let candidates = [(1u8, "#a".to_string()), (2u8, "#b".to_string())];

    let err = waiter_for(&driver)
        .wait_for_any_visible(&candidates, Duration::from_millis(120))
        .await
        .unwrap_err();

    assert!(matches!(err, E2eError::Timeout(_)));
}

#[tokio::test]
async fn wait_until_polls_until_condition_holds() {
    let driver = FakeDriver::shared();
    let waiter = waiter_for(&driver);
    let checks = std::sync::atomic::AtomicU32::new(0);

    waiter
        .wait_until("third check", Duration::from_secs(1), Duration::from_millis(1), || {
            let n = checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            async move { Ok(n >= 3) }
        })
        .await
        .unwrap();

    assert_eq!(checks.load(std::sync::atomic::Ordering::SeqCst), 3);
}
