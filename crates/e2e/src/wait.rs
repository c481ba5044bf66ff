//! Adaptive waits
//!
//! Condition polling in place of fixed sleeps. Three named policies cover
//! every wait in the harness:
//! - element presence, with ordered fallback selectors ([`first_success`])
//! - stability of a sampled signature (geometry or text) over consecutive samples
//! - convergence of a count over consecutive polls
//!
//! Every wait is bounded and says what happens at the boundary: element waits
//! fail with [`E2eError::ElementNotFound`], stability waits proceed
//! optimistically with `stable: false`, count waits return the last count.
//! A generic "network idle" signal is never used; the dashboard streams
//! updates and would never report idle.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alertwatch_common::config::WaitConfig;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::driver::{BrowserDriver, WaitState};
use crate::error::{E2eError, E2eResult};

/// Smallest slice any strategy gets, so late fallbacks still get one real check
const MIN_STRATEGY_SHARE: Duration = Duration::from_millis(100);

const ANY_VISIBLE_POLL: Duration = Duration::from_millis(100);

/// How a total timeout budget is divided between ordered strategies
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeoutSplit {
    /// Each strategy gets an equal share of whatever budget remains
    EvenShare,
    /// The first strategy gets this fraction of the budget, the rest share the remainder evenly
    PrimaryShare(f64),
}

impl Default for TimeoutSplit {
    fn default() -> Self {
        TimeoutSplit::PrimaryShare(0.5)
    }
}

impl TimeoutSplit {
    fn share(&self, index: usize, total: usize, budget: Duration, remaining: Duration) -> Duration {
        let left = (total - index).max(1) as u32;
        let share = match self {
            TimeoutSplit::PrimaryShare(fraction) if index == 0 && total > 1 => {
                budget.mul_f64(fraction.clamp(0.0, 1.0))
            }
            _ => remaining / left,
        };
        share.min(remaining).max(MIN_STRATEGY_SHARE)
    }
}

type StrategyFn<'a, T> = Box<dyn FnOnce(Duration) -> BoxFuture<'a, E2eResult<T>> + Send + 'a>;

/// One named way of obtaining a `T` within a given time slice
pub struct Strategy<'a, T> {
    name: String,
    run: StrategyFn<'a, T>,
}

impl<'a, T> Strategy<'a, T> {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(Duration) -> BoxFuture<'a, E2eResult<T>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Run strategies in order; the first success wins.
///
/// Each strategy receives its time slice and is also cut off at that slice.
/// Fails only after every strategy has failed, with all their errors listed.
pub async fn first_success<'a, T>(
    strategies: Vec<Strategy<'a, T>>,
    budget: Duration,
    split: TimeoutSplit,
) -> E2eResult<(String, T)> {
    let start = Instant::now();
    let total = strategies.len();
    let mut failures = Vec::with_capacity(total);

    for (index, strategy) in strategies.into_iter().enumerate() {
        let remaining = budget.saturating_sub(start.elapsed());
        let share = split.share(index, total, budget, remaining);
        debug!("Strategy '{}' gets {} ms", strategy.name, share.as_millis());

        let Strategy { name, run } = strategy;
        match tokio::time::timeout(share, run(share)).await {
            Ok(Ok(value)) => return Ok((name, value)),
            Ok(Err(e)) => failures.push(format!("{}: {}", name, e)),
            Err(_) => failures.push(format!("{}: timed out after {} ms", name, share.as_millis())),
        }
    }

    Err(E2eError::Timeout(format!(
        "no strategy succeeded ({})",
        failures.join("; ")
    )))
}

/// Comparable fingerprint of a sampled UI property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Bounding box rounded to whole pixels
    Geometry(i64, i64, i64, i64),
    Text(String),
    Count(usize),
}

/// Running tally of consecutive equal samples
#[derive(Debug, Clone, Default)]
pub struct StabilityObservation {
    pub signature: Option<Signature>,
    pub consecutive_matches: u32,
    pub samples_taken: u32,
}

impl StabilityObservation {
    /// Record a sample. `consecutive_matches` is the length of the current run
    /// of identical samples; a missing sample breaks the run.
    pub fn observe(&mut self, sample: Option<Signature>) {
        self.samples_taken += 1;
        match sample {
            Some(sig) if self.signature.as_ref() == Some(&sig) => {
                self.consecutive_matches += 1;
            }
            Some(sig) => {
                self.signature = Some(sig);
                self.consecutive_matches = 1;
            }
            None => {
                self.signature = None;
                self.consecutive_matches = 0;
            }
        }
    }

    pub fn is_stable(&self, threshold: u32) -> bool {
        self.signature.is_some() && self.consecutive_matches >= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityOptions {
    /// Samples taken before giving up and proceeding anyway
    pub attempts: u32,
    pub interval: Duration,
    /// Consecutive identical samples needed
    pub threshold: u32,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            attempts: 6,
            interval: Duration::from_millis(150),
            threshold: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StabilityReport {
    pub stable: bool,
    pub samples_taken: u32,
    pub signature: Option<Signature>,
    pub elapsed: Duration,
}

/// Sample until `threshold` consecutive samples match or `attempts` samples are taken.
///
/// Never fails: sampling errors count as a missing sample and an unstable
/// result is reported, not raised.
pub async fn wait_for_stability<F, Fut>(mut sample: F, options: StabilityOptions) -> StabilityReport
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<Option<Signature>>>,
{
    let start = Instant::now();
    let attempts = options.attempts.max(1);
    let mut observation = StabilityObservation::default();

    for n in 1..=attempts {
        let sig = match sample().await {
            Ok(sig) => sig,
            Err(e) => {
                debug!("Stability sample {} failed: {}", n, e);
                None
            }
        };
        observation.observe(sig);

        if observation.is_stable(options.threshold) {
            debug!("Stable after {} samples", observation.samples_taken);
            return StabilityReport {
                stable: true,
                samples_taken: observation.samples_taken,
                signature: observation.signature,
                elapsed: start.elapsed(),
            };
        }

        if n < attempts {
            tokio::time::sleep(options.interval).await;
        }
    }

    debug!(
        "Not stable after {} samples, proceeding",
        observation.samples_taken
    );
    StabilityReport {
        stable: false,
        samples_taken: observation.samples_taken,
        signature: observation.signature,
        elapsed: start.elapsed(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountStableOptions {
    /// Always waited before the first poll
    pub minimum_wait: Duration,
    /// Overall cap, measured from the start of the call
    pub max_wait: Duration,
    pub check_interval: Duration,
    /// Consecutive unchanged polls (after the first) needed
    pub required_stable_checks: u32,
}

impl Default for CountStableOptions {
    fn default() -> Self {
        Self {
            minimum_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(8),
            check_interval: Duration::from_millis(300),
            required_stable_checks: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountReport {
    pub count: usize,
    pub stable: bool,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Wait for a count to stop changing.
///
/// Sleeps `minimum_wait`, then polls every `check_interval`. Stable once the
/// count is unchanged for `required_stable_checks` polls in a row; otherwise
/// the last count is returned when `max_wait` runs out. Fails only if no poll
/// ever produced a count.
pub async fn wait_for_count_stable<F, Fut>(
    mut counter: F,
    options: CountStableOptions,
) -> E2eResult<CountReport>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<usize>>,
{
    let start = Instant::now();
    tokio::time::sleep(options.minimum_wait).await;

    let mut last: Option<usize> = None;
    let mut stable_checks = 0u32;
    let mut polls = 0u32;
    let mut last_error: Option<E2eError> = None;

    loop {
        polls += 1;
        match counter().await {
            Ok(count) => {
                if last == Some(count) {
                    stable_checks += 1;
                } else {
                    stable_checks = 0;
                    last = Some(count);
                }
                if stable_checks >= options.required_stable_checks {
                    return Ok(CountReport {
                        count,
                        stable: true,
                        polls,
                        elapsed: start.elapsed(),
                    });
                }
            }
            Err(e) => {
                debug!("Count poll {} failed: {}", polls, e);
                stable_checks = 0;
                last_error = Some(e);
            }
        }

        let remaining = options.max_wait.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(options.check_interval.min(remaining)).await;
    }

    match last {
        Some(count) => {
            debug!("Count did not settle within {:?}; last value {}", options.max_wait, count);
            Ok(CountReport {
                count,
                stable: false,
                polls,
                elapsed: start.elapsed(),
            })
        }
        None => Err(E2eError::Timeout(format!(
            "no count observed within {} ms{}",
            options.max_wait.as_millis(),
            last_error.map(|e| format!(" (last error: {})", e)).unwrap_or_default()
        ))),
    }
}

/// Element wait request
#[derive(Debug, Clone, Default)]
pub struct ElementWait {
    /// Total budget across primary and fallbacks; None uses the waiter default
    pub timeout: Option<Duration>,
    pub state: WaitState,
    pub fallback_selectors: Vec<String>,
    pub split: TimeoutSplit,
}

impl ElementWait {
    pub fn visible() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_state(mut self, state: WaitState) -> Self {
        self.state = state;
        self
    }

    pub fn with_fallbacks<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_selectors = selectors.into_iter().map(Into::into).collect();
        self
    }
}

/// Driver-backed front end for the wait policies
#[derive(Clone)]
pub struct AdaptiveWaiter {
    driver: Arc<dyn BrowserDriver>,
    element_timeout: Duration,
    stability: StabilityOptions,
    count: CountStableOptions,
}

impl AdaptiveWaiter {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: &WaitConfig) -> Self {
        Self {
            driver,
            element_timeout: Duration::from_millis(config.element_timeout_ms),
            stability: StabilityOptions {
                attempts: config.stability_attempts,
                interval: Duration::from_millis(config.stability_interval_ms),
                threshold: 2,
            },
            count: CountStableOptions {
                minimum_wait: Duration::from_millis(config.count_minimum_wait_ms),
                max_wait: Duration::from_millis(config.count_max_wait_ms),
                check_interval: Duration::from_millis(config.count_check_interval_ms),
                required_stable_checks: config.count_required_stable_checks,
            },
        }
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    pub fn stability_defaults(&self) -> StabilityOptions {
        self.stability
    }

    pub fn count_defaults(&self) -> CountStableOptions {
        self.count
    }

    /// Wait for `selector`, then each fallback in turn. Returns the selector that matched.
    pub async fn wait_for_element(&self, selector: &str, wait: ElementWait) -> E2eResult<String> {
        let budget = wait.timeout.unwrap_or(self.element_timeout);
        let state = wait.state;

        let mut selectors = vec![selector.to_string()];
        selectors.extend(wait.fallback_selectors.iter().cloned());

        let strategies: Vec<Strategy<'_, ()>> = selectors
            .iter()
            .map(|sel| {
                let driver = self.driver.clone();
                let sel = sel.clone();
                Strategy::new(sel.clone(), move |share| {
                    async move { driver.wait_for(&sel, state, share).await }.boxed()
                })
            })
            .collect();

        match first_success(strategies, budget, wait.split).await {
            Ok((matched, ())) => {
                if matched != selector {
                    info!("'{}' not found, matched fallback '{}'", selector, matched);
                }
                Ok(matched)
            }
            Err(e) => {
                debug!("Element wait exhausted: {}", e);
                Err(E2eError::ElementNotFound {
                    selectors,
                    timeout_ms: budget.as_millis() as u64,
                })
            }
        }
    }

    /// Wait until the element's geometry (or text, when it has no box) stops changing
    pub async fn wait_for_element_stable(
        &self,
        selector: &str,
        options: Option<StabilityOptions>,
    ) -> StabilityReport {
        let options = options.unwrap_or(self.stability);
        let report = wait_for_stability(
            || async move {
                let sig = match self.driver.bounding_box(selector).await? {
                    Some(bbox) => {
                        let (x, y, w, h) = bbox.rounded();
                        Some(Signature::Geometry(x, y, w, h))
                    }
                    None => self.driver.text_content(selector).await?.map(Signature::Text),
                };
                Ok::<_, E2eError>(sig)
            },
            options,
        )
        .await;
        if !report.stable {
            warn!(
                "'{}' still moving after {} samples; continuing",
                selector, report.samples_taken
            );
        }
        report
    }

    /// Wait for the number of elements matching `selector` to settle
    pub async fn wait_for_count_stable(
        &self,
        selector: &str,
        options: Option<CountStableOptions>,
    ) -> E2eResult<CountReport> {
        let options = options.unwrap_or(self.count);
        wait_for_count_stable(|| self.driver.count(selector), options).await
    }

    /// Poll the candidates until one is visible; returns its key
    pub async fn wait_for_any_visible<K: Clone>(
        &self,
        candidates: &[(K, String)],
        timeout: Duration,
    ) -> E2eResult<K> {
        let start = Instant::now();
        loop {
            for (key, selector) in candidates {
                if self.driver.is_visible(selector).await.unwrap_or(false) {
                    return Ok(key.clone());
                }
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                let selectors: Vec<&str> = candidates.iter().map(|(_, s)| s.as_str()).collect();
                return Err(E2eError::Timeout(format!(
                    "none of {:?} became visible within {} ms",
                    selectors,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(ANY_VISIBLE_POLL.min(remaining)).await;
        }
    }

    /// Poll `condition` until it holds or `timeout` elapses
    pub async fn wait_until<F, Fut>(
        &self,
        description: &str,
        timeout: Duration,
        interval: Duration,
        mut condition: F,
    ) -> E2eResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<bool>>,
    {
        let start = Instant::now();
        loop {
            match condition().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!("Condition '{}' check failed: {}", description, e),
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(E2eError::Timeout(description.to_string()));
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_share_divides_remaining() {
        let split = TimeoutSplit::EvenShare;
        let budget = Duration::from_millis(900);
        assert_eq!(split.share(0, 3, budget, budget), Duration::from_millis(300));
        assert_eq!(
            split.share(1, 3, budget, Duration::from_millis(600)),
            Duration::from_millis(300)
        );
        assert_eq!(
            split.share(2, 3, budget, Duration::from_millis(50)),
            MIN_STRATEGY_SHARE
        );
    }

    #[test]
    fn test_primary_share() {
        let split = TimeoutSplit::PrimaryShare(0.5);
        let budget = Duration::from_millis(1000);
        assert_eq!(split.share(0, 3, budget, budget), Duration::from_millis(500));
        assert_eq!(
            split.share(1, 3, budget, Duration::from_millis(500)),
            Duration::from_millis(250)
        );
        // A lone primary gets everything
        assert_eq!(split.share(0, 1, budget, budget), budget);
    }

    #[test]
    fn test_observation_run_length() {
        let mut obs = StabilityObservation::default();
        obs.observe(Some(Signature::Count(1)));
        assert_eq!(obs.consecutive_matches, 1);
        obs.observe(Some(Signature::Count(1)));
        assert!(obs.is_stable(2));
        obs.observe(None);
        assert!(!obs.is_stable(1));
        assert_eq!(obs.samples_taken, 3);
    }
}
