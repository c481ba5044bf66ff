//! Scripted in-memory browser for integration tests
//!
//! [`FakeDriver`] keeps a map of selector → element state and records every
//! call. Behaviour is scripted with hooks that mutate the page when a
//! selector is clicked, a URL is visited or storage state is restored.
//! Counts and bounding boxes can be scripted as sequences to model a UI that
//! is still rendering.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alertwatch_common::{BoundingBox, StorageState};
use async_trait::async_trait;
use image::RgbaImage;
use parking_lot::Mutex;

use crate::driver::{BrowserDriver, LoadState, WaitState};
use crate::error::{E2eError, E2eResult};

const POLL: Duration = Duration::from_millis(5);

pub type Hook = Arc<dyn Fn(&mut FakePage) -> E2eResult<()> + Send + Sync>;
pub type RestoreHook = Arc<dyn Fn(&mut FakePage, &StorageState) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub count: usize,
    pub visible: bool,
    pub text: Option<String>,
    pub bbox: Option<BoundingBox>,
    pub value: String,
}

/// Mutable page state seen by hooks
#[derive(Debug)]
pub struct FakePage {
    pub url: String,
    elements: HashMap<String, FakeElement>,
    count_script: HashMap<String, VecDeque<usize>>,
    bbox_script: HashMap<String, VecDeque<BoundingBox>>,
    vars: HashMap<String, String>,
    storage: StorageState,
    /// Grey level of screenshots written by the fake
    pub screenshot_shade: u8,
}

impl Default for FakePage {
    fn default() -> Self {
        Self {
            url: "about:blank".to_string(),
            elements: HashMap::new(),
            count_script: HashMap::new(),
            bbox_script: HashMap::new(),
            vars: HashMap::new(),
            storage: StorageState {
                cookies: Vec::new(),
                origins: Vec::new(),
            },
            screenshot_shade: 128,
        }
    }
}

impl FakePage {
    pub fn show(&mut self, selector: &str) {
        let el = self.elements.entry(selector.to_string()).or_default();
        el.visible = true;
        el.count = el.count.max(1);
    }

    /// Keep the element attached but invisible
    pub fn hide(&mut self, selector: &str) {
        if let Some(el) = self.elements.get_mut(selector) {
            el.visible = false;
        }
    }

    pub fn remove(&mut self, selector: &str) {
        self.elements.remove(selector);
    }

    pub fn set_count(&mut self, selector: &str, count: usize) {
        let el = self.elements.entry(selector.to_string()).or_default();
        el.count = count;
        el.visible = count > 0;
    }

    pub fn set_text(&mut self, selector: &str, text: &str) {
        self.show(selector);
        if let Some(el) = self.elements.get_mut(selector) {
            el.text = Some(text.to_string());
        }
    }

    pub fn set_bbox(&mut self, selector: &str, bbox: BoundingBox) {
        self.show(selector);
        if let Some(el) = self.elements.get_mut(selector) {
            el.bbox = Some(bbox);
        }
    }

    pub fn value(&self, selector: &str) -> Option<&str> {
        self.elements.get(selector).map(|el| el.value.as_str())
    }

    pub fn is_visible(&self, selector: &str) -> bool {
        self.elements
            .get(selector)
            .is_some_and(|el| el.visible && el.count > 0)
    }

    pub fn count(&self, selector: &str) -> usize {
        self.elements.get(selector).map_or(0, |el| el.count)
    }

    pub fn text(&self, selector: &str) -> Option<String> {
        self.elements.get(selector).and_then(|el| el.text.clone())
    }

    /// Free-form state for hooks (who is signed in, which tenant, ...)
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set_var(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    pub fn unset_var(&mut self, key: &str) {
        self.vars.remove(key);
    }

    pub fn storage(&self) -> &StorageState {
        &self.storage
    }

    pub fn set_storage(&mut self, state: StorageState) {
        self.storage = state;
    }

    /// Drop every element, as a full navigation would
    pub fn clear_elements(&mut self) {
        self.elements.clear();
    }

    fn scripted_count(&mut self, selector: &str) -> Option<usize> {
        let queue = self.count_script.get_mut(selector)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        }
    }

    fn scripted_bbox(&mut self, selector: &str) -> Option<BoundingBox> {
        let queue = self.bbox_script.get_mut(selector)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        }
    }

    fn satisfies(&self, selector: &str, state: WaitState) -> bool {
        match state {
            WaitState::Visible => self.is_visible(selector),
            WaitState::Hidden => !self.is_visible(selector),
            WaitState::Attached => self.count(selector) > 0,
            WaitState::Detached => self.count(selector) == 0,
        }
    }
}

#[derive(Default)]
pub struct FakeDriver {
    page: Mutex<FakePage>,
    click_hooks: Mutex<HashMap<String, Vec<Hook>>>,
    goto_hooks: Mutex<Vec<(String, Hook)>>,
    restore_hook: Mutex<Option<RestoreHook>>,
    calls: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_page<R>(&self, f: impl FnOnce(&mut FakePage) -> R) -> R {
        f(&mut self.page.lock())
    }

    pub fn on_click<F>(&self, selector: &str, hook: F)
    where
        F: Fn(&mut FakePage) -> E2eResult<()> + Send + Sync + 'static,
    {
        self.click_hooks
            .lock()
            .entry(selector.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Run `hook` on every navigation to a URL starting with `prefix`
    pub fn on_goto<F>(&self, prefix: &str, hook: F)
    where
        F: Fn(&mut FakePage) -> E2eResult<()> + Send + Sync + 'static,
    {
        self.goto_hooks
            .lock()
            .push((prefix.to_string(), Arc::new(hook)));
    }

    pub fn on_restore<F>(&self, hook: F)
    where
        F: Fn(&mut FakePage, &StorageState) + Send + Sync + 'static,
    {
        *self.restore_hook.lock() = Some(Arc::new(hook));
    }

    /// Successive `count()` results for `selector`; the last value sticks
    pub fn script_counts(&self, selector: &str, counts: Vec<usize>) {
        self.page
            .lock()
            .count_script
            .insert(selector.to_string(), counts.into());
    }

    /// Successive `bounding_box()` results for `selector`; the last value sticks
    pub fn script_boxes(&self, selector: &str, boxes: Vec<BoundingBox>) {
        let mut page = self.page.lock();
        page.show(selector);
        page.bbox_script.insert(selector.to_string(), boxes.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls starting with `prefix`, e.g. `"click:#submit"`
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clicks(&self, selector: &str) -> usize {
        let call = format!("click:{}", selector);
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn run_hooks(&self, hooks: Vec<Hook>) -> E2eResult<()> {
        let mut page = self.page.lock();
        for hook in hooks {
            hook(&mut page)?;
        }
        Ok(())
    }

    fn require_visible(&self, selector: &str, action: &str) -> E2eResult<()> {
        if self.page.lock().is_visible(selector) {
            Ok(())
        } else {
            Err(E2eError::Driver(format!(
                "cannot {} '{}': element not visible",
                action, selector
            )))
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn goto(&self, url: &str) -> E2eResult<()> {
        self.record(format!("goto:{}", url));
        self.page.lock().url = url.to_string();
        let hooks: Vec<Hook> = self
            .goto_hooks
            .lock()
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, hook)| hook.clone())
            .collect();
        self.run_hooks(hooks)
    }

    async fn current_url(&self) -> E2eResult<String> {
        Ok(self.page.lock().url.clone())
    }

    async fn wait_for(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()> {
        let start = Instant::now();
        loop {
            if self.page.lock().satisfies(selector, state) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(E2eError::Timeout(format!(
                    "'{}' to be {}",
                    selector,
                    state.as_str()
                )));
            }
            tokio::time::sleep(POLL.min(timeout)).await;
        }
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        Ok(self.page.lock().is_visible(selector))
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.record(format!("click:{}", selector));
        self.require_visible(selector, "click")?;
        let hooks = self
            .click_hooks
            .lock()
            .get(selector)
            .cloned()
            .unwrap_or_default();
        self.run_hooks(hooks)
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.record(format!("fill:{}={}", selector, value));
        self.require_visible(selector, "fill")?;
        if let Some(el) = self.page.lock().elements.get_mut(selector) {
            el.value = value.to_string();
        }
        Ok(())
    }

    async fn hover(&self, selector: &str) -> E2eResult<()> {
        self.record(format!("hover:{}", selector));
        self.require_visible(selector, "hover")
    }

    async fn press(&self, selector: &str, key: &str) -> E2eResult<()> {
        self.record(format!("press:{}={}", selector, key));
        self.require_visible(selector, "press")
    }

    async fn count(&self, selector: &str) -> E2eResult<usize> {
        let mut page = self.page.lock();
        Ok(page
            .scripted_count(selector)
            .unwrap_or_else(|| page.count(selector)))
    }

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>> {
        Ok(self.page.lock().text(selector))
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        let mut page = self.page.lock();
        if let Some(bbox) = page.scripted_bbox(selector) {
            return Ok(Some(bbox));
        }
        Ok(page.elements.get(selector).and_then(|el| el.bbox))
    }

    async fn evaluate(&self, script: &str) -> E2eResult<serde_json::Value> {
        self.record(format!("evaluate:{}", script));
        Ok(serde_json::Value::String(
            "<html><body data-fake=\"true\"></body></html>".to_string(),
        ))
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        self.record(format!("screenshot:{}", path.display()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let shade = self.page.lock().screenshot_shade;
        RgbaImage::from_pixel(8, 8, image::Rgba([shade, shade, shade, 255])).save(path)?;
        Ok(())
    }

    async fn wait_for_load_state(&self, _state: LoadState, _timeout: Duration) -> E2eResult<()> {
        Ok(())
    }

    async fn storage_state(&self) -> E2eResult<StorageState> {
        Ok(self.page.lock().storage.clone())
    }

    async fn restore_storage_state(&self, state: &StorageState) -> E2eResult<()> {
        self.record("restore".to_string());
        let hook = self.restore_hook.lock().clone();
        let mut page = self.page.lock();
        page.clear_elements();
        page.url = "about:blank".to_string();
        page.storage = state.clone();
        if let Some(hook) = hook {
            hook(&mut page, state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_click_hook_mutates_page() {
        let driver = FakeDriver::new();
        driver.with_page(|p| p.show("#open"));
        driver.on_click("#open", |p| {
            p.show("#dialog");
            Ok(())
        });

        assert!(!driver.is_visible("#dialog").await.unwrap());
        driver.click("#open").await.unwrap();
        assert!(driver.is_visible("#dialog").await.unwrap());
        assert_eq!(driver.clicks("#open"), 1);
    }

    #[tokio::test]
    async fn test_click_on_hidden_element_fails() {
        let driver = FakeDriver::new();
        assert!(driver.click("#missing").await.is_err());
        assert_eq!(driver.clicks("#missing"), 1);
    }

    #[tokio::test]
    async fn test_scripted_counts_stick_on_last() {
        let driver = FakeDriver::new();
        driver.script_counts(".row", vec![1, 3, 5]);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(driver.count(".row").await.unwrap());
        }
        assert_eq!(seen, vec![1, 3, 5, 5, 5]);
    }
}
