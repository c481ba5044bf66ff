//! Playwright browser automation
//!
//! A single `node` process runs an embedded bridge script that owns one
//! browser, one context and one page for the whole run. Requests and
//! responses are line-delimited JSON over the child's stdin/stdout:
//!
//! ```text
//! → {"id":7,"op":"click","args":{"selector":"[data-testid=\"login-submit\"]"}}
//! ← {"id":7,"ok":true,"result":null}
//! ```
//!
//! Keeping the browser alive between calls is what lets a signed-in session
//! survive from one scenario to the next.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use alertwatch_common::{BoundingBox, StorageState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{BrowserDriver, LoadState, WaitState};
use crate::error::{E2eError, E2eResult};

/// Extra time the bridge gets beyond the Playwright-side timeout
const BRIDGE_GRACE: Duration = Duration::from_secs(5);

/// How long the browser gets to launch
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

const BRIDGE_SCRIPT: &str = r#"
const readline = require('readline');
const pw = require(require.resolve('playwright', { paths: [process.cwd(), __dirname] }));
const cfg = JSON.parse(process.env.ALERTWATCH_BRIDGE_CONFIG || '{}');

let browser, context, page;

async function newContext(storageState) {
  if (context) await context.close();
  context = await browser.newContext({
    viewport: { width: cfg.viewportWidth, height: cfg.viewportHeight },
    storageState: storageState || undefined,
  });
  context.setDefaultTimeout(cfg.timeoutMs);
  page = await context.newPage();
}

const first = (a) => page.locator(a.selector).first();
const present = async (a) => (await page.locator(a.selector).count()) > 0;

const ops = {
  goto: async (a) => { await page.goto(a.url, { waitUntil: 'domcontentloaded' }); return null; },
  url: async () => page.url(),
  waitFor: async (a) => { await first(a).waitFor({ state: a.state, timeout: a.timeoutMs }); return null; },
  isVisible: async (a) => first(a).isVisible(),
  click: async (a) => { await first(a).click(); return null; },
  fill: async (a) => { await first(a).fill(a.value); return null; },
  hover: async (a) => { await first(a).hover(); return null; },
  press: async (a) => { await first(a).press(a.key); return null; },
  count: async (a) => page.locator(a.selector).count(),
  textContent: async (a) => (await present(a)) ? first(a).textContent() : null,
  boundingBox: async (a) => (await present(a)) ? first(a).boundingBox() : null,
  evaluate: async (a) => page.evaluate(a.script),
  screenshot: async (a) => { await page.screenshot({ path: a.path, fullPage: !!a.fullPage }); return null; },
  loadState: async (a) => { await page.waitForLoadState(a.state, { timeout: a.timeoutMs }); return null; },
  storageState: async () => context.storageState(),
  restore: async (a) => { await newContext(a.state); return null; },
  close: async () => null,
};

const out = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  browser = await pw[cfg.browser].launch({ headless: cfg.headless });
  await newContext(null);
  out({ id: 0, ok: true, result: 'ready' });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    if (!line.trim()) continue;
    let req;
    try {
      req = JSON.parse(line);
    } catch (e) {
      out({ id: -1, ok: false, error: 'bad request: ' + e.message });
      continue;
    }
    const op = ops[req.op];
    if (!op) {
      out({ id: req.id, ok: false, error: 'unknown op ' + req.op });
      continue;
    }
    try {
      const result = await op(req.args || {});
      out({ id: req.id, ok: true, result: result === undefined ? null : result });
    } catch (e) {
      out({ id: req.id, ok: false, error: e.message, timeout: e.name === 'TimeoutError' });
    }
    if (req.op === 'close') break;
  }
  await browser.close().catch(() => {});
  process.exit(0);
})().catch((e) => {
  process.stderr.write(String((e && e.stack) || e) + '\n');
  process.exit(1);
});
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" | "safari" => Ok(Browser::Webkit),
            other => Err(E2eError::Playwright(format!("unknown browser '{}'", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Playwright's default action timeout
    pub default_timeout: Duration,
    /// Directory `playwright` is resolved from; defaults to the current directory
    pub working_dir: Option<PathBuf>,
    pub node_binary: String,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            default_timeout: Duration::from_secs(15),
            working_dir: None,
            node_binary: "node".to_string(),
        }
    }
}

#[derive(Serialize)]
struct BridgeRequest<'a> {
    id: i64,
    op: &'a str,
    args: Value,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    id: i64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: bool,
}

struct Bridge {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Bridge {
    async fn read_response(&mut self, id: i64) -> E2eResult<BridgeResponse> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| E2eError::Playwright("bridge process exited".to_string()))?;
            match serde_json::from_str::<BridgeResponse>(&line) {
                Ok(response) if response.id == id => return Ok(response),
                Ok(response) => debug!("Discarding stale bridge response {}", response.id),
                Err(_) => debug!("[bridge] {}", line),
            }
        }
    }
}

/// [`BrowserDriver`] backed by a long-lived Playwright bridge process
pub struct PlaywrightDriver {
    config: PlaywrightConfig,
    bridge: Mutex<Bridge>,
    next_id: AtomicI64,
    _script_dir: tempfile::TempDir,
}

impl PlaywrightDriver {
    /// Check Playwright is installed, start the bridge and wait for the browser
    pub async fn launch(config: PlaywrightConfig) -> E2eResult<Self> {
        Self::check_playwright_installed()?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        let working_dir = match &config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let bridge_config = json!({
            "browser": config.browser.as_str(),
            "headless": config.headless,
            "viewportWidth": config.viewport_width,
            "viewportHeight": config.viewport_height,
            "timeoutMs": config.default_timeout.as_millis() as u64,
        });

        info!(
            "Launching {} ({}) via Playwright bridge",
            config.browser.as_str(),
            if config.headless { "headless" } else { "headed" }
        );
        let mut child = TokioCommand::new(&config.node_binary)
            .arg(&script_path)
            .current_dir(&working_dir)
            .env("ALERTWATCH_BRIDGE_CONFIG", bridge_config.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Playwright(format!("failed to start {}: {}", config.node_binary, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[bridge] {}", line);
                }
            });
        }

        let mut bridge = Bridge {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        let ready = tokio::time::timeout(LAUNCH_TIMEOUT, bridge.read_response(0))
            .await
            .map_err(|_| E2eError::Playwright("browser did not start in time".to_string()))??;
        if !ready.ok {
            return Err(E2eError::Playwright(
                ready.error.unwrap_or_else(|| "browser launch failed".to_string()),
            ));
        }
        debug!("Playwright bridge ready");

        Ok(Self {
            config,
            bridge: Mutex::new(bridge),
            next_id: AtomicI64::new(1),
            _script_dir: script_dir,
        })
    }

    /// Check if Playwright is installed
    fn check_playwright_installed() -> E2eResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    pub fn config(&self) -> &PlaywrightConfig {
        &self.config
    }

    /// Close the browser and wait for the bridge to exit
    pub async fn close(self) -> E2eResult<()> {
        if let Err(e) = self.call("close", json!({})).await {
            warn!("Bridge close request failed: {}", e);
        }
        let mut bridge = self.bridge.into_inner();
        drop(bridge.stdin);
        match tokio::time::timeout(BRIDGE_GRACE, bridge.child.wait()).await {
            Ok(status) => debug!("Bridge exited: {:?}", status?),
            Err(_) => {
                warn!("Bridge did not exit; killing it");
                bridge.child.kill().await?;
            }
        }
        Ok(())
    }

    async fn call(&self, op: &str, args: Value) -> E2eResult<Value> {
        self.call_within(op, args, self.config.default_timeout).await
    }

    /// Send one request; `timeout` is the Playwright-side budget
    async fn call_within(&self, op: &str, args: Value, timeout: Duration) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(&BridgeRequest { id, op, args })?;
        line.push('\n');

        let mut bridge = self.bridge.lock().await;
        bridge.stdin.write_all(line.as_bytes()).await?;
        bridge.stdin.flush().await?;

        let response = tokio::time::timeout(timeout + BRIDGE_GRACE, bridge.read_response(id))
            .await
            .map_err(|_| E2eError::Timeout(format!("bridge '{}' did not answer", op)))??;

        if response.ok {
            Ok(response.result)
        } else if response.timeout {
            Err(E2eError::Timeout(
                response.error.unwrap_or_else(|| op.to_string()),
            ))
        } else {
            Err(E2eError::Playwright(
                response.error.unwrap_or_else(|| format!("'{}' failed", op)),
            ))
        }
    }

    async fn call_selector(&self, op: &str, selector: &str) -> E2eResult<Value> {
        self.call(op, json!({ "selector": selector })).await
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn goto(&self, url: &str) -> E2eResult<()> {
        debug!("goto {}", url);
        self.call("goto", json!({ "url": url })).await.map(|_| ())
    }

    async fn current_url(&self) -> E2eResult<String> {
        let value = self.call("url", json!({})).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn wait_for(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()> {
        let args = json!({
            "selector": selector,
            "state": state.as_str(),
            "timeoutMs": timeout.as_millis() as u64,
        });
        self.call_within("waitFor", args, timeout).await.map(|_| ())
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        let value = self.call_selector("isVisible", selector).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        debug!("click {}", selector);
        self.call_selector("click", selector).await.map(|_| ())
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.call("fill", json!({ "selector": selector, "value": value }))
            .await
            .map(|_| ())
    }

    async fn hover(&self, selector: &str) -> E2eResult<()> {
        self.call_selector("hover", selector).await.map(|_| ())
    }

    async fn press(&self, selector: &str, key: &str) -> E2eResult<()> {
        self.call("press", json!({ "selector": selector, "key": key }))
            .await
            .map(|_| ())
    }

    async fn count(&self, selector: &str) -> E2eResult<usize> {
        let value = self.call_selector("count", selector).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>> {
        let value = self.call_selector("textContent", selector).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        let value = self.call_selector("boundingBox", selector).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn evaluate(&self, script: &str) -> E2eResult<Value> {
        self.call("evaluate", json!({ "script": script })).await
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.call(
            "screenshot",
            json!({ "path": path.to_string_lossy(), "fullPage": false }),
        )
        .await
        .map(|_| ())
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> E2eResult<()> {
        let args = json!({ "state": state.as_str(), "timeoutMs": timeout.as_millis() as u64 });
        self.call_within("loadState", args, timeout).await.map(|_| ())
    }

    async fn storage_state(&self) -> E2eResult<StorageState> {
        let value = self.call("storageState", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn restore_storage_state(&self, state: &StorageState) -> E2eResult<()> {
        info!("Recreating browser context from stored state ({} cookies)", state.cookies.len());
        self.call("restore", json!({ "state": state })).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_from_str() {
        assert_eq!("Chromium".parse::<Browser>().unwrap(), Browser::Chromium);
        assert_eq!("safari".parse::<Browser>().unwrap(), Browser::Webkit);
        assert!("lynx".parse::<Browser>().is_err());
    }

    #[test]
    fn test_bridge_response_parsing() {
        let ok: BridgeResponse =
            serde_json::from_str(r#"{"id":3,"ok":true,"result":{"x":1,"y":2,"width":3,"height":4}}"#)
                .unwrap();
        assert!(ok.ok);
        let bbox: BoundingBox = serde_json::from_value(ok.result).unwrap();
        assert_eq!(bbox.rounded(), (1, 2, 3, 4));

        let timeout: BridgeResponse = serde_json::from_str(
            r#"{"id":4,"ok":false,"error":"Timeout 500ms exceeded","timeout":true}"#,
        )
        .unwrap();
        assert!(timeout.timeout);
        assert_eq!(timeout.error.as_deref(), Some("Timeout 500ms exceeded"));
    }

    #[test]
    fn test_bridge_script_covers_driver_ops() {
        for op in [
            "goto", "url", "waitFor", "isVisible", "click", "fill", "hover", "press", "count",
            "textContent", "boundingBox", "evaluate", "screenshot", "loadState", "storageState",
            "restore", "close",
        ] {
            assert!(BRIDGE_SCRIPT.contains(&format!("  {}: async", op)), "missing op {}", op);
        }
    }
}
