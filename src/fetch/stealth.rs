//! Stealth browser fetches for detail pages
//!
//! A single headless Chromium instance, launched lazily on first use and
//! shared across fetches, routed through the rotator's local port. Evasion
//! covers the webdriver flag, WebGL vendor strings, plugin enumeration, and
//! WebRTC address leaks; HTTPS termination through the rotator requires
//! tolerating its CA, so certificate errors are ignored at launch.
//!
//! Each fetch opens a fresh page, attaches the routing header via CDP,
//! waits for navigation plus a humanized settle delay, and extracts the
//! rendered HTML.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::Browser;
use chromiumoxide::browser::{BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use futures::StreamExt;
use log::{error, info, trace, warn};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::resilience::classify::FetchFailure;
use crate::utils::{CHROME_USER_AGENT, FORWARD_INDEX_HEADER};

use super::FetchResponse;

/// Stealth browser settings
#[derive(Debug, Clone)]
pub struct StealthConfig {
    /// Rotator front-door, e.g. `http://127.0.0.1:8899`
    pub rotator_url: String,
    /// Chrome user data directory
    pub data_dir: PathBuf,
    /// Optional explicit Chrome executable
    pub chrome_executable: Option<PathBuf>,
}

struct BrowserState {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

/// Lazily-launched shared browser for stealth fetches
pub struct StealthFetcher {
    config: StealthConfig,
    state: Mutex<Option<Arc<BrowserState>>>,
}

impl StealthFetcher {
    #[must_use]
    pub fn new(config: StealthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Fetch one page through the browser, routed via `forward_index`
    pub async fn fetch(
        &self,
        url: &str,
        forward_index: usize,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchFailure> {
        let state = self
            .ensure_browser()
            .await
            .map_err(FetchFailure::from_error)?;

        let result = tokio::time::timeout(timeout, self.fetch_page(&state, url, forward_index)).await;

        match result {
            Ok(Ok(body)) => Ok(FetchResponse {
                status: 200,
                body,
                retry_after: None,
                elapsed: Duration::ZERO, // overwritten by the caller
                forward_index,
            }),
            Ok(Err(e)) => Err(FetchFailure::from_error(e)),
            Err(_) => Err(FetchFailure::from_error(anyhow!(
                "browser fetch timed out after {timeout:?} for {url}"
            ))),
        }
    }

    async fn fetch_page(
        &self,
        state: &BrowserState,
        url: &str,
        forward_index: usize,
    ) -> Result<String> {
        let page = state
            .browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser page")?;

        apply_evasions(&page).await?;

        // Routing header selects the forward inside the rotator
        let headers = serde_json::json!({ FORWARD_INDEX_HEADER: forward_index.to_string() });
        page.execute(
            SetExtraHttpHeadersParams::builder()
                .headers(Headers::new(headers))
                .build()
                .map_err(|e| anyhow!("Failed to build SetExtraHttpHeaders: {e}"))?,
        )
        .await
        .context("Failed to attach routing header")?;

        page.goto(url).await.context("Navigation failed")?;
        page.wait_for_navigation()
            .await
            .context("Page never settled")?;

        // Humanized settle: let late XHRs land and look less mechanical
        let settle_ms = rand::rng().random_range(400..1200);
        tokio::time::sleep(Duration::from_millis(settle_ms)).await;

        let html = page
            .content()
            .await
            .context("Failed to extract rendered HTML")?;

        if let Err(e) = page.close().await {
            trace!("Page close failed (browser may be recycling): {e}");
        }

        Ok(html)
    }

    async fn ensure_browser(&self) -> Result<Arc<BrowserState>> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(Arc::clone(state));
        }

        std::fs::create_dir_all(&self.config.data_dir)
            .context("Failed to create browser data directory")?;

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .window_size(1920, 1080)
            .user_data_dir(&self.config.data_dir)
            .headless_mode(HeadlessMode::default())
            .arg(format!("--user-agent={CHROME_USER_AGENT}"))
            .arg(format!("--proxy-server={}", self.config.rotator_url))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--ignore-certificate-errors")
            // WebRTC would leak the real IP around the rotator
            .arg("--webrtc-ip-handling-policy=disable_non_proxied_udp")
            .arg("--force-webrtc-ip-handling-policy")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--metrics-recording-only")
            .arg("--password-store=basic")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");

        if let Some(chrome) = &self.config.chrome_executable {
            builder = builder.chrome_executable(chrome.clone());
        }

        let browser_config = builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch stealth browser")?;

        let handler_task = tokio::task::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    let msg = e.to_string();
                    // Chrome emits CDP events chromiumoxide doesn't model;
                    // those deserialization misses are noise
                    let benign = msg.contains("data did not match any variant of untagged enum Message")
                        || msg.contains("Failed to deserialize WS response");
                    if benign {
                        trace!("Suppressed benign CDP error: {msg}");
                    } else {
                        error!("Browser handler error: {e:?}");
                    }
                }
            }
        });

        info!("Stealth browser launched");
        let state = Arc::new(BrowserState {
            browser,
            handler_task,
        });
        *guard = Some(Arc::clone(&state));
        Ok(state)
    }

    /// Close the browser and its handler task
    pub async fn shutdown(&self) {
        let Some(state) = self.state.lock().await.take() else {
            return;
        };
        match Arc::try_unwrap(state) {
            Ok(mut state) => {
                if let Err(e) = state.browser.close().await {
                    warn!("Browser close failed: {e}");
                }
                let _ = state.browser.wait().await;
                state.handler_task.abort();
            }
            Err(state) => {
                // In-flight fetches still hold the browser; abort the
                // handler and let the last Arc drop finish cleanup
                warn!("Browser busy at shutdown, aborting handler");
                state.handler_task.abort();
            }
        }
    }
}

/// Inject the evasion set into a fresh page
async fn apply_evasions(page: &chromiumoxide::Page) -> Result<()> {
    page.evaluate(
        r"
        Object.defineProperty(navigator, 'webdriver', { get: () => false });
        Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    ",
    )
    .await
    .context("Failed to inject navigator evasions")?;

    page.evaluate(
        r"
        if (window.WebGLRenderingContext) {
            const getParameter = WebGLRenderingContext.prototype.getParameter;
            WebGLRenderingContext.prototype.getParameter = new Proxy(getParameter, {
                apply: function(target, ctx, args) {
                    const param = (args && args[0]) || null;
                    if (param === 37445) { return 'Intel Inc.'; }
                    if (param === 37446) { return 'Intel Iris OpenGL Engine'; }
                    return Reflect.apply(target, ctx, args);
                }
            });
        }
    ",
    )
    .await
    .context("Failed to inject WebGL evasion")?;

    Ok(())
}
