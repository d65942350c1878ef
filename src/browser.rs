//! Browser engines and WebDriver-backed pages.
//!
//! Each engine is driven through its own W3C WebDriver server:
//! - Chromium via chromedriver
//! - Firefox via geckodriver
//! - WebKit via WebKitWebDriver
//!
//! A [`BrowserLauncher`] opens one fresh session per trial; nothing is reused
//! between trials.

use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::BrowserSettings;
use crate::page::{Page, PageError, PageResult};

/// A browser implementation trials run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Chromium,
    Firefox,
    Webkit,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Chromium => "chromium",
            Engine::Firefox => "firefox",
            Engine::Webkit => "webkit",
        }
    }

    /// Name of the WebDriver server binary for this engine
    pub fn driver_name(&self) -> &'static str {
        match self {
            Engine::Chromium => "chromedriver",
            Engine::Firefox => "geckodriver",
            Engine::Webkit => "WebKitWebDriver",
        }
    }

    /// Session capabilities for a headless (or headed) run at a viewport size
    pub fn capabilities(&self, headless: bool, width: u32, height: u32) -> serde_json::Map<String, serde_json::Value> {
        let mut caps = serde_json::Map::new();
        match self {
            Engine::Chromium => {
                let mut args = vec![
                    "--no-sandbox".to_string(),
                    "--disable-dev-shm-usage".to_string(),
                    format!("--window-size={},{}", width, height),
                    "--force-device-scale-factor=2".to_string(),
                ];
                if headless {
                    args.push("--headless=new".to_string());
                    args.push("--disable-gpu".to_string());
                }
                caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
            }
            Engine::Firefox => {
                let mut args = vec![format!("--width={}", width), format!("--height={}", height)];
                if headless {
                    args.push("--headless".to_string());
                }
                caps.insert("moz:firefoxOptions".to_string(), json!({ "args": args }));
            }
            Engine::Webkit => {
                let mut args = vec!["--automation".to_string()];
                if headless {
                    args.push("--headless".to_string());
                }
                caps.insert("browserName".to_string(), json!("MiniBrowser"));
                caps.insert("webkitgtk:browserOptions".to_string(), json!({ "args": args }));
            }
        }
        caps
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Engine::Chromium),
            "firefox" | "gecko" => Ok(Engine::Firefox),
            "webkit" | "safari" => Ok(Engine::Webkit),
            other => Err(format!(
                "unknown engine '{}': use chromium, firefox or webkit",
                other
            )),
        }
    }
}

/// Opens an isolated page for one trial
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, engine: Engine) -> PageResult<Box<dyn Page>>;
}

/// Launcher that opens a new WebDriver session per call
#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    settings: BrowserSettings,
}

impl WebDriverLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self, engine: Engine) -> PageResult<Box<dyn Page>> {
        let url = self.settings.webdriver_url(engine);
        let caps = engine.capabilities(
            self.settings.headless,
            self.settings.viewport_width,
            self.settings.viewport_height,
        );
        debug!("Connecting to {} at {}", engine.driver_name(), url);

        let mut builder = ClientBuilder::rustls().map_err(|e| PageError::Session(e.to_string()))?;
        builder.capabilities(caps);
        let client = builder
            .connect(url)
            .await
            .map_err(|e| {
                PageError::Session(format!(
                    "cannot start {} session at {} ({}): {}",
                    engine,
                    url,
                    engine.driver_name(),
                    e
                ))
            })?;

        // Best effort: some drivers reject window sizing in headless mode
        if let Err(e) = client
            .set_window_size(self.settings.viewport_width, self.settings.viewport_height)
            .await
        {
            debug!("Could not set window size on {}: {}", engine, e);
        }

        Ok(Box::new(WebDriverPage { client, engine }))
    }
}

/// A page inside a live WebDriver session
pub struct WebDriverPage {
    client: Client,
    engine: Engine,
}

impl WebDriverPage {
    async fn find(&self, selector: &str) -> PageResult<Element> {
        self.client
            .find(Locator::Css(selector))
            .await
            .map_err(|e| map_cmd_error(selector, e))
    }
}

fn map_cmd_error(selector: &str, err: CmdError) -> PageError {
    if err.is_no_such_element() {
        PageError::ElementNotFound(selector.to_string())
    } else {
        PageError::WebDriver(err.to_string())
    }
}

fn write_capture(path: &Path, png: &[u8]) -> PageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, png)?;
    Ok(())
}

#[async_trait]
impl Page for WebDriverPage {
    async fn goto(&self, url: &str) -> PageResult<()> {
        self.client
            .goto(url)
            .await
            .map_err(|e| PageError::WebDriver(format!("navigation to {} failed: {}", url, e)))
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> PageResult<()> {
        let element = self
            .client
            .wait()
            .at_most(timeout)
            .for_element(Locator::Css(selector))
            .await
            .map_err(|e| match e {
                CmdError::WaitTimeout => PageError::Timeout {
                    selector: selector.to_string(),
                    timeout,
                },
                other => map_cmd_error(selector, other),
            })?;

        // Present is not enough; poll until it is displayed
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if element.is_displayed().await.unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PageError::Timeout {
                    selector: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn screenshot(&self, path: &Path) -> PageResult<()> {
        let png = self
            .client
            .screenshot()
            .await
            .map_err(|e| PageError::Capture(e.to_string()))?;
        write_capture(path, &png)
    }

    async fn screenshot_element(&self, selector: &str, path: &Path) -> PageResult<()> {
        let png = self
            .find(selector)
            .await?
            .screenshot()
            .await
            .map_err(|e| PageError::Capture(e.to_string()))?;
        write_capture(path, &png)
    }

    async fn click(&self, selector: &str) -> PageResult<()> {
        self.find(selector)
            .await?
            .click()
            .await
            .map_err(|e| map_cmd_error(selector, e))
    }

    async fn fill(&self, selector: &str, text: &str) -> PageResult<()> {
        let input = self.find(selector).await?;
        input.clear().await.map_err(|e| map_cmd_error(selector, e))?;
        input
            .send_keys(text)
            .await
            .map_err(|e| map_cmd_error(selector, e))
    }

    async fn select_option(&self, selector: &str, value: &str) -> PageResult<()> {
        self.find(selector)
            .await?
            .select_by_value(value)
            .await
            .map_err(|e| map_cmd_error(selector, e))
    }

    async fn text(&self, selector: &str) -> PageResult<Option<String>> {
        let element = match self.find(selector).await {
            Ok(element) => element,
            Err(PageError::ElementNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !element
            .is_displayed()
            .await
            .map_err(|e| map_cmd_error(selector, e))?
        {
            return Ok(None);
        }
        element
            .text()
            .await
            .map(Some)
            .map_err(|e| map_cmd_error(selector, e))
    }

    async fn evaluate(&self, script: &str) -> PageResult<serde_json::Value> {
        self.client
            .execute(script, vec![])
            .await
            .map_err(|e| PageError::WebDriver(format!("script failed: {}", e)))
    }

    async fn close(&self) -> PageResult<()> {
        debug!("Ending {} session", self.engine);
        self.client
            .clone()
            .close()
            .await
            .map_err(|e| PageError::Session(format!("{} session did not close: {}", self.engine, e)))
    }
}

/// Check whether a WebDriver server answers its status endpoint.
///
/// Any HTTP response counts as reachable; only connection failures do not.
pub async fn check_webdriver(url: &str, timeout: Duration) -> bool {
    let status_url = format!("{}/status", url.trim_end_matches('/'));
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    client.get(&status_url).send().await.is_ok()
}
