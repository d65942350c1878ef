//! Page abstraction over a live browser tab.
//!
//! The trial runner, action executor and outcome verifier only talk to a
//! [`Page`]. Two implementations exist:
//! - `WebDriverPage` (in [`crate::browser`]) for real browsers
//! - [`MockPage`] for tests and dry runs, scripted with elements, script
//!   results and click reactions

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::{BrowserLauncher, Engine};

/// Result type for page operations
pub type PageResult<T> = Result<T, PageError>;

/// Errors that can occur while driving a page
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// Selector matched nothing
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// A bounded wait expired
    #[error("timed out after {timeout:?} waiting for {selector}")]
    Timeout { selector: String, timeout: Duration },

    /// Could not open a browser session
    #[error("session error: {0}")]
    Session(String),

    /// Any other WebDriver failure
    #[error("WebDriver error: {0}")]
    WebDriver(String),

    /// Screenshot could not be taken or written
    #[error("capture failed: {0}")]
    Capture(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PageError {
    /// Whether the error means "the element is not there" rather than a broken session
    pub fn is_missing_element(&self) -> bool {
        matches!(self, PageError::ElementNotFound(_))
    }
}

/// A page-like target the harness can drive.
///
/// All selectors are CSS selectors.
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate to a URL
    async fn goto(&self, url: &str) -> PageResult<()>;

    /// Wait until an element matching `selector` is displayed
    async fn wait_for(&self, selector: &str, timeout: Duration) -> PageResult<()>;

    /// Save a PNG of the viewport
    async fn screenshot(&self, path: &Path) -> PageResult<()>;

    /// Save a PNG of a single element
    async fn screenshot_element(&self, selector: &str, path: &Path) -> PageResult<()>;

    async fn click(&self, selector: &str) -> PageResult<()>;

    /// Replace the value of an input
    async fn fill(&self, selector: &str, text: &str) -> PageResult<()>;

    /// Choose an `<option>` by value
    async fn select_option(&self, selector: &str, value: &str) -> PageResult<()>;

    /// Text of a displayed element; `None` when absent or hidden
    async fn text(&self, selector: &str) -> PageResult<Option<String>>;

    /// Run a script (with an explicit `return`) and hand back its JSON value
    async fn evaluate(&self, script: &str) -> PageResult<serde_json::Value>;

    /// End the browser session
    async fn close(&self) -> PageResult<()>;
}

// ============================================================================
// MockPage
// ============================================================================

/// An interaction recorded by [`MockPage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    Goto(String),
    Click(String),
    Fill(String, String),
    Select(String, String),
    Screenshot(PathBuf),
    Close,
}

#[derive(Debug, Clone)]
struct MockElement {
    text: String,
    visible: bool,
}

#[derive(Debug, Clone)]
struct ClickReaction {
    reveal: String,
    text: String,
}

#[derive(Debug, Default)]
struct MockState {
    elements: HashMap<String, MockElement>,
    scripts: Vec<(String, serde_json::Value)>,
    reactions: HashMap<String, ClickReaction>,
    goto_error: Option<String>,
    panic_on_evaluate: bool,
}

/// A scripted in-memory page.
///
/// Provides enough behaviour to drive a full trial:
/// - `with_element()` / `with_hidden_element()` - register selectors
/// - `with_grid()` - register numbered cells from a `{position}` template
/// - `with_script()` - answer `evaluate()` calls whose script contains a needle
/// - `on_click()` - reveal a result element when a control is clicked
///
/// Every interaction is appended to a shared journal, readable after the page
/// has been handed to (and closed by) the code under test.
#[derive(Debug, Default)]
pub struct MockPage {
    state: Mutex<MockState>,
    journal: Arc<Mutex<Vec<PageAction>>>,
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a visible element with text
    pub fn with_element(self, selector: &str, text: &str) -> Self {
        self.insert(selector, text, true);
        self
    }

    /// Register an element that exists but is not displayed
    pub fn with_hidden_element(self, selector: &str) -> Self {
        self.insert(selector, "", false);
        self
    }

    /// Register `count` cells addressed by a template containing `{position}`
    pub fn with_grid(self, template: &str, count: u32) -> Self {
        for position in 1..=count {
            let selector = template.replace("{position}", &position.to_string());
            self.insert(&selector, "", true);
        }
        self
    }

    /// Answer scripts containing `needle` with `value`
    pub fn with_script(self, needle: &str, value: serde_json::Value) -> Self {
        self.lock().scripts.push((needle.to_string(), value));
        self
    }

    /// Clicking `selector` makes `reveal` visible with `text`
    pub fn on_click(self, selector: &str, reveal: &str, text: &str) -> Self {
        self.lock().reactions.insert(
            selector.to_string(),
            ClickReaction {
                reveal: reveal.to_string(),
                text: text.to_string(),
            },
        );
        self
    }

    /// Make navigation fail with a WebDriver error
    pub fn failing_goto(self, message: &str) -> Self {
        self.lock().goto_error = Some(message.to_string());
        self
    }

    /// Panic inside `evaluate()`, standing in for an unexpected fault
    pub fn panicking_evaluate(self) -> Self {
        self.lock().panic_on_evaluate = true;
        self
    }

    /// Share an existing journal (e.g. one per launcher)
    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<PageAction>>>) -> Self {
        self.journal = journal;
        self
    }

    /// Handle to the interaction journal
    pub fn journal(&self) -> Arc<Mutex<Vec<PageAction>>> {
        Arc::clone(&self.journal)
    }

    fn insert(&self, selector: &str, text: &str, visible: bool) {
        self.lock().elements.insert(
            selector.to_string(),
            MockElement {
                text: text.to_string(),
                visible,
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, action: PageAction) {
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    fn require(&self, selector: &str) -> PageResult<MockElement> {
        self.lock()
            .elements
            .get(selector)
            .cloned()
            .ok_or_else(|| PageError::ElementNotFound(selector.to_string()))
    }

    fn write_png(&self, path: &Path) -> PageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([240, 240, 240]));
        img.save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| PageError::Capture(e.to_string()))?;
        self.record(PageAction::Screenshot(path.to_path_buf()));
        Ok(())
    }
}

#[async_trait]
impl Page for MockPage {
    async fn goto(&self, url: &str) -> PageResult<()> {
        self.record(PageAction::Goto(url.to_string()));
        match self.lock().goto_error.clone() {
            Some(message) => Err(PageError::WebDriver(message)),
            None => Ok(()),
        }
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> PageResult<()> {
        match self.lock().elements.get(selector) {
            Some(element) if element.visible => Ok(()),
            _ => Err(PageError::Timeout {
                selector: selector.to_string(),
                timeout,
            }),
        }
    }

    async fn screenshot(&self, path: &Path) -> PageResult<()> {
        self.write_png(path)
    }

    async fn screenshot_element(&self, selector: &str, path: &Path) -> PageResult<()> {
        self.require(selector)?;
        self.write_png(path)
    }

    async fn click(&self, selector: &str) -> PageResult<()> {
        let element = self.require(selector)?;
        if !element.visible {
            return Err(PageError::WebDriver(format!(
                "element not interactable: {}",
                selector
            )));
        }
        self.record(PageAction::Click(selector.to_string()));

        let reaction = self.lock().reactions.get(selector).cloned();
        if let Some(reaction) = reaction {
            self.insert(&reaction.reveal, &reaction.text, true);
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> PageResult<()> {
        self.require(selector)?;
        self.record(PageAction::Fill(selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: &str) -> PageResult<()> {
        self.require(selector)?;
        self.record(PageAction::Select(selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn text(&self, selector: &str) -> PageResult<Option<String>> {
        Ok(self
            .lock()
            .elements
            .get(selector)
            .filter(|e| e.visible)
            .map(|e| e.text.clone()))
    }

    async fn evaluate(&self, script: &str) -> PageResult<serde_json::Value> {
        let state = self.lock();
        if state.panic_on_evaluate {
            drop(state);
            panic!("mock page script fault");
        }
        Ok(state
            .scripts
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, value)| value.clone())
            .unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) -> PageResult<()> {
        self.record(PageAction::Close);
        Ok(())
    }
}

// ============================================================================
// MockLauncher
// ============================================================================

type PageFactory = dyn Fn(Engine, usize) -> PageResult<MockPage> + Send + Sync;

/// Launcher handing out [`MockPage`]s from a factory.
///
/// The factory receives the engine and a 1-based launch counter, so tests can
/// vary the challenge per trial. All pages share one journal.
pub struct MockLauncher {
    factory: Box<PageFactory>,
    launches: Mutex<usize>,
    journal: Arc<Mutex<Vec<PageAction>>>,
}

impl MockLauncher {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(Engine, usize) -> PageResult<MockPage> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            launches: Mutex::new(0),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of pages launched so far
    pub fn launches(&self) -> usize {
        *self.launches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Interactions across every launched page
    pub fn journal(&self) -> Arc<Mutex<Vec<PageAction>>> {
        Arc::clone(&self.journal)
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, engine: Engine) -> PageResult<Box<dyn Page>> {
        let attempt = {
            let mut launches = self.launches.lock().unwrap_or_else(|e| e.into_inner());
            *launches += 1;
            *launches
        };
        let page = (self.factory)(engine, attempt)?.with_journal(Arc::clone(&self.journal));
        Ok(Box::new(page))
    }
}
