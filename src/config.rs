//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for captcha-vision, supporting:
//! - Environment variables for all configurable values
//! - Defaults matching the demo challenge pages
//! - Startup validation so missing credentials fail before any browser starts
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CAPTCHA_VISION_VLM_ENDPOINT` | Chat-completions endpoint URL | DashScope compatible mode |
//! | `CAPTCHA_VISION_VLM_MODEL` | Vision model name | `qwen-vl-max-latest` |
//! | `CAPTCHA_VISION_VLM_API_KEY` | Bearer credential (falls back to `DASHSCOPE_API_KEY`) | none |
//! | `CAPTCHA_VISION_VLM_MAX_TOKENS` | Maximum tokens in a response | `2000` |
//! | `CAPTCHA_VISION_VLM_TEMPERATURE` | Sampling temperature | `0.1` |
//! | `CAPTCHA_VISION_VLM_TIMEOUT` | Request bound in seconds | `60` |
//! | `CAPTCHA_VISION_WEBDRIVER_CHROMIUM` | chromedriver URL | `http://localhost:9515` |
//! | `CAPTCHA_VISION_WEBDRIVER_FIREFOX` | geckodriver URL | `http://localhost:4444` |
//! | `CAPTCHA_VISION_WEBDRIVER_WEBKIT` | WebKitWebDriver URL | `http://localhost:4445` |
//! | `CAPTCHA_VISION_HEADLESS` | Run browsers headless | `true` |
//! | `CAPTCHA_VISION_KIND` | Challenge kind | `chinese-click` |
//! | `CAPTCHA_VISION_ENGINES` | Comma-separated engines | `chromium,firefox,webkit` |
//! | `CAPTCHA_VISION_TRIALS` | Trials per engine | `30` |
//! | `CAPTCHA_VISION_INTER_TRIAL_DELAY` | Delay between trials (ms) | `2000` |
//! | `CAPTCHA_VISION_TRIAL_TIMEOUT` | Bound on a whole trial (seconds) | `180` |
//! | `CAPTCHA_VISION_OCR_TIMEOUT` | Bound on one tesseract run (seconds) | `30` |
//! | `CAPTCHA_VISION_REPORT_DIR` | Report directory | `./experiment-results` |
//! | `CAPTCHA_VISION_EVIDENCE_DIR` | Screenshot directory | `./experiment-evidence` |
//!
//! Per-kind page URLs and success markers use `CAPTCHA_VISION_{MATH,CHINESE,LOGIN}_URL`
//! and `CAPTCHA_VISION_{MATH,CHINESE,LOGIN}_SUCCESS_MARKER`.
//!
//! # Example
//!
//! ```bash
//! export CAPTCHA_VISION_VLM_API_KEY="sk-..."
//! export CAPTCHA_VISION_ENGINES="chromium,firefox"
//! export CAPTCHA_VISION_TRIALS=10
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::browser::Engine;
use crate::challenge::{ChallengeKind, ChallengePage};

// ============================================================================
// Default Values
// ============================================================================

/// Default chat-completions endpoint
pub const DEFAULT_VLM_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";

/// Default vision model
pub const DEFAULT_VLM_MODEL: &str = "qwen-vl-max-latest";

/// Default max tokens for VLM responses
pub const DEFAULT_VLM_MAX_TOKENS: u32 = 2000;

/// Default sampling temperature (low for stable output)
pub const DEFAULT_VLM_TEMPERATURE: f32 = 0.1;

/// Default VLM request timeout (seconds)
pub const DEFAULT_VLM_TIMEOUT: u64 = 60;

/// Default system prompt sent ahead of every instruction
pub const DEFAULT_VLM_SYSTEM_PROMPT: &str = "You are a meticulous UI testing assistant. \
Follow the user's instructions exactly and answer only in the requested format.";

/// Default WebDriver endpoints per engine
pub const DEFAULT_WEBDRIVER_CHROMIUM: &str = "http://localhost:9515";
pub const DEFAULT_WEBDRIVER_FIREFOX: &str = "http://localhost:4444";
pub const DEFAULT_WEBDRIVER_WEBKIT: &str = "http://localhost:4445";

/// Default viewport
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 800;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 600;

/// Default bound on page load / ready selector (milliseconds)
pub const DEFAULT_PAGE_LOAD_TIMEOUT: u64 = 10_000;

/// Default bound on the result banner appearing (milliseconds)
pub const DEFAULT_RESULT_TIMEOUT: u64 = 5_000;

/// Default pause between grid clicks (milliseconds)
pub const DEFAULT_CLICK_DELAY: u64 = 200;

/// Default trials per engine
pub const DEFAULT_TRIALS_PER_ENGINE: usize = 30;

/// Default engine list
pub const DEFAULT_ENGINES: &str = "chromium,firefox,webkit";

/// Default delay between trials against the rate-limited service (milliseconds)
pub const DEFAULT_INTER_TRIAL_DELAY: u64 = 2_000;

/// Default bound on a whole trial (seconds)
pub const DEFAULT_TRIAL_TIMEOUT: u64 = 180;

/// Default bound on one tesseract run (seconds)
pub const DEFAULT_OCR_TIMEOUT: u64 = 30;

/// Default directory for experiment reports
pub const DEFAULT_REPORT_DIR: &str = "./experiment-results";

/// Default directory for before/after screenshots
pub const DEFAULT_EVIDENCE_DIR: &str = "./experiment-evidence";

/// Default demo page locations
pub const DEFAULT_MATH_URL: &str = "http://localhost:3000/math-captcha.html";
pub const DEFAULT_CHINESE_URL: &str = "http://localhost:3000/chinese-click-captcha.html";
pub const DEFAULT_LOGIN_URL: &str = "http://localhost:3000/login.html";

/// Default login credentials for the alphanumeric page
pub const DEFAULT_LOGIN_USERNAME: &str = "admin";
pub const DEFAULT_LOGIN_PASSWORD: &str = "123456";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_VLM_ENDPOINT: &str = "CAPTCHA_VISION_VLM_ENDPOINT";
pub const ENV_VLM_MODEL: &str = "CAPTCHA_VISION_VLM_MODEL";
pub const ENV_VLM_API_KEY: &str = "CAPTCHA_VISION_VLM_API_KEY";
pub const ENV_VLM_MAX_TOKENS: &str = "CAPTCHA_VISION_VLM_MAX_TOKENS";
pub const ENV_VLM_TEMPERATURE: &str = "CAPTCHA_VISION_VLM_TEMPERATURE";
pub const ENV_VLM_TIMEOUT: &str = "CAPTCHA_VISION_VLM_TIMEOUT";
pub const ENV_VLM_SYSTEM_PROMPT: &str = "CAPTCHA_VISION_VLM_SYSTEM_PROMPT";

pub const ENV_WEBDRIVER_CHROMIUM: &str = "CAPTCHA_VISION_WEBDRIVER_CHROMIUM";
pub const ENV_WEBDRIVER_FIREFOX: &str = "CAPTCHA_VISION_WEBDRIVER_FIREFOX";
pub const ENV_WEBDRIVER_WEBKIT: &str = "CAPTCHA_VISION_WEBDRIVER_WEBKIT";
pub const ENV_HEADLESS: &str = "CAPTCHA_VISION_HEADLESS";
pub const ENV_PAGE_LOAD_TIMEOUT: &str = "CAPTCHA_VISION_PAGE_LOAD_TIMEOUT";
pub const ENV_RESULT_TIMEOUT: &str = "CAPTCHA_VISION_RESULT_TIMEOUT";
pub const ENV_CLICK_DELAY: &str = "CAPTCHA_VISION_CLICK_DELAY";

pub const ENV_KIND: &str = "CAPTCHA_VISION_KIND";
pub const ENV_ENGINES: &str = "CAPTCHA_VISION_ENGINES";
pub const ENV_TRIALS: &str = "CAPTCHA_VISION_TRIALS";
pub const ENV_INTER_TRIAL_DELAY: &str = "CAPTCHA_VISION_INTER_TRIAL_DELAY";
pub const ENV_TRIAL_TIMEOUT: &str = "CAPTCHA_VISION_TRIAL_TIMEOUT";
pub const ENV_OCR_TIMEOUT: &str = "CAPTCHA_VISION_OCR_TIMEOUT";
pub const ENV_REPORT_DIR: &str = "CAPTCHA_VISION_REPORT_DIR";
pub const ENV_EVIDENCE_DIR: &str = "CAPTCHA_VISION_EVIDENCE_DIR";

pub const ENV_MATH_URL: &str = "CAPTCHA_VISION_MATH_URL";
pub const ENV_MATH_SUCCESS_MARKER: &str = "CAPTCHA_VISION_MATH_SUCCESS_MARKER";
pub const ENV_CHINESE_URL: &str = "CAPTCHA_VISION_CHINESE_URL";
pub const ENV_CHINESE_SUCCESS_MARKER: &str = "CAPTCHA_VISION_CHINESE_SUCCESS_MARKER";
pub const ENV_LOGIN_URL: &str = "CAPTCHA_VISION_LOGIN_URL";
pub const ENV_LOGIN_SUCCESS_MARKER: &str = "CAPTCHA_VISION_LOGIN_SUCCESS_MARKER";
pub const ENV_LOGIN_USERNAME: &str = "CAPTCHA_VISION_LOGIN_USERNAME";
pub const ENV_LOGIN_PASSWORD: &str = "CAPTCHA_VISION_LOGIN_PASSWORD";

// ============================================================================
// Legacy Environment Variable Support
// ============================================================================

/// DashScope credential variable, accepted when the primary one is unset
pub const ENV_VLM_API_KEY_LEGACY: &str = "DASHSCOPE_API_KEY";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Errors raised by startup validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required credential is not set
    #[error("missing credential: set {0} (or DASHSCOPE_API_KEY)")]
    MissingCredential(&'static str),

    /// A value is present but unusable
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Centralized configuration for captcha-vision
#[derive(Debug, Clone)]
pub struct Config {
    /// Vision model settings
    pub vlm: VlmSettings,
    /// Browser and UI wait settings
    pub browser: BrowserSettings,
    /// Experiment shape and output locations
    pub experiment: ExperimentSettings,
    /// Per-kind challenge pages
    pub pages: PageSettings,
}

/// VLM-related settings
#[derive(Debug, Clone)]
pub struct VlmSettings {
    /// Chat-completions endpoint URL
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// Bearer credential; never defaulted
    pub api_key: Option<String>,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Request bound (seconds)
    pub timeout: u64,
    /// System message preceding each instruction
    pub system_prompt: String,
}

/// Browser-related settings
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub chromium_url: String,
    pub firefox_url: String,
    pub webkit_url: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Bound on the ready selector after navigation (ms)
    pub page_load_timeout: u64,
    /// Bound on the result banner (ms)
    pub result_timeout: u64,
    /// Pause between grid clicks (ms)
    pub click_delay: u64,
}

/// Experiment-related settings
#[derive(Debug, Clone)]
pub struct ExperimentSettings {
    pub kind: ChallengeKind,
    pub engines: Vec<Engine>,
    pub trials_per_engine: usize,
    /// Delay between trials (ms)
    pub inter_trial_delay: u64,
    /// Bound on one whole trial (seconds)
    pub trial_timeout: u64,
    /// Bound on one OCR run when tesseract is the recognizer (seconds)
    pub ocr_timeout: u64,
    pub report_dir: PathBuf,
    pub evidence_dir: PathBuf,
}

/// Challenge page layout per kind
#[derive(Debug, Clone)]
pub struct PageSettings {
    pub math: ChallengePage,
    pub chinese_click: ChallengePage,
    pub alphanumeric: ChallengePage,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            vlm: VlmSettings::from_lookup(&lookup),
            browser: BrowserSettings::from_lookup(&lookup),
            experiment: ExperimentSettings::from_lookup(&lookup),
            pages: PageSettings::from_lookup(&lookup),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self::from_lookup(|_| None)
    }

    /// Page layout for a challenge kind
    pub fn page(&self, kind: ChallengeKind) -> &ChallengePage {
        match kind {
            ChallengeKind::Math => &self.pages.math,
            ChallengeKind::ChineseClick => &self.pages.chinese_click,
            ChallengeKind::AlphanumericText => &self.pages.alphanumeric,
        }
    }

    /// Fail fast on settings an experiment cannot run without.
    pub fn validate(&self, requires_api_key: bool) -> Result<(), ConfigError> {
        if requires_api_key
            && self
                .vlm
                .api_key
                .as_deref()
                .is_none_or(|key| key.trim().is_empty())
        {
            return Err(ConfigError::MissingCredential(ENV_VLM_API_KEY));
        }
        if self.experiment.trials_per_engine == 0 {
            return Err(ConfigError::Invalid {
                name: ENV_TRIALS,
                reason: "must be at least 1".to_string(),
            });
        }
        if self.experiment.engines.is_empty() {
            return Err(ConfigError::Invalid {
                name: ENV_ENGINES,
                reason: "no usable engine listed".to_string(),
            });
        }
        let kind = self.experiment.kind;
        if self.page(kind).success_marker.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: success_marker_var(kind),
                reason: "must not be empty; every result banner would count as success".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl VlmSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        Self {
            endpoint: lookup(ENV_VLM_ENDPOINT).unwrap_or_else(|| DEFAULT_VLM_ENDPOINT.to_string()),
            model: lookup(ENV_VLM_MODEL).unwrap_or_else(|| DEFAULT_VLM_MODEL.to_string()),
            api_key: non_empty(lookup(ENV_VLM_API_KEY))
                .or_else(|| non_empty(lookup(ENV_VLM_API_KEY_LEGACY))),
            max_tokens: parsed(lookup, ENV_VLM_MAX_TOKENS).unwrap_or(DEFAULT_VLM_MAX_TOKENS),
            temperature: parsed(lookup, ENV_VLM_TEMPERATURE).unwrap_or(DEFAULT_VLM_TEMPERATURE),
            timeout: parsed(lookup, ENV_VLM_TIMEOUT).unwrap_or(DEFAULT_VLM_TIMEOUT),
            system_prompt: lookup(ENV_VLM_SYSTEM_PROMPT)
                .unwrap_or_else(|| DEFAULT_VLM_SYSTEM_PROMPT.to_string()),
        }
    }
}

impl BrowserSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        Self {
            chromium_url: lookup(ENV_WEBDRIVER_CHROMIUM)
                .unwrap_or_else(|| DEFAULT_WEBDRIVER_CHROMIUM.to_string()),
            firefox_url: lookup(ENV_WEBDRIVER_FIREFOX)
                .unwrap_or_else(|| DEFAULT_WEBDRIVER_FIREFOX.to_string()),
            webkit_url: lookup(ENV_WEBDRIVER_WEBKIT)
                .unwrap_or_else(|| DEFAULT_WEBDRIVER_WEBKIT.to_string()),
            headless: lookup(ENV_HEADLESS)
                .and_then(|s| parse_bool(&s))
                .unwrap_or(true),
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            page_load_timeout: parsed(lookup, ENV_PAGE_LOAD_TIMEOUT)
                .unwrap_or(DEFAULT_PAGE_LOAD_TIMEOUT),
            result_timeout: parsed(lookup, ENV_RESULT_TIMEOUT).unwrap_or(DEFAULT_RESULT_TIMEOUT),
            click_delay: parsed(lookup, ENV_CLICK_DELAY).unwrap_or(DEFAULT_CLICK_DELAY),
        }
    }

    /// WebDriver endpoint serving an engine
    pub fn webdriver_url(&self, engine: Engine) -> &str {
        match engine {
            Engine::Chromium => &self.chromium_url,
            Engine::Firefox => &self.firefox_url,
            Engine::Webkit => &self.webkit_url,
        }
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout)
    }

    pub fn click_delay(&self) -> Duration {
        Duration::from_millis(self.click_delay)
    }
}

impl ExperimentSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        let engines = lookup(ENV_ENGINES).unwrap_or_else(|| DEFAULT_ENGINES.to_string());
        Self {
            kind: lookup(ENV_KIND)
                .and_then(|s| s.parse().ok())
                .unwrap_or(ChallengeKind::ChineseClick),
            engines: parse_engines(&engines),
            trials_per_engine: parsed(lookup, ENV_TRIALS).unwrap_or(DEFAULT_TRIALS_PER_ENGINE),
            inter_trial_delay: parsed(lookup, ENV_INTER_TRIAL_DELAY)
                .unwrap_or(DEFAULT_INTER_TRIAL_DELAY),
            trial_timeout: parsed(lookup, ENV_TRIAL_TIMEOUT).unwrap_or(DEFAULT_TRIAL_TIMEOUT),
            ocr_timeout: parsed(lookup, ENV_OCR_TIMEOUT).unwrap_or(DEFAULT_OCR_TIMEOUT),
            report_dir: PathBuf::from(
                lookup(ENV_REPORT_DIR).unwrap_or_else(|| DEFAULT_REPORT_DIR.to_string()),
            ),
            evidence_dir: PathBuf::from(
                lookup(ENV_EVIDENCE_DIR).unwrap_or_else(|| DEFAULT_EVIDENCE_DIR.to_string()),
            ),
        }
    }

    pub fn inter_trial_delay(&self) -> Duration {
        Duration::from_millis(self.inter_trial_delay)
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_secs(self.trial_timeout)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout)
    }
}

impl PageSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        let mut math = ChallengePage::math();
        if let Some(url) = lookup(ENV_MATH_URL) {
            math.url = url;
        }
        if let Some(marker) = lookup(ENV_MATH_SUCCESS_MARKER) {
            math.success_marker = marker;
        }

        let mut chinese_click = ChallengePage::chinese_click();
        if let Some(url) = lookup(ENV_CHINESE_URL) {
            chinese_click.url = url;
        }
        if let Some(marker) = lookup(ENV_CHINESE_SUCCESS_MARKER) {
            chinese_click.success_marker = marker;
        }

        let username =
            lookup(ENV_LOGIN_USERNAME).unwrap_or_else(|| DEFAULT_LOGIN_USERNAME.to_string());
        let password =
            lookup(ENV_LOGIN_PASSWORD).unwrap_or_else(|| DEFAULT_LOGIN_PASSWORD.to_string());
        let mut alphanumeric = ChallengePage::alphanumeric(&username, &password);
        if let Some(url) = lookup(ENV_LOGIN_URL) {
            alphanumeric.url = url;
        }
        if let Some(marker) = lookup(ENV_LOGIN_SUCCESS_MARKER) {
            alphanumeric.success_marker = marker;
        }

        Self {
            math,
            chinese_click,
            alphanumeric,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parsed<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|s| s.trim().parse().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Variable overriding a kind's success marker
fn success_marker_var(kind: ChallengeKind) -> &'static str {
    match kind {
        ChallengeKind::Math => ENV_MATH_SUCCESS_MARKER,
        ChallengeKind::ChineseClick => ENV_CHINESE_SUCCESS_MARKER,
        ChallengeKind::AlphanumericText => ENV_LOGIN_SUCCESS_MARKER,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a comma-separated engine list, dropping names that are not engines
pub fn parse_engines(list: &str) -> Vec<Engine> {
    let mut engines = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name.parse::<Engine>() {
            Ok(engine) if !engines.contains(&engine) => engines.push(engine),
            Ok(_) => {}
            Err(e) => tracing::warn!("ignoring engine '{}': {}", name, e),
        }
    }
    engines
}
