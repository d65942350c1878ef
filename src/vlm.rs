//! Vision Language Model (VLM) recognition client.
//!
//! Sends one captured challenge image plus an instruction to an
//! OpenAI-compatible chat-completions endpoint and returns the raw reply text.
//! The client never retries and never touches the browser; interpreting the
//! text is the parser's job.
//!
//! # Configuration
//!
//! Settings come from [`crate::config::VlmSettings`]:
//! - `CAPTCHA_VISION_VLM_ENDPOINT`: API endpoint URL
//! - `CAPTCHA_VISION_VLM_MODEL`: Model name
//! - `CAPTCHA_VISION_VLM_API_KEY`: Bearer credential (required)
//! - `CAPTCHA_VISION_VLM_MAX_TOKENS`: Max tokens in response
//! - `CAPTCHA_VISION_VLM_TEMPERATURE`: Sampling temperature
//! - `CAPTCHA_VISION_VLM_TIMEOUT`: Request timeout (seconds)

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{self, ConfigError, VlmSettings};

/// Result type for VLM operations
pub type VlmResult<T> = Result<T, VlmError>;

/// Errors that can occur during recognition
#[derive(Debug, thiserror::Error)]
pub enum VlmError {
    /// The service answered with a non-success status
    #[error("service returned {status}: {message}")]
    Service { status: u16, message: String },

    /// No complete response within the configured bound
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The capture could not be read as an image
    #[error("unreadable image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    /// The response did not carry usable content
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport failure (connection refused, TLS, ...)
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a recognizer said about one image
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    /// Unmodified reply text
    pub raw_text: String,
    /// Instruction sent with the image
    pub instruction_prompt: String,
    /// Model (or engine) that produced the reply
    pub model: String,
    /// Wall time of the call
    pub latency: Duration,
}

/// Anything that can turn a challenge image into text
#[async_trait]
pub trait RecognitionClient: Send + Sync {
    async fn analyze(&self, image_path: &Path, prompt: &str) -> VlmResult<RecognitionResult>;

    /// Label used in reports
    fn name(&self) -> &str;
}

/// Configuration for the VLM client
#[derive(Debug, Clone)]
pub struct VlmConfig {
    /// API endpoint URL
    pub endpoint: String,
    /// Model name to use
    pub model: String,
    /// Bearer credential
    pub api_key: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Bound on a whole request
    pub timeout: Duration,
    /// System message sent ahead of the instruction
    pub system_prompt: String,
}

impl VlmConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: config::DEFAULT_VLM_MODEL.to_string(),
            api_key: api_key.into(),
            max_tokens: config::DEFAULT_VLM_MAX_TOKENS,
            temperature: config::DEFAULT_VLM_TEMPERATURE,
            timeout: Duration::from_secs(config::DEFAULT_VLM_TIMEOUT),
            system_prompt: config::DEFAULT_VLM_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Build from settings; the credential must be present
    pub fn from_settings(settings: &VlmSettings) -> Result<Self, ConfigError> {
        let api_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingCredential(config::ENV_VLM_API_KEY))?;

        Ok(Self::new(settings.endpoint.clone(), api_key)
            .model(settings.model.clone())
            .max_tokens(settings.max_tokens)
            .temperature(settings.temperature)
            .timeout(Duration::from_secs(settings.timeout))
            .system_prompt(settings.system_prompt.clone()))
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

/// Chat-completions client for vision models
#[derive(Debug, Clone)]
pub struct VlmClient {
    config: VlmConfig,
    http: reqwest::Client,
}

impl VlmClient {
    pub fn new(config: VlmConfig) -> VlmResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| VlmError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn build_request(&self, data_url: &str, prompt: &str) -> Value {
        json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": self.config.system_prompt
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "image_url",
                            "image_url": { "url": data_url }
                        },
                        {
                            "type": "text",
                            "text": prompt
                        }
                    ]
                }
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature
        })
    }

    fn map_transport(&self, err: reqwest::Error) -> VlmError {
        if err.is_timeout() {
            VlmError::Timeout(self.config.timeout)
        } else {
            VlmError::Http(err.to_string())
        }
    }
}

#[async_trait]
impl RecognitionClient for VlmClient {
    async fn analyze(&self, image_path: &Path, prompt: &str) -> VlmResult<RecognitionResult> {
        let started = Instant::now();
        let data_url = encode_image(image_path).await?;
        let request = self.build_request(&data_url, prompt);

        debug!("Sending {} to {}", image_path.display(), self.config.endpoint);
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VlmError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                VlmError::Timeout(self.config.timeout)
            } else {
                VlmError::InvalidResponse(e.to_string())
            }
        })?;
        let raw_text = extract_content(&body)
            .ok_or_else(|| VlmError::InvalidResponse("response carried no content".to_string()))?;

        let latency = started.elapsed();
        debug!("VLM answered in {:?} ({} chars)", latency, raw_text.chars().count());

        Ok(RecognitionResult {
            raw_text,
            instruction_prompt: prompt.to_string(),
            model: self.config.model.clone(),
            latency,
        })
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Read an image, confirm it decodes, and wrap it in a `data:` URL
async fn encode_image(path: &Path) -> VlmResult<String> {
    image::image_dimensions(path).map_err(|e| VlmError::InvalidImage {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let bytes = tokio::fs::read(path).await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{}", mime_for(path), encoded))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

/// Pull the reply text out of a chat-completions body.
///
/// `content` may be a string or a list of typed parts; thinking models put
/// their answer in `reasoning_content` instead.
fn extract_content(body: &Value) -> Option<String> {
    let message = &body["choices"][0]["message"];
    let content = match &message["content"] {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    if !content.trim().is_empty() {
        return Some(content);
    }
    message["reasoning_content"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

/// Check if a VLM endpoint is reachable.
///
/// Any HTTP response (even 4xx/5xx) means the server is up; only connection
/// failures count as unreachable.
pub async fn check_health(endpoint: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    client.head(endpoint).send().await.is_ok()
}
