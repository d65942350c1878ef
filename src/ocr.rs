//! Local OCR recognizer backed by the `tesseract` CLI.
//!
//! A cheap baseline next to the vision model: the same capture goes through
//! `tesseract <image> stdout` with a per-kind character whitelist. The
//! instruction prompt is recorded on the result but not used.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::challenge::ChallengeKind;
use crate::config;
use crate::vlm::{RecognitionClient, RecognitionResult, VlmError, VlmResult};

/// Default bound on one OCR run
pub const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(config::DEFAULT_OCR_TIMEOUT);

/// Single text line
const PAGE_SEGMENTATION_MODE: &str = "7";

/// Characters tesseract may emit for a kind; `None` leaves it unrestricted
pub fn whitelist_for(kind: ChallengeKind) -> Option<&'static str> {
    match kind {
        ChallengeKind::Math => Some("0123456789+-*=x"),
        ChallengeKind::AlphanumericText => {
            Some("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789")
        }
        ChallengeKind::ChineseClick => None,
    }
}

/// Runs tesseract as a child process per image
#[derive(Debug, Clone)]
pub struct TesseractClient {
    kind: ChallengeKind,
    binary: String,
    language: Option<String>,
    timeout: Duration,
}

impl TesseractClient {
    pub fn new(kind: ChallengeKind) -> Self {
        let language = match kind {
            ChallengeKind::ChineseClick => Some("chi_sim".to_string()),
            _ => None,
        };
        Self {
            kind,
            binary: "tesseract".to_string(),
            language,
            timeout: DEFAULT_OCR_TIMEOUT,
        }
    }

    /// Use a different executable
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, image_path: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(image_path)
            .arg("stdout")
            .args(["--psm", PAGE_SEGMENTATION_MODE]);
        if let Some(language) = &self.language {
            cmd.args(["-l", language]);
        }
        if let Some(whitelist) = whitelist_for(self.kind) {
            cmd.arg("-c")
                .arg(format!("tessedit_char_whitelist={}", whitelist));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RecognitionClient for TesseractClient {
    async fn analyze(&self, image_path: &Path, prompt: &str) -> VlmResult<RecognitionResult> {
        image::image_dimensions(image_path).map_err(|e| VlmError::InvalidImage {
            path: image_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let started = Instant::now();
        debug!("Running {} on {}", self.binary, image_path.display());

        // Dropping the future on timeout kills the child (kill_on_drop)
        let output = tokio::time::timeout(self.timeout, self.command(image_path).output())
            .await
            .map_err(|_| VlmError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(VlmError::Service {
                status: output.status.code().and_then(|c| u16::try_from(c).ok()).unwrap_or(0),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let raw_text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if raw_text.is_empty() {
            // Unreadable capture; left for the parser to reject
            debug!("{} read no text from {}", self.binary, image_path.display());
        }

        Ok(RecognitionResult {
            raw_text,
            instruction_prompt: prompt.to_string(),
            model: self.binary.clone(),
            latency: started.elapsed(),
        })
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}
