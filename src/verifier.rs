//! Reads the page's own verdict after submitting.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::page::{Page, PageError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The page's verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub success: bool,
    /// Banner text as displayed
    pub result_text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The banner never showed text
    #[error("no result in {selector} after {timeout:?}")]
    Timeout { selector: String, timeout: Duration },

    #[error(transparent)]
    Page(#[from] PageError),
}

/// Poll `selector` until it shows text, then check it for `success_marker`.
pub async fn verify(
    page: &dyn Page,
    selector: &str,
    success_marker: &str,
    timeout: Duration,
) -> Result<Verification, VerifyError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(text) = page.text(selector).await? {
            let text = text.trim();
            if !text.is_empty() {
                debug!("Result banner: {}", text);
                return Ok(Verification {
                    success: !success_marker.trim().is_empty() && text.contains(success_marker),
                    result_text: text.to_string(),
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(VerifyError::Timeout {
                selector: selector.to_string(),
                timeout,
            });
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}
