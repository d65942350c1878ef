//! Turns a parsed answer into UI actions.
//!
//! Click answers are replayed cell by cell in target order; text answers are
//! typed into the challenge input. Either way the run ends with an explicit
//! click on the submit control. Elements that are simply absent are noted and
//! skipped; any other page failure is returned to the caller.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::challenge::{Answer, ChallengePage};
use crate::page::{Page, PageResult};

/// What the executor actually did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    /// Glyphs clicked, in click order
    pub clicked: Vec<String>,
    /// Glyphs with no usable position
    pub skipped: Vec<String>,
    /// Text typed into the input, if any
    pub filled: Option<String>,
    /// Whether the submit control was clicked
    pub submitted: bool,
    /// Selectors that matched nothing
    pub missing_elements: Vec<String>,
}

impl ExecutionOutcome {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty() || !self.missing_elements.is_empty()
    }
}

/// Execute `answer` on `page` using the selectors in `layout`
pub async fn execute(
    page: &dyn Page,
    answer: &Answer,
    layout: &ChallengePage,
    click_delay: Duration,
) -> PageResult<ExecutionOutcome> {
    let mut outcome = ExecutionOutcome::default();

    match answer {
        Answer::Clicks {
            target_sequence,
            position_map,
        } => {
            let mut first = true;
            for glyph in target_sequence {
                let Some(selector) = position_map.get(glyph).and_then(|p| layout.cell(*p)) else {
                    warn!("No usable grid position for '{}', skipping it", glyph);
                    outcome.skipped.push(glyph.clone());
                    continue;
                };

                if !first && !click_delay.is_zero() {
                    tokio::time::sleep(click_delay).await;
                }
                first = false;

                match page.click(&selector).await {
                    Ok(()) => {
                        debug!("Clicked '{}' at {}", glyph, selector);
                        outcome.clicked.push(glyph.clone());
                    }
                    Err(e) if e.is_missing_element() => {
                        warn!("Cell for '{}' not found: {}", glyph, selector);
                        outcome.missing_elements.push(selector);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Answer::Text { value } => match &layout.input_selector {
            Some(input) => match page.fill(input, value).await {
                Ok(()) => outcome.filled = Some(value.clone()),
                Err(e) if e.is_missing_element() => {
                    warn!("Answer input not found: {}", input);
                    outcome.missing_elements.push(input.clone());
                }
                Err(e) => return Err(e),
            },
            None => {
                warn!("Page has no answer input; submitting without typing");
                outcome.missing_elements.push("<answer input>".to_string());
            }
        },
    }

    match page.click(&layout.submit_selector).await {
        Ok(()) => outcome.submitted = true,
        Err(e) if e.is_missing_element() => {
            warn!("Submit control not found: {}", layout.submit_selector);
            outcome.missing_elements.push(layout.submit_selector.clone());
        }
        Err(e) => return Err(e),
    }

    Ok(outcome)
}
