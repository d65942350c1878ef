//! Challenge kinds and their per-kind strategies.
//!
//! A [`ChallengeStrategy`] bundles everything that differs between CAPTCHA
//! kinds: the instruction prompt, response parsing, page preparation, ground
//! truth extraction, answer comparison, UI execution and outcome verification.
//! The trial runner is written once against this trait.

pub mod alphanumeric;
pub mod chinese_click;
pub mod math;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{self, Config};
use crate::executor::{self, ExecutionOutcome};
use crate::page::{Page, PageResult};
use crate::parser;
use crate::verifier::{self, Verification, VerifyError};

pub use alphanumeric::AlphanumericChallenge;
pub use chinese_click::ChineseClickChallenge;
pub use math::MathChallenge;

/// The family of CAPTCHA a trial solves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    Math,
    ChineseClick,
    AlphanumericText,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Math => "math",
            ChallengeKind::ChineseClick => "chinese-click",
            ChallengeKind::AlphanumericText => "alphanumeric-text",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "math" => Ok(ChallengeKind::Math),
            "chinese-click" | "chinese" | "click" => Ok(ChallengeKind::ChineseClick),
            "alphanumeric-text" | "alphanumeric" | "text" | "login" => {
                Ok(ChallengeKind::AlphanumericText)
            }
            other => Err(format!(
                "unknown challenge kind '{}': use math, chinese-click or alphanumeric-text",
                other
            )),
        }
    }
}

/// A structured answer: either what the recognizer claims or the page's ground truth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Answer {
    /// Typed answer (math result or alphanumeric code)
    Text { value: String },

    /// Glyphs to click in order, with their 1-based grid positions
    Clicks {
        target_sequence: Vec<String>,
        position_map: BTreeMap<String, u32>,
    },
}

impl Answer {
    pub fn text(value: impl Into<String>) -> Self {
        Answer::Text {
            value: value.into(),
        }
    }

    pub fn clicks<I, S>(target_sequence: I, position_map: BTreeMap<String, u32>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Answer::Clicks {
            target_sequence: target_sequence.into_iter().map(Into::into).collect(),
            position_map,
        }
    }
}

/// How a parsed answer relates to the ground truth
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Everything recognised agrees (positions may still be missing)
    Match,
    /// Wrong answer text or wrong glyph sequence
    TargetMismatch,
    /// Right sequence, but these glyphs were placed at the wrong cell
    PositionMismatch(Vec<String>),
}

/// Compare a parsed answer against the ground truth.
///
/// Glyphs with no recognised position are not a mismatch here; the executor
/// skips them and the outcome reflects it.
pub fn compare_answers(parsed: &Answer, truth: &Answer, case_sensitive: bool) -> Comparison {
    match (parsed, truth) {
        (Answer::Text { value: got }, Answer::Text { value: want }) => {
            let equal = if case_sensitive {
                got.trim() == want.trim()
            } else {
                got.trim().eq_ignore_ascii_case(want.trim())
            };
            if equal {
                Comparison::Match
            } else {
                Comparison::TargetMismatch
            }
        }
        (
            Answer::Clicks {
                target_sequence: got_sequence,
                position_map: got_positions,
            },
            Answer::Clicks {
                target_sequence: want_sequence,
                position_map: want_positions,
            },
        ) => {
            if got_sequence != want_sequence {
                return Comparison::TargetMismatch;
            }
            let wrong: Vec<String> = want_sequence
                .iter()
                .filter(|glyph| match got_positions.get(*glyph) {
                    Some(position) => want_positions.get(*glyph) != Some(position),
                    None => false,
                })
                .cloned()
                .collect();
            if wrong.is_empty() {
                Comparison::Match
            } else {
                Comparison::PositionMismatch(wrong)
            }
        }
        _ => Comparison::TargetMismatch,
    }
}

/// Selectors and copy of one challenge page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePage {
    /// Where the challenge is served
    pub url: String,
    /// Element whose visibility means the challenge is rendered
    pub ready_selector: String,
    /// Element captured for recognition instead of the full viewport
    pub capture_selector: Option<String>,
    /// Grid cell template containing `{position}`
    pub cell_selector: Option<String>,
    /// Number of addressable grid cells
    pub grid_cells: u32,
    /// Input receiving a typed answer
    pub input_selector: Option<String>,
    /// Explicit validate/submit control
    pub submit_selector: String,
    /// Status banner read after submitting
    pub result_selector: String,
    /// Substring of the banner text that means success
    pub success_marker: String,
    /// Fields filled before the challenge is captured (selector, value)
    pub prefill: Vec<(String, String)>,
}

impl ChallengePage {
    pub fn math() -> Self {
        Self {
            url: config::DEFAULT_MATH_URL.to_string(),
            ready_selector: ".math-expression".to_string(),
            capture_selector: None,
            cell_selector: None,
            grid_cells: 0,
            input_selector: Some("#answerInput".to_string()),
            submit_selector: ".btn-primary".to_string(),
            result_selector: "#result".to_string(),
            success_marker: "正确".to_string(),
            prefill: Vec::new(),
        }
    }

    pub fn chinese_click() -> Self {
        Self {
            url: config::DEFAULT_CHINESE_URL.to_string(),
            ready_selector: ".captcha-container".to_string(),
            capture_selector: None,
            cell_selector: Some(".captcha-grid .char-button:nth-child({position})".to_string()),
            grid_cells: 16,
            input_selector: None,
            submit_selector: "button.btn-primary".to_string(),
            result_selector: "#result".to_string(),
            success_marker: "成功".to_string(),
            prefill: Vec::new(),
        }
    }

    pub fn alphanumeric(username: &str, password: &str) -> Self {
        Self {
            url: config::DEFAULT_LOGIN_URL.to_string(),
            ready_selector: "#captchaCode".to_string(),
            capture_selector: Some("#captchaCode".to_string()),
            cell_selector: None,
            grid_cells: 0,
            input_selector: Some("#captcha".to_string()),
            submit_selector: "#loginBtn".to_string(),
            result_selector: ".message".to_string(),
            success_marker: "成功".to_string(),
            prefill: vec![
                ("#username".to_string(), username.to_string()),
                ("#password".to_string(), password.to_string()),
            ],
        }
    }

    /// Selector of the cell at a 1-based position, if in range
    pub fn cell(&self, position: u32) -> Option<String> {
        if position == 0 || position > self.grid_cells {
            return None;
        }
        self.cell_selector
            .as_ref()
            .map(|template| template.replace("{position}", &position.to_string()))
    }
}

/// Per-kind behaviour of a trial
#[async_trait]
pub trait ChallengeStrategy: Send + Sync {
    fn kind(&self) -> ChallengeKind;

    fn page(&self) -> &ChallengePage;

    /// Instruction sent with the captured image
    fn build_prompt(&self) -> String;

    fn parse(&self, raw_text: &str) -> Option<Answer> {
        parser::parse(raw_text, self.kind())
    }

    /// Get the page into its challenge state; returns a variant label if any.
    async fn prepare(&self, page: &dyn Page, _index: usize) -> PageResult<Option<String>> {
        for (selector, value) in &self.page().prefill {
            page.fill(selector, value).await?;
        }
        Ok(None)
    }

    /// Read the correct answer from page state (scoring only)
    async fn ground_truth(&self, page: &dyn Page) -> PageResult<Option<Answer>>;

    fn compare(&self, parsed: &Answer, truth: &Answer) -> Comparison {
        compare_answers(parsed, truth, true)
    }

    async fn execute(
        &self,
        page: &dyn Page,
        answer: &Answer,
        click_delay: Duration,
    ) -> PageResult<ExecutionOutcome> {
        executor::execute(page, answer, self.page(), click_delay).await
    }

    async fn verify(&self, page: &dyn Page, timeout: Duration) -> Result<Verification, VerifyError> {
        let layout = self.page();
        verifier::verify(page, &layout.result_selector, &layout.success_marker, timeout).await
    }
}

/// Build the strategy for a kind from configuration
pub fn strategy_for(kind: ChallengeKind, config: &Config) -> Box<dyn ChallengeStrategy> {
    let page = config.page(kind).clone();
    match kind {
        ChallengeKind::Math => Box::new(MathChallenge::new(page)),
        ChallengeKind::ChineseClick => Box::new(ChineseClickChallenge::new(page)),
        ChallengeKind::AlphanumericText => Box::new(AlphanumericChallenge::new(page)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn positions(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(g, p)| (g.to_string(), *p)).collect()
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [
            ChallengeKind::Math,
            ChallengeKind::ChineseClick,
            ChallengeKind::AlphanumericText,
        ] {
            assert_eq!(kind.to_string().parse::<ChallengeKind>(), Ok(kind));
        }
        assert_eq!(
            serde_json::to_string(&ChallengeKind::ChineseClick).unwrap(),
            "\"chinese-click\""
        );
    }

    #[test]
    fn test_answer_serialization_shape() {
        let answer = Answer::clicks(["鹤"], positions(&[("鹤", 2)]));
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json["type"], "clicks");
        assert_eq!(json["targetSequence"][0], "鹤");
        assert_eq!(json["positionMap"]["鹤"], 2);
    }

    #[test]
    fn test_compare_text() {
        assert_eq!(
            compare_answers(&Answer::text("15"), &Answer::text("15"), true),
            Comparison::Match
        );
        assert_eq!(
            compare_answers(&Answer::text("ab3d"), &Answer::text("AB3D"), true),
            Comparison::TargetMismatch
        );
        assert_eq!(
            compare_answers(&Answer::text("ab3d"), &Answer::text("AB3D"), false),
            Comparison::Match
        );
    }

    #[test]
    fn test_compare_clicks_sequence_and_positions() {
        let truth = Answer::clicks(
            ["鹤", "木", "鼠"],
            positions(&[("鹤", 2), ("木", 14), ("鼠", 4)]),
        );

        let reordered = Answer::clicks(["木", "鹤", "鼠"], positions(&[]));
        assert_eq!(compare_answers(&reordered, &truth, true), Comparison::TargetMismatch);

        let wrong_cell = Answer::clicks(
            ["鹤", "木", "鼠"],
            positions(&[("鹤", 2), ("木", 13), ("鼠", 4)]),
        );
        assert_eq!(
            compare_answers(&wrong_cell, &truth, true),
            Comparison::PositionMismatch(vec!["木".to_string()])
        );

        let missing = Answer::clicks(["鹤", "木", "鼠"], positions(&[("鹤", 2), ("木", 14)]));
        assert_eq!(compare_answers(&missing, &truth, true), Comparison::Match);
    }

    #[test]
    fn test_cell_selector_range() {
        let page = ChallengePage::chinese_click();
        assert_eq!(
            page.cell(1).as_deref(),
            Some(".captcha-grid .char-button:nth-child(1)")
        );
        assert_eq!(page.cell(0), None);
        assert_eq!(page.cell(17), None);
        assert_eq!(ChallengePage::math().cell(1), None);
    }

    #[test]
    fn test_strategy_for_uses_configured_page() {
        let config = Config::defaults();
        let strategy = strategy_for(ChallengeKind::AlphanumericText, &config);
        assert_eq!(strategy.kind(), ChallengeKind::AlphanumericText);
        assert_eq!(strategy.page().submit_selector, "#loginBtn");
        assert!(!strategy.build_prompt().is_empty());
    }
}
