//! Arithmetic CAPTCHA: read an expression, type the result.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{Answer, ChallengeKind, ChallengePage, ChallengeStrategy};
use crate::page::{Page, PageResult};

/// Difficulty levels offered by the page's `#difficulty` select
pub const DIFFICULTIES: [&str; 3] = ["easy", "medium", "hard"];

const DIFFICULTY_SELECTOR: &str = "#difficulty";

/// Pause after switching difficulty while the page renders a new expression
const DEFAULT_SETTLE: Duration = Duration::from_millis(1000);

const READY_TIMEOUT: Duration = Duration::from_secs(5);

const GROUND_TRUTH_SCRIPT: &str = "return (typeof currentAnswer !== 'undefined' && currentAnswer !== null) \
? String(currentAnswer) : null;";

const PROMPT: &str = "请分析这个数学题验证码图片，识别数学表达式并计算答案。\n\
请按以下格式返回：\n\
数学表达式: <表达式>\n\
答案: <数字>";

pub struct MathChallenge {
    page: ChallengePage,
    settle: Duration,
}

impl MathChallenge {
    pub fn new(page: ChallengePage) -> Self {
        Self {
            page,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Override the pause after a difficulty change
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Difficulty used for a 1-based trial index
    pub fn difficulty_for(index: usize) -> &'static str {
        DIFFICULTIES[index.saturating_sub(1) % DIFFICULTIES.len()]
    }
}

#[async_trait]
impl ChallengeStrategy for MathChallenge {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Math
    }

    fn page(&self) -> &ChallengePage {
        &self.page
    }

    fn build_prompt(&self) -> String {
        PROMPT.to_string()
    }

    async fn prepare(&self, page: &dyn Page, index: usize) -> PageResult<Option<String>> {
        let difficulty = Self::difficulty_for(index);
        debug!("Selecting math difficulty {}", difficulty);
        page.select_option(DIFFICULTY_SELECTOR, difficulty).await?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        page.wait_for(&self.page.ready_selector, READY_TIMEOUT).await?;
        Ok(Some(difficulty.to_string()))
    }

    async fn ground_truth(&self, page: &dyn Page) -> PageResult<Option<Answer>> {
        let value = page.evaluate(GROUND_TRUTH_SCRIPT).await?;
        Ok(match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Answer::text(s.trim())),
            serde_json::Value::Number(n) => Some(Answer::text(n.to_string())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{MockPage, PageAction};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_difficulty_rotates_by_index() {
        assert_eq!(MathChallenge::difficulty_for(1), "easy");
        assert_eq!(MathChallenge::difficulty_for(2), "medium");
        assert_eq!(MathChallenge::difficulty_for(3), "hard");
        assert_eq!(MathChallenge::difficulty_for(4), "easy");
        assert_eq!(MathChallenge::difficulty_for(0), "easy");
    }

    #[tokio::test]
    async fn test_prepare_selects_difficulty() {
        let challenge = MathChallenge::new(ChallengePage::math()).with_settle(Duration::ZERO);
        let page = MockPage::new()
            .with_element(DIFFICULTY_SELECTOR, "")
            .with_element(".math-expression", "9 + 6 = ?");
        let journal = page.journal();

        let variant = challenge.prepare(&page, 2).await.unwrap();
        assert_eq!(variant.as_deref(), Some("medium"));
        assert_eq!(
            journal.lock().unwrap().clone(),
            vec![PageAction::Select(
                DIFFICULTY_SELECTOR.to_string(),
                "medium".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_ground_truth_from_number_or_string() {
        let challenge = MathChallenge::new(ChallengePage::math());

        let page = MockPage::new().with_script("currentAnswer", serde_json::json!(15));
        assert_eq!(
            challenge.ground_truth(&page).await.unwrap(),
            Some(Answer::text("15"))
        );

        let page = MockPage::new().with_script("currentAnswer", serde_json::json!("42"));
        assert_eq!(
            challenge.ground_truth(&page).await.unwrap(),
            Some(Answer::text("42"))
        );

        assert_eq!(challenge.ground_truth(&MockPage::new()).await.unwrap(), None);
    }
}
