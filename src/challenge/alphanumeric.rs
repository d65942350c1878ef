//! Login form with a distorted alphanumeric code.

use async_trait::async_trait;

use super::{Answer, ChallengeKind, ChallengePage, ChallengeStrategy, Comparison, compare_answers};
use crate::page::{Page, PageResult};

const GROUND_TRUTH_SCRIPT: &str = r#"
const el = document.querySelector('#captchaCode');
if (!el) { return null; }
return el.getAttribute('data-value') || el.textContent.trim() || null;
"#;

const PROMPT: &str = "请识别图片中的字母数字验证码，只包含字母和数字。\n\
请按以下格式返回：\n\
验证码: <字符>";

pub struct AlphanumericChallenge {
    page: ChallengePage,
}

impl AlphanumericChallenge {
    pub fn new(page: ChallengePage) -> Self {
        Self { page }
    }
}

#[async_trait]
impl ChallengeStrategy for AlphanumericChallenge {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::AlphanumericText
    }

    fn page(&self) -> &ChallengePage {
        &self.page
    }

    fn build_prompt(&self) -> String {
        PROMPT.to_string()
    }

    async fn ground_truth(&self, page: &dyn Page) -> PageResult<Option<Answer>> {
        let value = page.evaluate(GROUND_TRUTH_SCRIPT).await?;
        Ok(value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Answer::text))
    }

    fn compare(&self, parsed: &Answer, truth: &Answer) -> Comparison {
        compare_answers(parsed, truth, false)
    }
}
