//! Ordered glyph-click CAPTCHA on a 4x4 grid.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{Answer, ChallengeKind, ChallengePage, ChallengeStrategy};
use crate::page::{Page, PageError, PageResult};

const GROUND_TRUTH_SCRIPT: &str = r#"
const target = document.querySelector('#targetChars');
const targetChars = (target ? target.textContent : '')
  .split('→').map(c => c.trim()).filter(c => c);
const cells = document.querySelectorAll('.captcha-grid .char-button');
const gridChars = [];
cells.forEach((cell, index) => gridChars.push({ char: cell.textContent.trim(), position: index + 1 }));
return { targetChars, gridChars };
"#;

const PROMPT: &str = r#"请分析这个中文点击验证码图片：
1. 识别顶部蓝色区域显示的目标字符序列（"请依次点击："后面的字符）
2. 识别4x4网格中的所有中文字符及其位置（从左到右、从上到下，第一个位置为1）
3. 以JSON格式返回结果，不要输出代码段标记
请按以下格式返回：
{
  "targetChars": ["字符1", "字符2", "字符3"],
  "gridMapping": {
    "字符1": 位置编号,
    "字符2": 位置编号
  }
}"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageState {
    #[serde(default)]
    target_chars: Vec<String>,
    #[serde(default)]
    grid_chars: Vec<GridCell>,
}

#[derive(Debug, Deserialize)]
struct GridCell {
    #[serde(rename = "char")]
    glyph: String,
    position: u32,
}

pub struct ChineseClickChallenge {
    page: ChallengePage,
}

impl ChineseClickChallenge {
    pub fn new(page: ChallengePage) -> Self {
        Self { page }
    }
}

#[async_trait]
impl ChallengeStrategy for ChineseClickChallenge {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::ChineseClick
    }

    fn page(&self) -> &ChallengePage {
        &self.page
    }

    fn build_prompt(&self) -> String {
        PROMPT.to_string()
    }

    async fn ground_truth(&self, page: &dyn Page) -> PageResult<Option<Answer>> {
        let value = page.evaluate(GROUND_TRUTH_SCRIPT).await?;
        if value.is_null() {
            return Ok(None);
        }
        let state: PageState = serde_json::from_value(value)
            .map_err(|e| PageError::WebDriver(format!("unexpected grid state: {}", e)))?;
        if state.target_chars.is_empty() {
            return Ok(None);
        }

        // First cell wins when a glyph repeats
        let mut position_map = BTreeMap::new();
        for glyph in &state.target_chars {
            if let Some(cell) = state.grid_chars.iter().find(|c| &c.glyph == glyph) {
                position_map.insert(glyph.clone(), cell.position);
            }
        }
        Ok(Some(Answer::clicks(state.target_chars, position_map)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::page::MockPage;

    #[tokio::test]
    async fn test_ground_truth_maps_targets_to_cells() {
        let page = MockPage::new().with_script(
            "targetChars",
            json!({
                "targetChars": ["鹤", "木"],
                "gridChars": [
                    {"char": "山", "position": 1},
                    {"char": "鹤", "position": 2},
                    {"char": "木", "position": 14},
                    {"char": "鹤", "position": 15}
                ]
            }),
        );
        let challenge = ChineseClickChallenge::new(ChallengePage::chinese_click());
        let truth = challenge.ground_truth(&page).await.unwrap();

        let expected: BTreeMap<String, u32> =
            [("鹤".to_string(), 2), ("木".to_string(), 14)].into_iter().collect();
        assert_eq!(truth, Some(Answer::clicks(["鹤", "木"], expected)));
    }

    #[tokio::test]
    async fn test_ground_truth_absent_without_targets() {
        let challenge = ChineseClickChallenge::new(ChallengePage::chinese_click());
        assert_eq!(challenge.ground_truth(&MockPage::new()).await.unwrap(), None);

        let page = MockPage::new()
            .with_script("targetChars", json!({"targetChars": [], "gridChars": []}));
        assert_eq!(challenge.ground_truth(&page).await.unwrap(), None);
    }

    #[test]
    fn test_prompt_names_json_keys() {
        let prompt = ChineseClickChallenge::new(ChallengePage::chinese_click()).build_prompt();
        assert!(prompt.contains("targetChars"));
        assert!(prompt.contains("gridMapping"));
    }
}
