use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{Evidence, TrialOutcome, TrialRecord, TrialState};
use crate::browser::{BrowserLauncher, Engine};
use crate::challenge::{Answer, ChallengeStrategy, Comparison};
use crate::config::Config;
use crate::page::Page;
use crate::session::{CapturePhase, EvidenceSession};
use crate::verifier::VerifyError;
use crate::vlm::RecognitionClient;

/// Bound on closing a session once the trial is over
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits and pacing inside one trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialTimings {
    /// Ready selector after navigation
    pub page_load: Duration,
    /// Result banner after submitting
    pub result: Duration,
    /// Pause between grid clicks
    pub click_delay: Duration,
    /// Whole trial, launch included
    pub trial: Duration,
}

impl TrialTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_load: config.browser.page_load_timeout(),
            result: config.browser.result_timeout(),
            click_delay: config.browser.click_delay(),
            trial: config.experiment.trial_timeout(),
        }
    }
}

/// Outcome plus the human-readable why
struct Verdict {
    outcome: TrialOutcome,
    reason: Option<String>,
}

impl Verdict {
    fn new(outcome: TrialOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: Some(reason.into()),
        }
    }

    fn success() -> Self {
        Self {
            outcome: TrialOutcome::Success,
            reason: None,
        }
    }

    fn infrastructure(reason: impl Into<String>) -> Self {
        Self::new(TrialOutcome::InfrastructureError, reason)
    }
}

/// A trial's record while it is still being filled in
struct Draft {
    engine: Engine,
    index: usize,
    state: TrialState,
    variant: Option<String>,
    prompt: Option<String>,
    raw_response: Option<String>,
    parsed: Option<Answer>,
    ground_truth: Option<Answer>,
    skipped: Vec<String>,
    result_text: Option<String>,
    evidence: Evidence,
    recognition_latency: Option<Duration>,
}

impl Draft {
    fn new(engine: Engine, index: usize) -> Self {
        Self {
            engine,
            index,
            state: TrialState::Init,
            variant: None,
            prompt: None,
            raw_response: None,
            parsed: None,
            ground_truth: None,
            skipped: Vec::new(),
            result_text: None,
            evidence: Evidence::default(),
            recognition_latency: None,
        }
    }

    fn advance(&mut self, state: TrialState) {
        debug!("{} trial {}: {:?} -> {:?}", self.engine, self.index, self.state, state);
        self.state = state;
    }
}

/// Runs single trials against fresh browser pages.
///
/// Every call produces exactly one [`TrialRecord`]; failures of any kind are
/// classified into its outcome rather than returned as errors.
pub struct TrialRunner<'a> {
    launcher: &'a dyn BrowserLauncher,
    recognizer: &'a dyn RecognitionClient,
    strategy: &'a dyn ChallengeStrategy,
    session: &'a EvidenceSession,
    timings: TrialTimings,
}

impl<'a> TrialRunner<'a> {
    pub fn new(
        launcher: &'a dyn BrowserLauncher,
        recognizer: &'a dyn RecognitionClient,
        strategy: &'a dyn ChallengeStrategy,
        session: &'a EvidenceSession,
        timings: TrialTimings,
    ) -> Self {
        Self {
            launcher,
            recognizer,
            strategy,
            session,
            timings,
        }
    }

    /// Run trial `index` (1-based) on `engine`
    pub async fn run(&self, engine: Engine, index: usize) -> TrialRecord {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut draft = Draft::new(engine, index);

        let verdict = match tokio::time::timeout(self.timings.trial, self.launcher.launch(engine)).await
        {
            Err(_) => Verdict::infrastructure(format!(
                "browser launch exceeded {:?}",
                self.timings.trial
            )),
            Ok(Err(e)) => Verdict::infrastructure(format!("browser launch failed: {}", e)),
            Ok(Ok(page)) => {
                let remaining = self.timings.trial.saturating_sub(clock.elapsed());
                let attempt = AssertUnwindSafe(self.drive(page.as_ref(), &mut draft)).catch_unwind();
                let finished = tokio::time::timeout(remaining, attempt).await;
                let verdict = match finished {
                    Ok(Ok(verdict)) => verdict,
                    Ok(Err(panic)) => {
                        Verdict::infrastructure(format!("trial panicked: {}", panic_message(&*panic)))
                    }
                    Err(_) => Verdict::infrastructure(format!(
                        "trial exceeded {:?} in state {:?}",
                        self.timings.trial, draft.state
                    )),
                };

                match tokio::time::timeout(CLOSE_TIMEOUT, page.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Closing {} session failed: {}", engine, e),
                    Err(_) => warn!("Closing {} session timed out", engine),
                }
                verdict
            }
        };

        self.record(draft, verdict, started_at, clock.elapsed())
    }

    async fn drive(&self, page: &dyn Page, draft: &mut Draft) -> Verdict {
        let layout = self.strategy.page();

        // Load a fresh challenge
        if let Err(e) = page.goto(&layout.url).await {
            return Verdict::infrastructure(format!("navigation failed: {}", e));
        }
        if let Err(e) = page.wait_for(&layout.ready_selector, self.timings.page_load).await {
            return Verdict::infrastructure(format!("challenge did not render: {}", e));
        }
        match self.strategy.prepare(page, draft.index).await {
            Ok(variant) => draft.variant = variant,
            Err(e) => return Verdict::infrastructure(format!("challenge setup failed: {}", e)),
        }
        draft.advance(TrialState::ChallengeLoaded);

        // Capture what the recognizer will see
        let before = self
            .session
            .capture_path(draft.engine, draft.index, CapturePhase::Before);
        let captured = match &layout.capture_selector {
            Some(selector) => page.screenshot_element(selector, &before).await,
            None => page.screenshot(&before).await,
        };
        if let Err(e) = captured {
            return Verdict::infrastructure(format!("screenshot failed: {}", e));
        }
        draft.evidence.before = Some(before.clone());
        draft.advance(TrialState::EvidenceCapturedBefore);

        let prompt = self.strategy.build_prompt();
        draft.prompt = Some(prompt.clone());
        let recognition = match self.recognizer.analyze(&before, &prompt).await {
            Ok(recognition) => recognition,
            Err(e) => return Verdict::infrastructure(format!("recognition failed: {}", e)),
        };
        draft.recognition_latency = Some(recognition.latency);
        draft.raw_response = Some(recognition.raw_text.clone());
        draft.advance(TrialState::Recognized);

        let Some(parsed) = self.strategy.parse(&recognition.raw_text) else {
            return Verdict::new(
                TrialOutcome::RecognitionParseFailure,
                "no answer could be parsed from the response",
            );
        };
        draft.parsed = Some(parsed.clone());
        draft.advance(TrialState::Parsed);

        // Ground truth is read after recognition and only used for scoring
        let truth = match self.strategy.ground_truth(page).await {
            Ok(truth) => truth,
            Err(e) => return Verdict::infrastructure(format!("ground truth unavailable: {}", e)),
        };
        draft.ground_truth = truth.clone();
        match &truth {
            Some(truth) => match self.strategy.compare(&parsed, truth) {
                Comparison::Match => {}
                Comparison::TargetMismatch => {
                    return Verdict::new(
                        TrialOutcome::TargetMismatch,
                        "recognised answer differs from the challenge",
                    );
                }
                Comparison::PositionMismatch(glyphs) => {
                    return Verdict::new(
                        TrialOutcome::PositionMismatch,
                        format!("wrong grid position for {}", glyphs.join(", ")),
                    );
                }
            },
            None => warn!(
                "{} trial {}: page exposed no ground truth; relying on its verdict",
                draft.engine, draft.index
            ),
        }
        draft.advance(TrialState::GroundTruthCompared);

        let execution = match self
            .strategy
            .execute(page, &parsed, self.timings.click_delay)
            .await
        {
            Ok(execution) => execution,
            Err(e) => return Verdict::infrastructure(format!("executing answer failed: {}", e)),
        };
        draft.skipped = execution.skipped.clone();
        draft.advance(TrialState::Executed);

        let after = self
            .session
            .capture_path(draft.engine, draft.index, CapturePhase::After);
        if let Err(e) = page.screenshot(&after).await {
            return Verdict::infrastructure(format!("screenshot failed: {}", e));
        }
        draft.evidence.after = Some(after);
        draft.advance(TrialState::EvidenceCapturedAfter);

        if !execution.submitted {
            return Verdict::new(
                TrialOutcome::PostActionVerificationFailure,
                format!(
                    "submit control missing: {}",
                    execution.missing_elements.join(", ")
                ),
            );
        }

        match self.strategy.verify(page, self.timings.result).await {
            Ok(verification) => {
                draft.result_text = Some(verification.result_text.clone());
                draft.advance(TrialState::Verified);
                if verification.success {
                    Verdict::success()
                } else if execution.is_partial() {
                    Verdict::new(
                        TrialOutcome::ExecutionSkipped,
                        format!(
                            "skipped {} and the page said: {}",
                            execution
                                .skipped
                                .iter()
                                .chain(&execution.missing_elements)
                                .cloned()
                                .collect::<Vec<_>>()
                                .join(", "),
                            verification.result_text
                        ),
                    )
                } else {
                    Verdict::new(
                        TrialOutcome::PostActionVerificationFailure,
                        format!("page said: {}", verification.result_text),
                    )
                }
            }
            Err(VerifyError::Timeout { timeout, .. }) => Verdict::new(
                TrialOutcome::PostActionVerificationFailure,
                format!("no verdict shown within {:?}", timeout),
            ),
            Err(VerifyError::Page(e)) => {
                Verdict::infrastructure(format!("reading verdict failed: {}", e))
            }
        }
    }

    fn record(
        &self,
        draft: Draft,
        verdict: Verdict,
        started_at: chrono::DateTime<Utc>,
        elapsed: Duration,
    ) -> TrialRecord {
        match (&verdict.outcome, &verdict.reason) {
            (TrialOutcome::Success, _) => {
                info!("{} trial {}: success", draft.engine, draft.index)
            }
            (outcome, reason) => warn!(
                "{} trial {}: {} ({})",
                draft.engine,
                draft.index,
                outcome,
                reason.as_deref().unwrap_or("no detail")
            ),
        }
        debug!("{} trial {}: {:?} -> {:?}", draft.engine, draft.index, draft.state, TrialState::Recorded);

        TrialRecord {
            engine: draft.engine,
            index: draft.index,
            kind: self.strategy.kind(),
            variant: draft.variant,
            outcome: verdict.outcome,
            reason: verdict.reason,
            prompt: draft.prompt,
            raw_response: draft.raw_response,
            parsed: draft.parsed,
            ground_truth: draft.ground_truth,
            skipped: draft.skipped,
            result_text: draft.result_text,
            evidence: draft.evidence,
            reached_state: draft.state,
            started_at,
            finished_at: Utc::now(),
            latency_ms: millis(elapsed),
            recognition_latency_ms: draft.recognition_latency.map(millis),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;

    use crate::challenge::{ChallengePage, ChineseClickChallenge, MathChallenge};
    use crate::page::{MockLauncher, MockPage, PageAction, PageError};
    use crate::vlm::{RecognitionResult, VlmError, VlmResult};

    /// Answers every image with a fixed reply
    struct Scripted(Mutex<Option<VlmResult<String>>>);

    impl Scripted {
        fn reply(text: &str) -> Self {
            Self(Mutex::new(Some(Ok(text.to_string()))))
        }

        fn error(err: VlmError) -> Self {
            Self(Mutex::new(Some(Err(err))))
        }
    }

    #[async_trait]
    impl RecognitionClient for Scripted {
        async fn analyze(&self, _image: &Path, prompt: &str) -> VlmResult<RecognitionResult> {
            let next = self
                .0
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(String::new()));
            next.map(|raw_text| RecognitionResult {
                raw_text,
                instruction_prompt: prompt.to_string(),
                model: "scripted".to_string(),
                latency: Duration::from_millis(5),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn timings() -> TrialTimings {
        TrialTimings {
            page_load: Duration::from_millis(100),
            result: Duration::from_millis(100),
            click_delay: Duration::ZERO,
            trial: Duration::from_secs(10),
        }
    }

    fn math_page(answer: i64, verdict: &str) -> MockPage {
        let layout = ChallengePage::math();
        MockPage::new()
            .with_element(&layout.ready_selector, "9 + 6 = ?")
            .with_element("#difficulty", "")
            .with_element("#answerInput", "")
            .with_element(&layout.submit_selector, "提交")
            .with_hidden_element(&layout.result_selector)
            .on_click(&layout.submit_selector, &layout.result_selector, verdict)
            .with_script("currentAnswer", json!(answer))
    }

    fn chinese_page(verdict: &str) -> MockPage {
        let layout = ChallengePage::chinese_click();
        MockPage::new()
            .with_element(&layout.ready_selector, "")
            .with_grid(layout.cell_selector.as_deref().unwrap(), layout.grid_cells)
            .with_element(&layout.submit_selector, "验证")
            .with_hidden_element(&layout.result_selector)
            .on_click(&layout.submit_selector, &layout.result_selector, verdict)
            .with_script(
                "targetChars",
                json!({
                    "targetChars": ["鹤", "木", "鼠"],
                    "gridChars": [
                        {"char": "鹤", "position": 2},
                        {"char": "鼠", "position": 4},
                        {"char": "木", "position": 14}
                    ]
                }),
            )
    }

    async fn run_one(
        launcher: &MockLauncher,
        recognizer: &dyn RecognitionClient,
        strategy: &dyn ChallengeStrategy,
    ) -> TrialRecord {
        let dir = tempfile::tempdir().unwrap();
        let session = EvidenceSession::in_dir(dir.path(), strategy.kind());
        TrialRunner::new(launcher, recognizer, strategy, &session, timings())
            .run(Engine::Chromium, 1)
            .await
    }

    fn closed(launcher: &MockLauncher) -> bool {
        launcher.journal().lock().unwrap().last() == Some(&PageAction::Close)
    }

    #[tokio::test]
    async fn test_math_success() {
        let launcher = MockLauncher::new(|_, _| Ok(math_page(15, "回答正确！")));
        let recognizer = Scripted::reply("the expression is 9+6, answer: 15");
        let strategy = MathChallenge::new(ChallengePage::math()).with_settle(Duration::ZERO);

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::Success);
        assert_eq!(record.parsed, Some(Answer::text("15")));
        assert_eq!(record.variant.as_deref(), Some("easy"));
        assert_eq!(record.reached_state, TrialState::Verified);
        assert_eq!(record.recognition_latency_ms, Some(5));
        assert!(record.evidence.before.is_some() && record.evidence.after.is_some());
        assert!(closed(&launcher));
    }

    #[tokio::test]
    async fn test_wrong_math_answer_exits_before_acting() {
        let launcher = MockLauncher::new(|_, _| Ok(math_page(15, "回答正确！")));
        let recognizer = Scripted::reply("答案: 16");
        let strategy = MathChallenge::new(ChallengePage::math()).with_settle(Duration::ZERO);

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::TargetMismatch);
        assert_eq!(record.reached_state, TrialState::Parsed);
        let journal = launcher.journal();
        let actions = journal.lock().unwrap();
        assert!(!actions.iter().any(|a| matches!(a, PageAction::Fill(..))));
        assert_eq!(actions.last(), Some(&PageAction::Close));
    }

    #[tokio::test]
    async fn test_unparseable_response_keeps_raw_text() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证成功")));
        let recognizer = Scripted::reply("I think it's 汉=2 but not sure");
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::RecognitionParseFailure);
        assert_eq!(record.raw_response.as_deref(), Some("I think it's 汉=2 but not sure"));
        assert!(closed(&launcher));
    }

    #[tokio::test]
    async fn test_wrong_position_is_position_mismatch() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证成功")));
        let recognizer = Scripted::reply(
            r#"{"targetChars": ["鹤", "木", "鼠"], "gridMapping": {"鹤": 2, "木": 13, "鼠": 4}}"#,
        );
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::PositionMismatch);
        assert!(record.reason.unwrap().contains("木"));
    }

    #[tokio::test]
    async fn test_missing_position_is_execution_skipped() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证失败，请重试")));
        let recognizer = Scripted::reply(
            r#"{"targetChars": ["鹤", "木", "鼠"], "gridMapping": {"鹤": 2, "木": 14}}"#,
        );
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::ExecutionSkipped);
        assert_eq!(record.skipped, vec!["鼠".to_string()]);
        let layout = ChallengePage::chinese_click();
        let clicks: Vec<PageAction> = launcher
            .journal()
            .lock()
            .unwrap()
            .iter()
            .filter(|a| matches!(a, PageAction::Click(_)))
            .cloned()
            .collect();
        assert_eq!(
            clicks,
            vec![
                PageAction::Click(layout.cell(2).unwrap()),
                PageAction::Click(layout.cell(14).unwrap()),
                PageAction::Click(layout.submit_selector.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_absent_cell_element_is_execution_skipped() {
        let layout = ChallengePage::chinese_click();
        let launcher = MockLauncher::new(move |_, _| {
            let layout = ChallengePage::chinese_click();
            // Only the first three cells rendered
            Ok(MockPage::new()
                .with_element(&layout.ready_selector, "")
                .with_grid(layout.cell_selector.as_deref().unwrap(), 3)
                .with_element(&layout.submit_selector, "验证")
                .with_hidden_element(&layout.result_selector)
                .on_click(&layout.submit_selector, &layout.result_selector, "验证失败")
                .with_script(
                    "targetChars",
                    json!({
                        "targetChars": ["鹤", "木"],
                        "gridChars": [
                            {"char": "鹤", "position": 2},
                            {"char": "木", "position": 14}
                        ]
                    }),
                ))
        });
        let recognizer = Scripted::reply(r#"{"targetChars": ["鹤", "木"], "gridMapping": {"鹤": 2, "木": 14}}"#);
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::ExecutionSkipped);
        assert!(record.skipped.is_empty());
        assert!(record.reason.unwrap().contains(&layout.cell(14).unwrap()));
    }

    #[tokio::test]
    async fn test_rejected_full_answer_is_verification_failure() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证失败，请重试")));
        let recognizer = Scripted::reply(
            r#"{"targetChars": ["鹤", "木", "鼠"], "gridMapping": {"鹤": 2, "木": 14, "鼠": 4}}"#,
        );
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::PostActionVerificationFailure);
        assert_eq!(record.result_text.as_deref(), Some("验证失败，请重试"));
    }

    #[tokio::test]
    async fn test_recognizer_timeout_is_infrastructure() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证成功")));
        let recognizer = Scripted::error(VlmError::Timeout(Duration::from_secs(60)));
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::InfrastructureError);
        assert_eq!(record.reached_state, TrialState::EvidenceCapturedBefore);
        assert!(closed(&launcher));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_blank_ocr_reading_is_parse_failure() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证成功")));
        let recognizer = crate::ocr::TesseractClient::new(crate::challenge::ChallengeKind::ChineseClick)
            .with_binary("true");
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::RecognitionParseFailure);
        assert_eq!(record.raw_response.as_deref(), Some(""));
        assert_eq!(record.reached_state, TrialState::Recognized);
    }

    #[tokio::test]
    async fn test_launch_and_navigation_failures() {
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());
        let recognizer = Scripted::reply("{}");

        let launcher =
            MockLauncher::new(|_, _| Err(PageError::Session("driver not running".to_string())));
        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::InfrastructureError);
        assert_eq!(record.reached_state, TrialState::Init);

        let launcher = MockLauncher::new(|_, _| Ok(MockPage::new().failing_goto("net::ERR")));
        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::InfrastructureError);
        assert!(record.reason.unwrap().contains("net::ERR"));
        assert!(closed(&launcher));
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_page_closed() {
        let launcher = MockLauncher::new(|_, _| Ok(chinese_page("验证成功").panicking_evaluate()));
        let recognizer = Scripted::reply(
            r#"{"targetChars": ["鹤"], "gridMapping": {"鹤": 2}}"#,
        );
        let strategy = ChineseClickChallenge::new(ChallengePage::chinese_click());

        let record = run_one(&launcher, &recognizer, &strategy).await;
        assert_eq!(record.outcome, TrialOutcome::InfrastructureError);
        assert!(record.reason.unwrap().contains("panicked"));
        assert!(closed(&launcher));
    }
}
