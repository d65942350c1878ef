//! End-to-end experiments against scripted pages and recognizers.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use captcha_vision::challenge::{ChineseClickChallenge, MathChallenge};
use captcha_vision::{
    Answer, ChallengeKind, ChallengePage, Config, Engine, Experiment, ExperimentError,
    MockLauncher, MockPage, PageAction, RecognitionClient, RecognitionResult, TrialOutcome,
    TrialRecord, VlmError, VlmResult,
};

/// Replies from a queue; an exhausted queue answers with empty text
struct Replies {
    queue: Mutex<Vec<VlmResult<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl Replies {
    fn new(replies: Vec<VlmResult<String>>) -> Self {
        let mut queue = replies;
        queue.reverse();
        Self {
            queue: Mutex::new(queue),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn always(text: &str, count: usize) -> Self {
        Self::new((0..count).map(|_| Ok(text.to_string())).collect())
    }
}

#[async_trait]
impl RecognitionClient for Replies {
    async fn analyze(&self, image_path: &Path, prompt: &str) -> VlmResult<RecognitionResult> {
        assert!(image_path.exists(), "capture should exist before recognition");
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.queue.lock().unwrap().pop().unwrap_or_else(|| Ok(String::new()));
        next.map(|raw_text| RecognitionResult {
            raw_text,
            instruction_prompt: prompt.to_string(),
            model: "replies".to_string(),
            latency: Duration::from_millis(1),
        })
    }

    fn name(&self) -> &str {
        "replies"
    }
}

struct Workspace {
    _root: tempfile::TempDir,
    config: Config,
}

impl Workspace {
    fn new(kind: ChallengeKind) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::defaults();
        config.experiment.kind = kind;
        config.experiment.inter_trial_delay = 0;
        config.experiment.report_dir = root.path().join("reports");
        config.experiment.evidence_dir = root.path().join("evidence");
        config.browser.page_load_timeout = 100;
        config.browser.result_timeout = 200;
        config.browser.click_delay = 0;
        Self {
            _root: root,
            config,
        }
    }

    fn report_dir(&self) -> PathBuf {
        self.config.experiment.report_dir.clone()
    }
}

fn math_page(answer: i64) -> MockPage {
    let layout = ChallengePage::math();
    MockPage::new()
        .with_element(&layout.ready_selector, "9 + 6 = ?")
        .with_element("#difficulty", "")
        .with_element("#answerInput", "")
        .with_element(&layout.submit_selector, "提交")
        .with_hidden_element(&layout.result_selector)
        .on_click(&layout.submit_selector, &layout.result_selector, "回答正确！")
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

fn math_strategy() -> Box<MathChallenge> {
    Box::new(MathChallenge::new(ChallengePage::math()).with_settle(Duration::ZERO))
}

fn read_trials(path: &Path) -> Vec<TrialRecord> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_math_answer_with_explanation_succeeds() {
    let ws = Workspace::new(ChallengeKind::Math);
    let launcher = Arc::new(MockLauncher::new(|_, _| Ok(math_page(15))));
    let recognizer = Arc::new(Replies::always(
        "The expression is 9 + 6.\nanswer: 15",
        1,
    ));

    let completed = Experiment::new(&ws.config, launcher.clone(), recognizer)
        .with_strategy(math_strategy())
        .run(&[Engine::Chromium], 1)
        .await
        .unwrap();

    let record = &completed.report.results[0];
    assert_eq!(record.outcome, TrialOutcome::Success);
    assert_eq!(record.parsed, Some(Answer::text("15")));
    assert_eq!(completed.report.accuracy, 100.0);

    let journal = launcher.journal();
    let actions = journal.lock().unwrap();
    assert!(actions.contains(&PageAction::Fill("#answerInput".to_string(), "15".to_string())));
    assert_eq!(actions.last(), Some(&PageAction::Close));
}

#[tokio::test]
async fn test_missing_glyph_position_is_skipped_and_reported() {
    let ws = Workspace::new(ChallengeKind::ChineseClick);
    let launcher = Arc::new(MockLauncher::new(|_, _| Ok(chinese_page("验证失败，请重试"))));
    let recognizer = Arc::new(Replies::always(
        r#"```json
{"targetChars": ["鹤", "木", "鼠"], "gridMapping": {"鹤": 2, "木": 14}}
```"#,
        1,
    ));

    let completed = Experiment::new(&ws.config, launcher.clone(), recognizer)
        .run(&[Engine::Firefox], 1)
        .await
        .unwrap();

    let record = &completed.report.results[0];
    assert_eq!(record.outcome, TrialOutcome::ExecutionSkipped);
    assert_eq!(record.skipped, vec!["鼠".to_string()]);

    let layout = ChallengePage::chinese_click();
    let cell_clicks = launcher
        .journal()
        .lock()
        .unwrap()
        .iter()
        .filter(|a| matches!(a, PageAction::Click(s) if s.contains("nth-child")))
        .count();
    assert_eq!(cell_clicks, 2);
    assert!(
        launcher
            .journal()
            .lock()
            .unwrap()
            .contains(&PageAction::Click(layout.submit_selector.clone()))
    );
    assert_eq!(completed.report.failure_breakdown[&TrialOutcome::ExecutionSkipped], 1);
}

#[tokio::test]
async fn test_recognizer_timeout_does_not_stop_experiment() {
    let ws = Workspace::new(ChallengeKind::ChineseClick);
    let launcher = Arc::new(MockLauncher::new(|_, _| Ok(chinese_page("验证成功"))));
    let good = r#"{"targetChars": ["鹤", "木", "鼠"], "gridMapping": {"鹤": 2, "木": 14, "鼠": 4}}"#;
    let recognizer = Arc::new(Replies::new(vec![
        Ok(good.to_string()),
        Err(VlmError::Timeout(Duration::from_secs(60))),
        Ok(good.to_string()),
    ]));

    let completed = Experiment::new(&ws.config, launcher.clone(), recognizer)
        .run(&[Engine::Chromium], 3)
        .await
        .unwrap();

    let outcomes: Vec<TrialOutcome> = completed.report.results.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            TrialOutcome::Success,
            TrialOutcome::InfrastructureError,
            TrialOutcome::Success
        ]
    );
    assert_eq!(launcher.launches(), 3);
    let closes = launcher
        .journal()
        .lock()
        .unwrap()
        .iter()
        .filter(|a| **a == PageAction::Close)
        .count();
    assert_eq!(closes, 3);
}

#[tokio::test]
async fn test_one_record_per_trial_across_engines() {
    let ws = Workspace::new(ChallengeKind::Math);
    // Alternate right and wrong pages so every engine mixes outcomes
    let launcher = Arc::new(MockLauncher::new(|_, n| {
        Ok(math_page(if n % 2 == 0 { 99 } else { 15 }))
    }));
    let recognizer = Arc::new(Replies::always("答案: 15", 6));
    let engines = [Engine::Chromium, Engine::Firefox, Engine::Webkit];

    let completed = Experiment::new(&ws.config, launcher, recognizer)
        .with_strategy(math_strategy())
        .run(&engines, 2)
        .await
        .unwrap();
    let report = &completed.report;

    assert_eq!(report.total_runs, 6);
    assert_eq!(report.total_success + report.total_failures, report.total_runs);
    assert_eq!(report.total_success, 3);
    assert_eq!(report.accuracy, 50.0);
    assert_eq!(report.failure_breakdown[&TrialOutcome::TargetMismatch], 3);
    assert_eq!(report.failure_breakdown.len(), 6);
    assert_eq!(report.config.engines, engines.to_vec());

    // Records come in engine order, then trial order
    let order: Vec<(Engine, usize)> = report.results.iter().map(|r| (r.engine, r.index)).collect();
    assert_eq!(
        order,
        vec![
            (Engine::Chromium, 1),
            (Engine::Chromium, 2),
            (Engine::Firefox, 1),
            (Engine::Firefox, 2),
            (Engine::Webkit, 1),
            (Engine::Webkit, 2),
        ]
    );
    for engine in &report.engines {
        assert_eq!(engine.total, 2);
        assert_eq!(engine.success + engine.failures, engine.total);
    }

    // Difficulty rotates with the trial index
    assert_eq!(report.results[0].variant.as_deref(), Some("easy"));
    assert_eq!(report.results[1].variant.as_deref(), Some("medium"));

    // Trial log mirrors the report
    let logged = read_trials(&completed.trials_path);
    assert_eq!(logged.len(), 6);
    assert_eq!(logged, report.results);

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&completed.report_path).unwrap()).unwrap();
    assert_eq!(saved["totalRuns"], 6);
    assert_eq!(saved["results"].as_array().unwrap().len(), 6);
    assert!(saved["duration"].is_f64());

    // Mismatched trials stop before acting, so only successes have an after capture
    let captures = std::fs::read_dir(&completed.session_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == "png"))
        .count();
    assert_eq!(captures, 9);
}

#[tokio::test]
async fn test_reports_never_overwrite_each_other() {
    let ws = Workspace::new(ChallengeKind::Math);
    let launcher = Arc::new(MockLauncher::new(|_, _| Ok(math_page(15))));

    let mut paths = Vec::new();
    for _ in 0..2 {
        let recognizer = Arc::new(Replies::always("15", 1));
        let completed = Experiment::new(&ws.config, launcher.clone(), recognizer)
            .with_strategy(math_strategy())
            .run(&[Engine::Chromium], 1)
            .await
            .unwrap();
        paths.push(completed.report_path);
    }

    assert_ne!(paths[0], paths[1]);
    let reports = std::fs::read_dir(ws.report_dir())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.ends_with(".json") && !name.ends_with(".jsonl")
        })
        .count();
    assert_eq!(reports, 2);
}

#[tokio::test]
async fn test_setup_errors_are_reported() {
    let ws = Workspace::new(ChallengeKind::Math);
    let launcher = Arc::new(MockLauncher::new(|_, _| Ok(math_page(15))));
    let recognizer = Arc::new(Replies::always("15", 1));
    let experiment = Experiment::new(&ws.config, launcher.clone(), recognizer);

    assert!(matches!(
        experiment.run(&[Engine::Chromium], 0).await,
        Err(ExperimentError::Config(_))
    ));
    assert!(matches!(
        experiment.run(&[], 1).await,
        Err(ExperimentError::Config(_))
    ));
    assert_eq!(launcher.launches(), 0);

    // A file where the report directory should be
    let mut config = ws.config.clone();
    let blocker = ws.report_dir().with_extension("blocker");
    std::fs::write(&blocker, "").unwrap();
    config.experiment.report_dir = blocker;
    let recognizer = Arc::new(Replies::always("15", 1));
    let result = Experiment::new(&config, launcher.clone(), recognizer)
        .run(&[Engine::Chromium], 1)
        .await;
    assert!(matches!(result, Err(ExperimentError::Report(_))));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn test_chinese_prompt_asks_for_json() {
    let ws = Workspace::new(ChallengeKind::ChineseClick);
    let launcher = Arc::new(MockLauncher::new(|_, _| Ok(chinese_page("验证成功"))));
    let recognizer = Arc::new(Replies::always("{}", 1));

    let completed = Experiment::new(&ws.config, launcher, recognizer.clone())
        .with_strategy(Box::new(ChineseClickChallenge::new(ChallengePage::chinese_click())))
        .run(&[Engine::Chromium], 1)
        .await
        .unwrap();

    let prompts = recognizer.prompts.lock().unwrap();
    assert!(prompts[0].contains("targetChars"));
    assert!(prompts[0].contains("gridMapping"));
    assert_eq!(
        completed.report.results[0].outcome,
        TrialOutcome::RecognitionParseFailure
    );
}
