//! Runs a full experiment: every engine, every trial, one report.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::browser::{BrowserLauncher, Engine};
use crate::challenge::{ChallengeStrategy, strategy_for};
use crate::config::{self, Config, ConfigError};
use crate::report::{ExperimentReport, ReportConfig, ReportError, ReportWriter, accuracy};
use crate::session::{Environment, EvidenceSession};
use crate::trial::{TrialRunner, TrialTimings};
use crate::vlm::RecognitionClient;

/// File name prefix for reports and trial logs
pub const REPORT_PREFIX: &str = "experiment";

/// Setup failures; nothing that happens inside a trial ends up here
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot prepare evidence directory: {0}")]
    Evidence(#[from] std::io::Error),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// What a finished experiment left behind
#[derive(Debug, Clone)]
pub struct CompletedExperiment {
    pub report: ExperimentReport,
    pub report_path: PathBuf,
    pub trials_path: PathBuf,
    pub session_dir: PathBuf,
}

/// Engines × trials against one challenge kind
pub struct Experiment {
    config: Config,
    launcher: Arc<dyn BrowserLauncher>,
    recognizer: Arc<dyn RecognitionClient>,
    strategy: Box<dyn ChallengeStrategy>,
}

impl Experiment {
    /// Experiment for the configured challenge kind
    pub fn new(
        config: &Config,
        launcher: Arc<dyn BrowserLauncher>,
        recognizer: Arc<dyn RecognitionClient>,
    ) -> Self {
        Self {
            strategy: strategy_for(config.experiment.kind, config),
            config: config.clone(),
            launcher,
            recognizer,
        }
    }

    /// Replace the challenge strategy
    pub fn with_strategy(mut self, strategy: Box<dyn ChallengeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run `trials_per_engine` trials on each engine in order.
    ///
    /// Trial failures become outcomes in the report; only an unusable
    /// setup (no trials, no engines, unwritable output) is an error.
    pub async fn run(
        &self,
        engines: &[Engine],
        trials_per_engine: usize,
    ) -> Result<CompletedExperiment, ExperimentError> {
        if trials_per_engine == 0 {
            return Err(ConfigError::Invalid {
                name: config::ENV_TRIALS,
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if engines.is_empty() {
            return Err(ConfigError::Invalid {
                name: config::ENV_ENGINES,
                reason: "no engine selected".to_string(),
            }
            .into());
        }

        let kind = self.strategy.kind();
        let settings = &self.config.experiment;

        let session = EvidenceSession::new(&settings.evidence_dir, kind);
        session.init()?;
        let mut writer = ReportWriter::create(&settings.report_dir, REPORT_PREFIX, kind)?;
        let trials_path = writer.trials_path().to_path_buf();

        let runner = TrialRunner::new(
            self.launcher.as_ref(),
            self.recognizer.as_ref(),
            self.strategy.as_ref(),
            &session,
            TrialTimings::from_config(&self.config),
        );

        info!(
            "Starting {} experiment: {} trial(s) on {} engine(s) with {}",
            kind,
            trials_per_engine,
            engines.len(),
            self.recognizer.name()
        );

        let date = Utc::now();
        let clock = Instant::now();
        let delay = settings.inter_trial_delay();
        let total = engines.len() * trials_per_engine;

        let mut results = Vec::with_capacity(total);
        let mut engine_durations = BTreeMap::new();
        let mut successes = 0usize;

        for engine in engines {
            let engine_clock = Instant::now();
            info!("Engine {}: {} trial(s)", engine, trials_per_engine);

            for index in 1..=trials_per_engine {
                let record = runner.run(*engine, index).await;

                if let Err(e) = writer.append(&record) {
                    warn!("Could not append trial to {}: {}", trials_path.display(), e);
                }
                if record.is_success() {
                    successes += 1;
                }
                results.push(record);
                info!(
                    "Progress {}/{}: running accuracy {:.2}%",
                    results.len(),
                    total,
                    accuracy(successes, results.len())
                );

                if results.len() < total && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            engine_durations.insert(*engine, engine_clock.elapsed());
        }

        let report = ExperimentReport::build(
            format!("{} recognition experiment", kind),
            ReportConfig {
                trials_per_engine,
                engines: engines.to_vec(),
                kind,
                recognizer: self.recognizer.name().to_string(),
                inter_trial_delay_ms: settings.inter_trial_delay,
            },
            results,
            &engine_durations,
            date,
            clock.elapsed(),
            Environment::capture(),
        );
        let report_path = writer.finish(&report)?;

        info!(
            "Experiment finished: {}/{} succeeded ({:.2}%), report at {}",
            report.total_success,
            report.total_runs,
            report.accuracy,
            report_path.display()
        );

        Ok(CompletedExperiment {
            report,
            report_path,
            trials_path,
            session_dir: session.dir,
        })
    }
}
