//! Captcha Vision - cross-browser CAPTCHA recognition experiments.
//!
//! This crate provides:
//! - A vision-model recognition client (plus a local tesseract baseline)
//! - Tolerant parsing of free-form model replies into typed answers
//! - WebDriver browser control and a scriptable mock page for testing
//! - A per-trial state machine that classifies every failure
//! - Experiment aggregation with JSON reports and a JSONL trial log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use captcha_vision::{Config, Experiment, VlmClient, VlmConfig, WebDriverLauncher};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! config.validate(true)?;
//! let recognizer = VlmClient::new(VlmConfig::from_settings(&config.vlm)?)?;
//! let launcher = WebDriverLauncher::new(config.browser.clone());
//!
//! let completed = Experiment::new(&config, Arc::new(launcher), Arc::new(recognizer))
//!     .run(&config.experiment.engines, config.experiment.trials_per_engine)
//!     .await?;
//! println!("accuracy: {}%", completed.report.accuracy);
//! # Ok(())
//! # }
//! ```

pub mod browser;
pub mod challenge;
pub mod config;
pub mod executor;
pub mod experiment;
pub mod ocr;
pub mod page;
pub mod parser;
pub mod report;
pub mod session;
pub mod trial;
pub mod verifier;
pub mod vlm;

// Re-export configuration
pub use config::{Config, ConfigError};

// Re-export browser control and test doubles
pub use browser::{BrowserLauncher, Engine, WebDriverLauncher, check_webdriver};
pub use page::{MockLauncher, MockPage, Page, PageAction, PageError, PageResult};

// Re-export challenge types
pub use challenge::{Answer, ChallengeKind, ChallengePage, ChallengeStrategy, Comparison, strategy_for};

// Re-export recognizers
pub use ocr::TesseractClient;
pub use vlm::{RecognitionClient, RecognitionResult, VlmClient, VlmConfig, VlmError, VlmResult, check_health};

// Re-export trials and experiments
pub use experiment::{CompletedExperiment, Experiment, ExperimentError};
pub use report::{EngineSummary, ExperimentReport, ReportError};
pub use session::EvidenceSession;
pub use trial::{TrialOutcome, TrialRecord, TrialRunner, TrialState, TrialTimings};
