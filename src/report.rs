//! Experiment statistics and report files.
//!
//! Two files are written per experiment:
//! - `<prefix>-<kind>-<millis>.trials.jsonl`, one record per finished trial
//! - `<prefix>-<kind>-<millis>.json`, the final report
//!
//! Neither ever overwrites an existing file; a name collision gets a `-N`
//! suffix instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::browser::Engine;
use crate::challenge::ChallengeKind;
use crate::session::Environment;
use crate::trial::{TrialOutcome, TrialRecord};

/// Errors writing report files
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("report serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Experiment parameters echoed into the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    pub trials_per_engine: usize,
    pub engines: Vec<Engine>,
    pub kind: ChallengeKind,
    /// Recognizer label (model name or OCR engine)
    pub recognizer: String,
    pub inter_trial_delay_ms: u64,
}

/// Per-engine totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSummary {
    pub engine: Engine,
    pub total: usize,
    pub success: usize,
    pub failures: usize,
    pub failure_breakdown: BTreeMap<TrialOutcome, usize>,
    pub accuracy: f64,
    pub duration_secs: f64,
}

/// Totals for one challenge variant (e.g. a math difficulty)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantSummary {
    pub total: usize,
    pub success: usize,
    pub accuracy: f64,
}

/// The final experiment report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentReport {
    pub title: String,
    pub date: DateTime<Utc>,
    /// Wall time in seconds, two decimals
    pub duration: f64,
    pub accuracy: f64,
    pub total_runs: usize,
    pub total_success: usize,
    pub total_failures: usize,
    pub config: ReportConfig,
    pub engines: Vec<EngineSummary>,
    pub failure_breakdown: BTreeMap<TrialOutcome, usize>,
    pub variants: BTreeMap<String, VariantSummary>,
    /// Population standard deviation of per-engine accuracy
    pub consistency: f64,
    pub environment: Environment,
    pub results: Vec<TrialRecord>,
}

impl ExperimentReport {
    /// Aggregate finished trials.
    ///
    /// Engines appear in `config.engines` order; `engine_durations` supplies
    /// each engine's wall time.
    pub fn build(
        title: impl Into<String>,
        config: ReportConfig,
        results: Vec<TrialRecord>,
        engine_durations: &BTreeMap<Engine, Duration>,
        date: DateTime<Utc>,
        duration: Duration,
        environment: Environment,
    ) -> Self {
        let total_runs = results.len();
        let total_success = results.iter().filter(|r| r.is_success()).count();

        let engines: Vec<EngineSummary> = config
            .engines
            .iter()
            .map(|engine| {
                let records: Vec<&TrialRecord> =
                    results.iter().filter(|r| r.engine == *engine).collect();
                let success = records.iter().filter(|r| r.is_success()).count();
                EngineSummary {
                    engine: *engine,
                    total: records.len(),
                    success,
                    failures: records.len() - success,
                    failure_breakdown: failure_breakdown(records.iter().copied()),
                    accuracy: accuracy(success, records.len()),
                    duration_secs: round2(
                        engine_durations
                            .get(engine)
                            .map(Duration::as_secs_f64)
                            .unwrap_or(0.0),
                    ),
                }
            })
            .collect();

        let mut variants: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for record in &results {
            if let Some(variant) = &record.variant {
                let entry = variants.entry(variant.clone()).or_default();
                entry.0 += 1;
                if record.is_success() {
                    entry.1 += 1;
                }
            }
        }
        let variants = variants
            .into_iter()
            .map(|(name, (total, success))| {
                (
                    name,
                    VariantSummary {
                        total,
                        success,
                        accuracy: accuracy(success, total),
                    },
                )
            })
            .collect();

        let per_engine: Vec<f64> = engines.iter().map(|e| e.accuracy).collect();

        Self {
            title: title.into(),
            date,
            duration: round2(duration.as_secs_f64()),
            accuracy: accuracy(total_success, total_runs),
            total_runs,
            total_success,
            total_failures: total_runs - total_success,
            config,
            failure_breakdown: failure_breakdown(results.iter()),
            engines,
            variants,
            consistency: round2(std_dev(&per_engine)),
            environment,
            results,
        }
    }
}

/// Count each failure outcome (all failure kinds present, zero or not)
fn failure_breakdown<'a>(
    records: impl Iterator<Item = &'a TrialRecord>,
) -> BTreeMap<TrialOutcome, usize> {
    let mut counts: BTreeMap<TrialOutcome, usize> =
        TrialOutcome::failures().map(|o| (o, 0)).collect();
    for record in records {
        if let Some(count) = counts.get_mut(&record.outcome) {
            *count += 1;
        }
    }
    counts
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Success percentage rounded to two decimals; 0 when nothing ran
pub fn accuracy(success: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(success as f64 / total as f64 * 100.0)
}

/// Population standard deviation; 0 for fewer than two values
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Writes the trial log as trials finish and the report at the end
#[derive(Debug)]
pub struct ReportWriter {
    dir: PathBuf,
    stem: String,
    trials_path: PathBuf,
    trials: File,
}

impl ReportWriter {
    /// Create `dir` if needed and open a fresh trial log in it.
    ///
    /// Fails when the directory is not writable.
    pub fn create(dir: impl Into<PathBuf>, prefix: &str, kind: ChallengeKind) -> Result<Self, ReportError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let stem = format!("{}-{}-{}", prefix, kind, Utc::now().timestamp_millis());
        let (trials_path, trials) = create_unique(&dir, &stem, "trials.jsonl")?;
        Ok(Self {
            dir,
            stem,
            trials_path,
            trials,
        })
    }

    pub fn trials_path(&self) -> &Path {
        &self.trials_path
    }

    /// Append one record as a JSON line
    pub fn append(&mut self, record: &TrialRecord) -> Result<(), ReportError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.trials, "{}", line)?;
        self.trials.flush()?;
        Ok(())
    }

    /// Write the final report; returns its path
    pub fn finish(self, report: &ExperimentReport) -> Result<PathBuf, ReportError> {
        let (path, mut file) = create_unique(&self.dir, &self.stem, "json")?;
        file.write_all(serde_json::to_string_pretty(report)?.as_bytes())?;
        file.flush()?;
        Ok(path)
    }
}

/// Create `<stem>.<ext>`, or `<stem>-N.<ext>` if taken; never truncates
fn create_unique(dir: &Path, stem: &str, extension: &str) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}.{}", stem, extension)
        } else {
            format!("{}-{}.{}", stem, attempt, extension)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}
