//! Trial records and outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::browser::Engine;
use crate::challenge::{Answer, ChallengeKind};

/// Pipeline stage a trial has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialState {
    Init,
    ChallengeLoaded,
    EvidenceCapturedBefore,
    Recognized,
    Parsed,
    GroundTruthCompared,
    Executed,
    EvidenceCapturedAfter,
    Verified,
    Recorded,
}

/// How a trial ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialOutcome {
    Success,
    /// No answer could be read from the recognizer's text
    RecognitionParseFailure,
    /// Wrong answer or wrong glyph sequence
    TargetMismatch,
    /// Right glyphs, wrong cells
    PositionMismatch,
    /// Some glyphs had no position and the page rejected the attempt
    ExecutionSkipped,
    /// The page did not confirm success
    PostActionVerificationFailure,
    /// Browser, recognizer, timeout or other fault unrelated to recognition quality
    InfrastructureError,
}

impl TrialOutcome {
    pub fn all() -> [TrialOutcome; 7] {
        [
            TrialOutcome::Success,
            TrialOutcome::RecognitionParseFailure,
            TrialOutcome::TargetMismatch,
            TrialOutcome::PositionMismatch,
            TrialOutcome::ExecutionSkipped,
            TrialOutcome::PostActionVerificationFailure,
            TrialOutcome::InfrastructureError,
        ]
    }

    /// Every outcome except success
    pub fn failures() -> impl Iterator<Item = TrialOutcome> {
        Self::all().into_iter().filter(|o| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TrialOutcome::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialOutcome::Success => "success",
            TrialOutcome::RecognitionParseFailure => "recognitionParseFailure",
            TrialOutcome::TargetMismatch => "targetMismatch",
            TrialOutcome::PositionMismatch => "positionMismatch",
            TrialOutcome::ExecutionSkipped => "executionSkipped",
            TrialOutcome::PostActionVerificationFailure => "postActionVerificationFailure",
            TrialOutcome::InfrastructureError => "infrastructureError",
        }
    }
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screenshots taken around the answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub before: Option<PathBuf>,
    pub after: Option<PathBuf>,
}

/// Everything known about one finished trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    pub engine: Engine,
    /// 1-based within the engine
    pub index: usize,
    pub kind: ChallengeKind,
    /// Challenge variant, e.g. math difficulty
    pub variant: Option<String>,
    pub outcome: TrialOutcome,
    pub reason: Option<String>,
    pub prompt: Option<String>,
    pub raw_response: Option<String>,
    pub parsed: Option<Answer>,
    pub ground_truth: Option<Answer>,
    /// Glyphs the executor could not click
    pub skipped: Vec<String>,
    pub result_text: Option<String>,
    pub evidence: Evidence,
    /// Last pipeline stage completed before the trial ended
    pub reached_state: TrialState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub recognition_latency_ms: Option<u64>,
}

impl TrialRecord {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outcome_wire_names_match_display() {
        for outcome in TrialOutcome::all() {
            assert_eq!(
                serde_json::to_string(&outcome).unwrap(),
                format!("\"{}\"", outcome)
            );
        }
        assert_eq!(TrialOutcome::failures().count(), 6);
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(TrialState::Init < TrialState::Parsed);
        assert!(TrialState::Verified < TrialState::Recorded);
        assert_eq!(
            serde_json::to_string(&TrialState::EvidenceCapturedBefore).unwrap(),
            "\"evidenceCapturedBefore\""
        );
    }
}
