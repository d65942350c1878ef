//! One trial: load a challenge, recognise it, act on it, read the verdict.

mod runner;
mod types;

pub use runner::{TrialRunner, TrialTimings};
pub use types::{Evidence, TrialOutcome, TrialRecord, TrialState};
