//! Evidence session: where an experiment's screenshots live.
//!
//! Provides centralized management of experiment evidence with:
//! - One timestamped directory per experiment
//! - A `.session.json` manifest with environment evidence
//! - Deterministic capture paths per kind, engine, trial and phase

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::browser::Engine;
use crate::challenge::ChallengeKind;

/// Which side of the answer a screenshot was taken on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Before,
    After,
}

impl CapturePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapturePhase::Before => "before",
            CapturePhase::After => "after",
        }
    }
}

/// Facts about the machine an experiment ran on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub crate_version: String,
    pub created: String,
}

impl Environment {
    pub fn capture() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            created: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// An experiment's evidence directory
#[derive(Debug, Clone)]
pub struct EvidenceSession {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    pub kind: ChallengeKind,
}

impl EvidenceSession {
    /// Create a session under `base` with a unique, timestamped ID
    pub fn new(base: impl Into<PathBuf>, kind: ChallengeKind) -> Self {
        let id = format!("{}_{}", sanitize_name(kind.as_str()), generate_session_suffix());
        let dir = base.into().join(&id);
        Self { id, dir, kind }
    }

    /// Use an exact directory
    pub fn in_dir(dir: impl Into<PathBuf>, kind: ChallengeKind) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_session_suffix);
        Self { id, dir, kind }
    }

    /// Create the directory and write the manifest
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let metadata = serde_json::json!({
            "id": self.id,
            "kind": self.kind,
            "environment": Environment::capture(),
        });

        let metadata_path = self.dir.join(".session.json");
        fs::write(metadata_path, serde_json::to_string_pretty(&metadata)?)?;

        Ok(())
    }

    /// Path of a trial screenshot: `<kind>_<engine>_<index>_<phase>.png`
    pub fn capture_path(&self, engine: Engine, index: usize, phase: CapturePhase) -> PathBuf {
        let filename = format!(
            "{}_{}_{}_{}.png",
            sanitize_name(self.kind.as_str()),
            engine.as_str(),
            index,
            phase.as_str()
        );
        self.dir.join(filename)
    }
}

fn generate_session_suffix() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "{}_{}_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        millis % 1000,
        std::process::id()
    )
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("chinese-click"), "chinese_click");
        assert_eq!(sanitize_name("a/b\\c d"), "a_b_c_d");
    }

    #[test]
    fn test_capture_path() {
        let session = EvidenceSession::in_dir("/tmp/evidence/run", ChallengeKind::ChineseClick);
        assert_eq!(session.id, "run");
        assert!(
            session
                .capture_path(Engine::Firefox, 7, CapturePhase::After)
                .ends_with("chinese_click_firefox_7_after.png")
        );
    }

    #[test]
    fn test_init_writes_manifest() {
        let base = tempfile::tempdir().unwrap();
        let session = EvidenceSession::new(base.path(), ChallengeKind::Math);
        assert!(session.id.starts_with("math_"));
        session.init().unwrap();

        let manifest: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(session.dir.join(".session.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["kind"], "math");
        assert_eq!(manifest["environment"]["os"], std::env::consts::OS);
    }
}
