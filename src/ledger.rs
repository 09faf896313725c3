//! Append-only reward ledger: one JSON line per lifecycle event under
//! `<root>/.repatch/rewards.jsonl`. Never updated or deleted — analyze later.
//! Appends take an exclusive flock so a concurrent reader never sees a torn
//! line.

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardAction {
    Emitted,
    Approved,
    Rejected,
    Skipped,
    TestsPassed,
    TestsFailed,
    Error,
}

impl std::fmt::Display for RewardAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Emitted => "emitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
            Self::TestsPassed => "tests_passed",
            Self::TestsFailed => "tests_failed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEvent {
    pub when: String,
    pub action: RewardAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RewardEvent {
    pub fn new(action: RewardAction) -> Self {
        Self {
            when: Utc::now().to_rfc3339(),
            action,
            patch_id: None,
            file: None,
            score: None,
            reason: None,
        }
    }

    pub fn patch(mut self, id: &str) -> Self {
        self.patch_id = Some(id.to_string());
        self
    }

    pub fn file(mut self, file: &str) -> Self {
        self.file = Some(file.to_string());
        self
    }

    pub fn score(mut self, score: u8) -> Self {
        self.score = Some(score);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(".repatch");
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create ledger dir {}", dir.display()))?;
        Ok(Self {
            path: dir.join("rewards.jsonl"),
        })
    }

    pub fn append(&self, event: &RewardEvent) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open ledger {}", self.path.display()))?;
        file.lock_exclusive()?;
        let mut file = file;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        file.unlock()?;
        Ok(())
    }

    /// Read back all events, oldest first. Torn or foreign lines are skipped.
    pub fn events(&self) -> Result<Vec<RewardEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(tmp.path()).unwrap();

        ledger
            .append(&RewardEvent::new(RewardAction::Emitted).file("a.py").score(7))
            .unwrap();
        ledger
            .append(
                &RewardEvent::new(RewardAction::Skipped)
                    .file("b.py")
                    .reason("low_score"),
            )
            .unwrap();

        let events = ledger.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, RewardAction::Emitted);
        assert_eq!(events[0].score, Some(7));
        assert_eq!(events[1].reason.as_deref(), Some("low_score"));
    }

    #[test]
    fn test_ledger_is_additive_across_opens() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let ledger = Ledger::open(tmp.path()).unwrap();
            ledger
                .append(&RewardEvent::new(RewardAction::Emitted))
                .unwrap();
        }
        let ledger = Ledger::open(tmp.path()).unwrap();
        ledger
            .append(&RewardEvent::new(RewardAction::Approved))
            .unwrap();
        assert_eq!(ledger.events().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_ledger_reads_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(tmp.path()).unwrap();
        assert!(ledger.events().unwrap().is_empty());
    }
}
