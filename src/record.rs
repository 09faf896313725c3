//! Persistent patch records: one JSON file per proposed file-level patch,
//! plus the forward-only state machine governing its lifecycle:
//!
//! `proposed → {rejected | approved} → applied → {tests_passed |
//! tests_failed → reverted}`
//!
//! Invariant enforced by the pass loop: at most one non-terminal record per
//! target file.

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Proposed,
    Rejected,
    Approved,
    Applied,
    TestsPassed,
    TestsFailed,
    Reverted,
}

impl PatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::TestsPassed | Self::Reverted)
    }

    /// Transitions only move forward; no state returns to `Proposed`.
    pub fn can_advance(self, next: PatchState) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Rejected)
                | (Self::Proposed, Self::Approved)
                | (Self::Approved, Self::Applied)
                | (Self::Applied, Self::TestsPassed)
                | (Self::Applied, Self::TestsFailed)
                | (Self::TestsFailed, Self::Reverted)
        )
    }
}

impl std::fmt::Display for PatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::Rejected => "rejected",
            Self::Approved => "approved",
            Self::Applied => "applied",
            Self::TestsPassed => "tests_passed",
            Self::TestsFailed => "tests_failed",
            Self::Reverted => "reverted",
        };
        write!(f, "{s}")
    }
}

/// Per-unit outcome embedded in the record, for offline analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitScore {
    pub unit_id: String,
    pub kind: String,
    pub name: String,
    pub score: u8,
    pub start_line: usize,
    pub end_line: usize,
    pub original: String,
    pub candidate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub id: String,
    /// Repo-relative path of the file this patch replaces.
    pub target_file: String,
    pub description: String,
    pub score: u8,
    pub created_at: String,
    pub state: PatchState,
    pub applied: bool,
    pub approved: bool,
    pub original_code: String,
    pub candidate_code: String,
    pub units: Vec<UnitScore>,
}

impl PatchRecord {
    pub fn advance(&mut self, next: PatchState) -> Result<()> {
        if !self.state.can_advance(next) {
            bail!(
                "invalid patch state transition: {} -> {} ({})",
                self.state,
                next,
                self.id
            );
        }
        self.state = next;
        match next {
            PatchState::Approved => self.approved = true,
            PatchState::Applied => self.applied = true,
            PatchState::Reverted => self.applied = false,
            _ => {}
        }
        Ok(())
    }
}

/// Timestamp + filename derived identifier, e.g.
/// `PATCH_2026-08-31_14-02-07.113_util`.
pub fn new_patch_id(target: &Path) -> String {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    format!("PATCH_{}_{stem}", Local::now().format("%Y-%m-%d_%H-%M-%S%.3f"))
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Directory-backed record store under `<root>/.repatch/patches/`.
pub struct PatchStore {
    dir: PathBuf,
}

impl PatchStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(".repatch").join("patches");
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create patch dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn save(&self, record: &PatchRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)
            .with_context(|| format!("cannot write patch record {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<PatchRecord> {
        let path = self.record_path(id);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("patch record not found: {id}"))?;
        serde_json::from_str(&text)
            .with_context(|| format!("corrupt patch record: {}", path.display()))
    }

    /// All records, oldest first. Corrupt files are skipped, not fatal.
    pub fn list(&self) -> Result<Vec<PatchRecord>> {
        let mut records = Vec::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(record) = serde_json::from_str::<PatchRecord>(&text) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Records still awaiting a terminal state.
    pub fn pending(&self) -> Result<Vec<PatchRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect())
    }

    /// Target files with a pending record; the pass skips these.
    pub fn pending_files(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .pending()?
            .into_iter()
            .map(|r| r.target_file)
            .collect())
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PatchRecord {
        PatchRecord {
            id: "PATCH_test_util".to_string(),
            target_file: "util.py".to_string(),
            description: "refactored for readability".to_string(),
            score: 7,
            created_at: "2026-08-31T00:00:00Z".to_string(),
            state: PatchState::Proposed,
            applied: false,
            approved: false,
            original_code: "x = 1\n".to_string(),
            candidate_code: "x = 2\n".to_string(),
            units: Vec::new(),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut r = record();
        r.advance(PatchState::Approved).unwrap();
        assert!(r.approved);
        r.advance(PatchState::Applied).unwrap();
        assert!(r.applied);
        r.advance(PatchState::TestsPassed).unwrap();
        assert!(r.state.is_terminal());
    }

    #[test]
    fn test_rollback_path_clears_applied() {
        let mut r = record();
        r.advance(PatchState::Approved).unwrap();
        r.advance(PatchState::Applied).unwrap();
        r.advance(PatchState::TestsFailed).unwrap();
        r.advance(PatchState::Reverted).unwrap();
        assert!(!r.applied, "reverted record is no longer applied");
        assert!(r.state.is_terminal());
    }

    #[test]
    fn test_no_backward_transitions() {
        let mut r = record();
        r.advance(PatchState::Approved).unwrap();
        assert!(r.advance(PatchState::Proposed).is_err());
        assert!(r.advance(PatchState::Rejected).is_err());
    }

    #[test]
    fn test_terminal_states_are_dead_ends() {
        let mut r = record();
        r.advance(PatchState::Rejected).unwrap();
        for next in [
            PatchState::Proposed,
            PatchState::Approved,
            PatchState::Applied,
            PatchState::TestsPassed,
        ] {
            assert!(r.state.can_advance(next) == false, "rejected -> {next} allowed");
        }
    }

    #[test]
    fn test_skip_applied_without_approved_is_invalid() {
        let mut r = record();
        assert!(r.advance(PatchState::Applied).is_err());
    }

    #[test]
    fn test_store_round_trip_and_pending() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = PatchStore::open(tmp.path()).unwrap();

        let mut r = record();
        store.save(&r).unwrap();
        assert_eq!(store.pending_files().unwrap().len(), 1);

        let loaded = store.load(&r.id).unwrap();
        assert_eq!(loaded.target_file, "util.py");
        assert_eq!(loaded.state, PatchState::Proposed);

        r.advance(PatchState::Rejected).unwrap();
        store.save(&r).unwrap();
        assert!(store.pending().unwrap().is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_patch_id_embeds_stem() {
        let id = new_patch_id(Path::new("src/tools/helper.py"));
        assert!(id.starts_with("PATCH_"));
        assert!(id.ends_with("_helper"));
    }
}
