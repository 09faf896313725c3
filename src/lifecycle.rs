//! One full rewrite pass over a repository, and patch application with
//! rollback. Strictly sequential: one file is extracted, chunked, rewritten,
//! validated, and sandbox-tested before the next begins — the oracle and the
//! file system are serialized, stateful resources.
//!
//! Nothing here raises out of the batch loop: every per-file and per-unit
//! failure becomes a ledger event plus a skip. The one fatal path is applying
//! a record without a verifiable pre-patch snapshot.

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use xxhash_rust::xxh3::xxh3_64;

use crate::chunker::{self, Unit, UnitKind};
use crate::config::Config;
use crate::context::{self, FileContext};
use crate::depgraph;
use crate::error::PipelineError;
use crate::ledger::{Ledger, RewardAction, RewardEvent};
use crate::oracle::{self, Oracle};
use crate::parse;
use crate::record::{new_patch_id, PatchRecord, PatchState, PatchStore, UnitScore};
use crate::score;
use crate::validate;

// ── Options & summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Mean unit score below this discards the file candidate.
    pub min_score: u8,
    /// Character proxy for the oracle's token budget; oversized units are
    /// skipped, never truncated.
    pub max_prompt_chars: usize,
    /// Shell command run against a candidate path; zero exit within the
    /// timeout means the patch is safe to record.
    pub test_cmd: String,
    pub test_timeout: Duration,
    pub ignore_dirs: Vec<String>,
    pub verbose: u8,
}

impl PassOptions {
    pub fn from_config(config: &Config, verbose: u8) -> Self {
        Self {
            min_score: config.pipeline.min_score,
            max_prompt_chars: config.oracle.max_prompt_chars,
            test_cmd: config.pipeline.test_cmd.clone(),
            test_timeout: Duration::from_secs(config.pipeline.test_timeout_secs),
            ignore_dirs: config.filters.ignore_dirs.clone(),
            verbose,
        }
    }
}

#[derive(Debug, Default)]
pub struct PassSummary {
    pub files_seen: usize,
    pub skipped_pending: usize,
    pub skipped_parse: usize,
    pub skipped_low_score: usize,
    pub skipped_no_candidates: usize,
    pub tests_failed: usize,
    pub patches_created: usize,
}

// ── Pass ──────────────────────────────────────────────────────────────────────

/// Run one pass over every eligible source file under `root`. A single file's
/// failure never aborts the remaining files.
pub fn run_pass(root: &Path, oracle: &dyn Oracle, opts: &PassOptions) -> Result<PassSummary> {
    let store = PatchStore::open(root)?;
    let ledger = Ledger::open(root)?;
    let pending = store.pending_files()?;
    let mut summary = PassSummary::default();

    for path in depgraph::source_files(root, &opts.ignore_dirs) {
        let rel = depgraph::rel_path(root, &path);
        summary.files_seen += 1;

        if pending.contains(&rel) {
            summary.skipped_pending += 1;
            ledger.append(
                &RewardEvent::new(RewardAction::Skipped)
                    .file(&rel)
                    .reason("pending_patch"),
            )?;
            vlog(opts.verbose, &format!("skip {rel}: pending patch"));
            continue;
        }

        let source = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                ledger.append(
                    &RewardEvent::new(RewardAction::Error)
                        .file(&rel)
                        .reason(format!("unreadable: {e}")),
                )?;
                continue;
            }
        };

        match rewrite_file(&rel, &source, oracle, opts, &ledger, &mut summary)? {
            None => {}
            Some(outcome) => {
                if !sandbox_test(root, &path, &outcome.candidate_code, opts) {
                    summary.tests_failed += 1;
                    let err = PipelineError::SandboxTest {
                        file: rel.clone(),
                        reason: "test command failed or timed out".into(),
                    };
                    ledger.append(
                        &RewardEvent::new(RewardAction::TestsFailed)
                            .file(&rel)
                            .reason(err.to_string()),
                    )?;
                    vlog(opts.verbose, &format!("discard {rel}: sandbox tests failed"));
                    continue;
                }

                // Snapshot before any future overwrite of the live file.
                let bak = backup_path(&path);
                fs::write(&bak, &source)
                    .with_context(|| format!("cannot write backup {}", bak.display()))?;

                let id = new_patch_id(&path);
                let record = PatchRecord {
                    id: id.clone(),
                    target_file: rel.clone(),
                    description: "Refactored for readability and maintainability.".to_string(),
                    score: outcome.score,
                    created_at: Utc::now().to_rfc3339(),
                    state: PatchState::Proposed,
                    applied: false,
                    approved: false,
                    original_code: source.clone(),
                    candidate_code: outcome.candidate_code,
                    units: outcome.units,
                };
                store.save(&record)?;
                ledger.append(
                    &RewardEvent::new(RewardAction::Emitted)
                        .patch(&id)
                        .file(&rel)
                        .score(outcome.score),
                )?;
                summary.patches_created += 1;
                println!(
                    "{} {} (score {}/10) -> {}",
                    "proposed".green(),
                    rel,
                    outcome.score,
                    id
                );
            }
        }
    }

    Ok(summary)
}

struct FileOutcome {
    candidate_code: String,
    score: u8,
    units: Vec<UnitScore>,
}

fn rewrite_file(
    rel: &str,
    source: &str,
    oracle: &dyn Oracle,
    opts: &PassOptions,
    ledger: &Ledger,
    summary: &mut PassSummary,
) -> Result<Option<FileOutcome>> {
    let tree = match parse::parse(source) {
        Ok(t) => t,
        Err(e) => {
            summary.skipped_parse += 1;
            let err = PipelineError::Parse {
                file: rel.to_string(),
                source: e,
            };
            ledger.append(
                &RewardEvent::new(RewardAction::Skipped)
                    .file(rel)
                    .reason(format!("parse_error: {err}")),
            )?;
            vlog(opts.verbose, &format!("skip {rel}: {err}"));
            return Ok(None);
        }
    };

    let ctx = context::build_context(source, &tree);
    let units = chunker::chunk_file(source, &tree, &ctx);

    let (mut accepted, got_reply) = collect_candidates(rel, &units, &ctx, oracle, opts, ledger)?;
    // One bounded retry at file level, only when the oracle returned nothing
    // at all on the first attempt.
    if accepted.is_empty() && !got_reply && units.iter().any(|u| u.kind != UnitKind::Imports) {
        vlog(opts.verbose, &format!("retry {rel}: oracle returned nothing"));
        let (second, _) = collect_candidates(rel, &units, &ctx, oracle, opts, ledger)?;
        accepted = second;
    }

    if accepted.is_empty() {
        summary.skipped_no_candidates += 1;
        ledger.append(
            &RewardEvent::new(RewardAction::Skipped)
                .file(rel)
                .reason("no_candidates"),
        )?;
        return Ok(None);
    }

    let total: u32 = accepted.iter().map(|(_, _, s)| *s as u32).sum();
    let mean = (total as f64 / accepted.len() as f64).round() as u8;
    if mean < opts.min_score {
        summary.skipped_low_score += 1;
        ledger.append(
            &RewardEvent::new(RewardAction::Skipped)
                .file(rel)
                .score(mean)
                .reason("low_score"),
        )?;
        vlog(opts.verbose, &format!("skip {rel}: mean score {mean}/10"));
        return Ok(None);
    }

    let replacements: Vec<(usize, usize, String)> = accepted
        .iter()
        .map(|(u, code, _)| (u.start_line, u.end_line, code.clone()))
        .collect();
    let candidate_code = reassemble(source, &replacements);

    let units = accepted
        .into_iter()
        .map(|(u, code, s)| UnitScore {
            unit_id: u.id(),
            kind: u.kind.to_string(),
            name: u.name.clone(),
            score: s,
            start_line: u.start_line,
            end_line: u.end_line,
            original: u.source_text.clone(),
            candidate: code,
        })
        .collect();

    Ok(Some(FileOutcome {
        candidate_code,
        score: mean,
        units,
    }))
}

/// Oracle + validator + scorer for every non-import unit of one file.
/// Returns accepted `(unit, candidate, score)` triples and whether the oracle
/// produced any usable reply at all (drives the file-level retry).
fn collect_candidates<'a>(
    rel: &str,
    units: &'a [Unit],
    ctx: &FileContext,
    oracle: &dyn Oracle,
    opts: &PassOptions,
    ledger: &Ledger,
) -> Result<(Vec<(&'a Unit, String, u8)>, bool)> {
    let mut accepted = Vec::new();
    let mut got_reply = false;

    for unit in units.iter().filter(|u| u.kind != UnitKind::Imports) {
        let prompt = build_prompt(unit, ctx);
        if prompt.len() > opts.max_prompt_chars {
            ledger.append(
                &RewardEvent::new(RewardAction::Skipped)
                    .file(rel)
                    .reason(format!("prompt_too_large: {}", unit.id())),
            )?;
            vlog(
                opts.verbose,
                &format!("skip unit {} ({} chars)", unit.id(), prompt.len()),
            );
            continue;
        }

        let raw = match oracle.rewrite(&prompt) {
            Ok(r) => r,
            Err(e) => {
                let err = PipelineError::Oracle(e.to_string());
                ledger.append(
                    &RewardEvent::new(RewardAction::Skipped)
                        .file(rel)
                        .reason(format!("oracle_error: {}: {err}", unit.id())),
                )?;
                continue;
            }
        };
        let Some(candidate) = oracle::interpret_reply(&raw) else {
            ledger.append(
                &RewardEvent::new(RewardAction::Skipped)
                    .file(rel)
                    .reason(format!("oracle_failure: {}", unit.id())),
            )?;
            continue;
        };
        got_reply = true;

        match validate::validate_unit(unit, &candidate, ctx) {
            Err(reason) => {
                let err = PipelineError::Rejected(reason.clone());
                ledger.append(
                    &RewardEvent::new(RewardAction::Rejected)
                        .file(rel)
                        .reason(format!("{}: {}", reason.code(), unit.id())),
                )?;
                vlog(opts.verbose, &format!("reject {}: {err}", unit.id()));
            }
            Ok(verdict) => {
                let s = if verdict.cosmetic {
                    score::COSMETIC_SCORE
                } else {
                    score::score(&candidate, &unit.source_text)
                };
                vlog(
                    opts.verbose,
                    &format!("accept {} (score {s}/10)", unit.id()),
                );
                accepted.push((unit, candidate, s));
            }
        }
    }

    Ok((accepted, got_reply))
}

/// Bounded prompt: imports as immutable context (the unit's own when known,
/// the whole file's otherwise), a note per dependency, then the unit body.
fn build_prompt(unit: &Unit, ctx: &FileContext) -> String {
    let mut parts: Vec<String> = Vec::new();
    let imports: Vec<&String> = if unit.imports_needed.is_empty() {
        ctx.all_imports.iter().collect()
    } else {
        unit.imports_needed.iter().collect()
    };
    if !imports.is_empty() {
        parts.push("# IMPORTANT: the following imports are already in the file:".to_string());
        for imp in imports {
            parts.push(format!("# {imp}"));
        }
        parts.push(String::new());
    }
    if !unit.reads.is_empty() {
        parts.push("# Context - names defined elsewhere in this file:".to_string());
        for dep in &unit.reads {
            parts.push(format!("# {dep} is used in this file"));
        }
        parts.push(String::new());
    }
    parts.push("# Code to refactor:".to_string());
    parts.push(unit.source_text.clone());
    parts.join("\n")
}

/// Replace each unit's line range with its candidate text, in descending
/// start-line order so earlier replacements never shift later offsets.
/// Ranges are 1-based inclusive.
pub fn reassemble(original: &str, replacements: &[(usize, usize, String)]) -> String {
    let mut lines: Vec<String> = original.lines().map(String::from).collect();
    let mut ordered: Vec<&(usize, usize, String)> = replacements.iter().collect();
    ordered.sort_by(|a, b| b.0.cmp(&a.0));

    for (start_line, end_line, text) in ordered {
        let start = start_line.saturating_sub(1).min(lines.len());
        let end = (*end_line).min(lines.len()).max(start);
        lines.splice(start..end, text.lines().map(String::from));
    }

    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    out
}

// ── Sandbox & test command ────────────────────────────────────────────────────

/// Write the candidate to a sandbox temp file and run the test command against
/// it. The live file is never touched.
fn sandbox_test(root: &Path, target: &Path, candidate: &str, opts: &PassOptions) -> bool {
    let dir = root.join(".repatch").join("sandbox");
    if fs::create_dir_all(&dir).is_err() {
        return false;
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "candidate".to_string());
    let Ok(file) = tempfile::Builder::new()
        .prefix(&format!("{stem}_"))
        .suffix(".py")
        .tempfile_in(&dir)
    else {
        return false;
    };
    if fs::write(file.path(), candidate).is_err() {
        return false;
    }
    run_test_cmd(&opts.test_cmd, file.path(), opts.test_timeout, root)
}

/// Run `<cmd> <path>` through the shell with a wall-clock timeout. Timeout,
/// spawn failure, and non-zero exit are all plain failures.
pub(crate) fn run_test_cmd(cmd: &str, target: &Path, timeout: Duration, cwd: &Path) -> bool {
    let full = format!("{cmd} '{}'", target.display());
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&full)
        .current_dir(cwd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(c) => c,
        Err(_) => return false,
    };

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(_) => return false,
        }
    }
}

// ── Apply & rollback ──────────────────────────────────────────────────────────

pub fn backup_path(target: &Path) -> PathBuf {
    PathBuf::from(format!("{}.bak", target.display()))
}

/// Apply one pending record: verify the backup, approve, backup-then-overwrite,
/// run tests against the live file, and revert byte-for-byte on failure.
/// Returns Ok(true) iff the patch is applied and its tests passed.
pub fn apply_record(root: &Path, id: &str, opts: &PassOptions) -> Result<bool> {
    let store = PatchStore::open(root)?;
    let ledger = Ledger::open(root)?;
    let mut record = store.load(id)?;

    if record.state != PatchState::Proposed {
        println!(
            "{} {id} is {} — nothing to do",
            "skip".yellow(),
            record.state
        );
        return Ok(false);
    }

    let target = root.join(&record.target_file);
    let bak = backup_path(&target);
    let live = fs::read_to_string(&target)
        .with_context(|| format!("cannot read target {}", target.display()))?;

    // Fatal precondition: a verifiable pre-patch snapshot must exist and both
    // it and the live file must still match the recorded original.
    if let Err(reason) = verify_backup(&bak, &live, &record.original_code) {
        ledger.append(
            &RewardEvent::new(RewardAction::Error)
                .patch(id)
                .file(&record.target_file)
                .reason(format!("backup_missing: {reason}")),
        )?;
        return Err(PipelineError::BackupMissing {
            file: record.target_file.clone(),
            reason,
        }
        .into());
    }

    record.advance(PatchState::Approved)?;
    store.save(&record)?;

    // Backup before overwrite, never the other way around.
    fs::write(&bak, &live).with_context(|| format!("cannot refresh backup {}", bak.display()))?;
    fs::write(&target, &record.candidate_code)
        .with_context(|| format!("cannot write target {}", target.display()))?;
    record.advance(PatchState::Applied)?;
    store.save(&record)?;
    ledger.append(
        &RewardEvent::new(RewardAction::Approved)
            .patch(id)
            .file(&record.target_file)
            .score(record.score),
    )?;

    if run_test_cmd(&opts.test_cmd, &target, opts.test_timeout, root) {
        record.advance(PatchState::TestsPassed)?;
        store.save(&record)?;
        ledger.append(
            &RewardEvent::new(RewardAction::TestsPassed)
                .patch(id)
                .file(&record.target_file),
        )?;
        println!("{} {id} applied to {}", "ok".green(), record.target_file);
        Ok(true)
    } else {
        // Persist the failure before touching the file system again: if the
        // restore itself fails, the record and ledger must still tell the
        // truth instead of reporting the patch as applied.
        record.advance(PatchState::TestsFailed)?;
        store.save(&record)?;
        ledger.append(
            &RewardEvent::new(RewardAction::TestsFailed)
                .patch(id)
                .file(&record.target_file),
        )?;
        fs::copy(&bak, &target)
            .with_context(|| format!("cannot restore backup {}", bak.display()))?;
        record.advance(PatchState::Reverted)?;
        store.save(&record)?;
        ledger.append(
            &RewardEvent::new(RewardAction::TestsFailed)
                .patch(id)
                .file(&record.target_file)
                .reason("reverted"),
        )?;
        println!(
            "{} {id}: tests failed, {} reverted",
            "rollback".red(),
            record.target_file
        );
        Ok(false)
    }
}

fn verify_backup(bak: &Path, live: &str, original: &str) -> Result<(), String> {
    if !bak.exists() {
        return Err("backup file missing".to_string());
    }
    let bak_content =
        fs::read_to_string(bak).map_err(|e| format!("backup unreadable: {e}"))?;
    let original_hash = xxh3_64(original.as_bytes());
    if xxh3_64(bak_content.as_bytes()) != original_hash {
        return Err("backup does not match recorded original".to_string());
    }
    if xxh3_64(live.as_bytes()) != original_hash {
        return Err("target changed since the patch was proposed".to_string());
    }
    Ok(())
}

fn vlog(verbose: u8, msg: &str) {
    if verbose > 0 {
        eprintln!("{} {msg}", "repatch:".dimmed());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
