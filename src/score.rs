//! Deterministic 0–10 patch quality score. Additive terms for validity, size,
//! formatting consistency, and diff magnitude — with one override: a
//! candidate that is only cosmetically different from the original is capped
//! at the minimum non-zero score no matter what the other terms say.

use std::collections::HashMap;

use crate::parse;
use crate::validate;

/// Score given to cosmetic (normalized-identical) candidates.
pub const COSMETIC_SCORE: u8 = 1;

/// Line-diff magnitude above which the change earns the diff bonus.
const DIFF_BONUS_THRESHOLD: usize = 4;

pub fn score(candidate: &str, original: &str) -> u8 {
    if !parse::is_valid_source(candidate) {
        return 0;
    }
    if validate::normalize(candidate) == validate::normalize(original) {
        return COSMETIC_SCORE;
    }

    let lines: Vec<&str> = candidate.trim().lines().collect();
    let mut score = 4u8; // syntactic validity

    if lines.len() >= 3 {
        score += 2; // non-trivial size
    }
    if consistent_indentation(&lines) {
        score += 2;
    }
    if lines.iter().any(|l| {
        let t = l.trim_start();
        t.starts_with("def ") || t.starts_with("async def ") || t.starts_with("class ")
    }) {
        score += 1;
    }
    if line_diff_count(original, candidate) > DIFF_BONUS_THRESHOLD {
        score += 1;
    }

    score
}

/// True when no line mixes tabs and spaces in its indent and the candidate
/// does not switch indent style between lines.
fn consistent_indentation(lines: &[&str]) -> bool {
    let mut seen_space = false;
    let mut seen_tab = false;
    for line in lines {
        let lead: String = line.chars().take_while(|c| c.is_whitespace()).collect();
        if lead.contains(' ') {
            seen_space = true;
        }
        if lead.contains('\t') {
            seen_tab = true;
        }
    }
    !(seen_space && seen_tab)
}

/// Multiset symmetric difference of line contents: how many lines were added
/// plus how many were removed. Order-insensitive, cheap, deterministic.
fn line_diff_count(a: &str, b: &str) -> usize {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for line in a.trim().lines() {
        *counts.entry(line.trim_end()).or_default() += 1;
    }
    for line in b.trim().lines() {
        *counts.entry(line.trim_end()).or_default() -= 1;
    }
    counts.values().map(|c| c.unsigned_abs() as usize).sum()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
