//! Candidate validation gates, applied in order and short-circuiting on the
//! first failure:
//!
//! 1. syntactic validity
//! 2. import allowlist (no new root modules)
//! 3. interface preservation (names referenced elsewhere must survive)
//! 4. cosmetic-change detection (normalized-identical ⇒ not a real change)
//!
//! A cosmetic candidate is not rejected; it is flagged so the scorer caps it
//! at the minimum non-zero score.

use crate::chunker::Unit;
use crate::context::{self, FileContext};
use crate::error::RejectReason;
use crate::parse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub cosmetic: bool,
}

pub fn validate_unit(
    unit: &Unit,
    candidate: &str,
    ctx: &FileContext,
) -> Result<Verdict, RejectReason> {
    // Gate 1: candidate must parse.
    if let Err(e) = parse::parse(candidate) {
        return Err(RejectReason::Syntax(e.to_string()));
    }

    // Gate 2: no import whose root module is absent from the original file.
    let allowed = context::import_roots(&ctx.all_imports);
    for stmt in parse::import_statements(candidate) {
        for root in context::roots_of(&stmt) {
            if !allowed.contains(&root) {
                return Err(RejectReason::UnauthorizedImport(root));
            }
        }
    }

    // Gate 3: every provided name referenced elsewhere must still be defined.
    let referenced_elsewhere: std::collections::BTreeSet<&str> = ctx
        .cross_references
        .iter()
        .filter(|(def, _)| def.as_str() != unit.name)
        .flat_map(|(_, reads)| reads.iter().map(String::as_str))
        .collect();
    let defined = parse::defined_names(candidate);

    let mut missing = Vec::new();
    for provided in &unit.provides {
        match provided.split_once('.') {
            // Method granularity: if the class is referenced elsewhere, each
            // of its methods must survive in the candidate.
            Some((class, method)) => {
                if referenced_elsewhere.contains(class) && !defined.contains(method) {
                    missing.push(provided.clone());
                }
            }
            None => {
                if referenced_elsewhere.contains(provided.as_str())
                    && !defined.contains(provided)
                {
                    missing.push(provided.clone());
                }
            }
        }
    }
    if !missing.is_empty() {
        return Err(RejectReason::MissingProvides(missing));
    }

    // Gate 4: cosmetic-change detection.
    Ok(Verdict {
        cosmetic: normalize(&unit.source_text) == normalize(candidate),
    })
}

/// Structural normalization: comments, docstrings, and blank lines removed;
/// indentation reduced to a depth counter via an indent stack (so re-indenting
/// is cosmetic); remaining whitespace runs collapsed. Two snippets with equal
/// normalized forms differ only cosmetically.
pub fn normalize(source: &str) -> String {
    let Ok(logicals) = parse::logical_lines(source) else {
        return source.to_string();
    };

    let mut stack: Vec<usize> = vec![0];
    let mut out = String::new();
    for l in &logicals {
        while l.indent < *stack.last().unwrap_or(&0) {
            stack.pop();
        }
        if l.indent > *stack.last().unwrap_or(&0) {
            stack.push(l.indent);
        }
        let depth = stack.len() - 1;
        let collapsed = l.raw.split_whitespace().collect::<Vec<_>>().join(" ");
        out.push_str(&format!("{depth}:{collapsed}\n"));
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
