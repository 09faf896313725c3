//! Per-file symbol context: imports, top-level names, and the cross-reference
//! map (what each top-level definition reads). Built once per rewrite pass and
//! consumed read-only by the chunker and the validator.

use std::collections::{BTreeMap, BTreeSet};

use crate::parse::{self, SourceTree, TopKind};

/// Snapshot of one file's symbol surface.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// Import statements in source order, verbatim text.
    pub all_imports: Vec<String>,
    pub top_level_vars: BTreeSet<String>,
    pub all_functions: BTreeSet<String>,
    pub all_classes: BTreeSet<String>,
    /// definition name → names it reads.
    pub cross_references: BTreeMap<String, BTreeSet<String>>,
}

impl FileContext {
    /// Every name defined at file level (function, class, or global var).
    pub fn file_level_names(&self) -> BTreeSet<String> {
        let mut out = self.top_level_vars.clone();
        out.extend(self.all_functions.iter().cloned());
        out.extend(self.all_classes.iter().cloned());
        out
    }
}

/// Build the context from an already-parsed tree. Two passes over the tree:
/// one for top-level names, one for per-definition reads.
pub fn build_context(source: &str, tree: &SourceTree) -> FileContext {
    let lines: Vec<&str> = source.lines().collect();
    let mut ctx = FileContext::default();

    for node in &tree.nodes {
        match node.kind {
            TopKind::Import => {
                let end = node.end_line.unwrap_or(node.start_line).min(lines.len());
                ctx.all_imports
                    .push(lines[node.start_line - 1..end].join("\n"));
            }
            TopKind::Assign => {
                ctx.top_level_vars.insert(node.name.clone());
            }
            TopKind::Function => {
                ctx.all_functions.insert(node.name.clone());
            }
            TopKind::Class => {
                ctx.all_classes.insert(node.name.clone());
            }
        }
    }

    for node in tree.definitions() {
        let body = node_text(&lines, node);
        ctx.cross_references
            .insert(node.name.clone(), read_names(&body));
    }

    ctx
}

/// Text of one top-level node, using the indentation fallback when the parser
/// reported no end boundary. The fallback scans from the header line, not the
/// decorator, since decorators share the header's indent.
pub fn node_text(lines: &[&str], node: &parse::TopNode) -> String {
    let start = node.start_line - 1;
    let end = match node.end_line {
        Some(e) => e.min(lines.len()),
        None => parse::indent_fallback_end(lines, node.header_line - 1) + 1,
    };
    lines[start..end].join("\n")
}

const PY_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "case", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "match", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Free-name reads in a snippet: identifier occurrences excluding keywords,
/// attribute access, definition names, and statement-level assignment targets.
/// An approximation of AST load analysis (parameters and loop targets leak
/// through); callers filter against known file-level names.
pub fn read_names(source: &str) -> BTreeSet<String> {
    use lazy_static::lazy_static;
    use regex::Regex;
    lazy_static! {
        static ref IDENT: Regex =
            Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier regex");
        static ref ANNOT_ASSIGN: Regex =
            Regex::new(r"^:\s*[^=]+=[^=]").expect("valid annotated assign regex");
    }

    let mut out = BTreeSet::new();
    let Ok(logicals) = parse::logical_lines(source) else {
        return out;
    };

    for l in &logicals {
        let code = &l.code;
        let first = code.split_whitespace().next().unwrap_or("");
        if matches!(first, "import" | "from" | "global" | "nonlocal") {
            continue;
        }
        for m in IDENT.find_iter(code) {
            let name = m.as_str();
            if PY_KEYWORDS.contains(&name) {
                continue;
            }
            let before = code[..m.start()].trim_end();
            if before.ends_with('.') {
                continue; // attribute access, not a free name
            }
            if matches!(prev_token(before), "def" | "class") {
                continue;
            }
            if m.start() == 0 {
                let rest = code[m.end()..].trim_start();
                if (rest.starts_with('=') && !rest.starts_with("==")) || ANNOT_ASSIGN.is_match(rest)
                {
                    continue; // statement-level store
                }
            }
            out.insert(name.to_string());
        }
    }
    out
}

fn prev_token(before: &str) -> &str {
    match before.rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        Some(p) => &before[p + 1..],
        None => before,
    }
}

/// Root modules of a file's import list; the allowlist for new imports.
pub fn import_roots(imports: &[String]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for stmt in imports {
        out.extend(roots_of(stmt));
    }
    out
}

/// All root modules named by one import statement.
/// `import os, sys` → {os, sys}; `from a.b import c` → {a}.
pub(crate) fn roots_of(stmt: &str) -> Vec<String> {
    let flat = stmt.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.starts_with("from ") {
        return parse::import_root(&flat).into_iter().collect();
    }
    let Some(rest) = flat.strip_prefix("import ") else {
        return Vec::new();
    };
    rest.split(',')
        .filter_map(|part| {
            let module = part.trim().split_whitespace().next()?;
            let root = module.trim_start_matches('.').split('.').next()?;
            if root.is_empty() {
                None
            } else {
                Some(root.to_string())
            }
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "\
import os
from pathlib import Path

LIMIT = 10

def helper(x):
    return x + LIMIT

def main():
    p = Path(os.getcwd())
    return helper(len(str(p)))
";

    fn ctx() -> FileContext {
        let tree = parse::parse(SRC).unwrap();
        build_context(SRC, &tree)
    }

    #[test]
    fn test_imports_collected_in_order() {
        let c = ctx();
        assert_eq!(
            c.all_imports,
            vec!["import os", "from pathlib import Path"]
        );
    }

    #[test]
    fn test_top_level_names() {
        let c = ctx();
        assert!(c.top_level_vars.contains("LIMIT"));
        assert!(c.all_functions.contains("helper"));
        assert!(c.all_functions.contains("main"));
        assert!(c.all_classes.is_empty());
    }

    #[test]
    fn test_cross_references_record_reads() {
        let c = ctx();
        let main_refs = &c.cross_references["main"];
        assert!(main_refs.contains("helper"), "main reads helper");
        assert!(main_refs.contains("Path"));
        let helper_refs = &c.cross_references["helper"];
        assert!(helper_refs.contains("LIMIT"));
        assert!(!helper_refs.contains("helper"), "own def name is not a read");
    }

    #[test]
    fn test_read_names_skips_stores_and_attributes() {
        let names = read_names("total = count + obj.count\n");
        assert!(names.contains("count"));
        assert!(names.contains("obj"));
        assert!(!names.contains("total"), "assignment target is a store");
    }

    #[test]
    fn test_read_names_skips_keywords_and_import_lines() {
        let names = read_names("import os\nif flag:\n    return value\n");
        assert!(!names.contains("os"));
        assert!(!names.contains("if"));
        assert!(names.contains("flag"));
        assert!(names.contains("value"));
    }

    #[test]
    fn test_read_names_skips_string_contents() {
        let names = read_names("msg = \"hello friend\"\nprint(msg)\n");
        assert!(!names.contains("hello"));
        assert!(names.contains("msg"), "msg is read by print");
    }

    #[test]
    fn test_import_roots_multi_module() {
        let roots = import_roots(&[
            "import os, sys".to_string(),
            "from collections import defaultdict".to_string(),
            "import xml.etree as et".to_string(),
        ]);
        assert!(roots.contains("os"));
        assert!(roots.contains("sys"));
        assert!(roots.contains("collections"));
        assert!(roots.contains("xml"));
        assert!(!roots.contains("etree"));
    }

    #[test]
    fn test_file_level_names_union() {
        let c = ctx();
        let names = c.file_level_names();
        assert!(names.contains("LIMIT"));
        assert!(names.contains("helper"));
        assert!(names.contains("main"));
    }
}
