//! Splits a parsed file into minimal independently-rewritable units: one
//! imports unit (context only, never rewritten) plus one unit per top-level
//! function or class. Units are immutable once extracted; identity is
//! `(kind, name, start_line)` within one extraction pass.

use std::collections::BTreeSet;

use crate::context::{self, FileContext};
use crate::parse::{SourceTree, TopKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Imports,
    Function,
    Class,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imports => write!(f, "imports"),
            Self::Function => write!(f, "function"),
            Self::Class => write!(f, "class"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub kind: UnitKind,
    pub name: String,
    pub source_text: String,
    /// 1-based inclusive.
    pub start_line: usize,
    /// 1-based inclusive.
    pub end_line: usize,
    /// Names read that resolve to file-level symbols.
    pub reads: BTreeSet<String>,
    /// Names this unit defines; for classes, also `Class.method` per method.
    pub provides: BTreeSet<String>,
    /// Import statements heuristically needed by `reads`.
    pub imports_needed: BTreeSet<String>,
}

impl Unit {
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.kind, self.name, self.start_line)
    }
}

/// Extract units from one file. The imports unit comes first when present.
pub fn chunk_file(source: &str, tree: &SourceTree, ctx: &FileContext) -> Vec<Unit> {
    let lines: Vec<&str> = source.lines().collect();
    let mut units = Vec::new();

    if !ctx.all_imports.is_empty() {
        units.push(Unit {
            kind: UnitKind::Imports,
            name: "imports".to_string(),
            source_text: ctx.all_imports.join("\n"),
            start_line: 1,
            end_line: ctx.all_imports.len(),
            reads: BTreeSet::new(),
            provides: BTreeSet::new(),
            imports_needed: BTreeSet::new(),
        });
    }

    let file_level = ctx.file_level_names();

    for node in tree.definitions() {
        let text = context::node_text(&lines, node);
        let end_line = node.start_line + text.lines().count().saturating_sub(1);

        let reads: BTreeSet<String> = context::read_names(&text)
            .into_iter()
            .filter(|n| file_level.contains(n))
            .collect();

        let mut provides = BTreeSet::new();
        provides.insert(node.name.clone());
        let kind = match node.kind {
            TopKind::Class => {
                for m in &node.methods {
                    provides.insert(format!("{}.{}", node.name, m));
                }
                UnitKind::Class
            }
            _ => UnitKind::Function,
        };

        let imports_needed = imports_for(&reads, &ctx.all_imports);

        units.push(Unit {
            kind,
            name: node.name.clone(),
            source_text: text,
            start_line: node.start_line,
            end_line,
            reads,
            provides,
            imports_needed,
        });
    }

    units
}

/// Heuristic import-need matching: an import is "needed" when its text
/// mentions a read name or any of its tokens starts with one. Not a precise
/// use-def resolution; it only ever selects from already-present imports, so
/// the no-unauthorized-imports invariant is unaffected.
fn imports_for(reads: &BTreeSet<String>, imports: &[String]) -> BTreeSet<String> {
    let mut needed = BTreeSet::new();
    for imp in imports {
        for dep in reads {
            if imp.contains(dep.as_str())
                || imp.split_whitespace().any(|tok| tok.starts_with(dep.as_str()))
            {
                needed.insert(imp.clone());
                break;
            }
        }
    }
    needed
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::build_context;
    use crate::parse;

    const SRC: &str = "\
import math

TWO = 2

def double(x):
    return x * TWO

def quad(x):
    return double(double(x)) + math.floor(0.5)

class Shape:
    def area(self):
        return TWO

    def name(self):
        return \"shape\"
";

    fn chunks() -> Vec<Unit> {
        let tree = parse::parse(SRC).unwrap();
        let ctx = build_context(SRC, &tree);
        chunk_file(SRC, &tree, &ctx)
    }

    #[test]
    fn test_imports_unit_first() {
        let units = chunks();
        assert_eq!(units[0].kind, UnitKind::Imports);
        assert_eq!(units[0].source_text, "import math");
        assert_eq!(units[0].start_line, 1);
    }

    #[test]
    fn test_one_unit_per_definition() {
        let units = chunks();
        let names: Vec<&str> = units[1..].iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["double", "quad", "Shape"]);
    }

    #[test]
    fn test_reads_resolve_to_file_level_only() {
        let units = chunks();
        let quad = units.iter().find(|u| u.name == "quad").unwrap();
        assert!(quad.reads.contains("double"));
        assert!(
            !quad.reads.contains("math"),
            "imported module is not a file-level symbol"
        );
        assert!(!quad.reads.contains("x"), "local name excluded");
    }

    #[test]
    fn test_class_provides_qualified_methods() {
        let units = chunks();
        let shape = units.iter().find(|u| u.name == "Shape").unwrap();
        assert_eq!(shape.kind, UnitKind::Class);
        assert!(shape.provides.contains("Shape"));
        assert!(shape.provides.contains("Shape.area"));
        assert!(shape.provides.contains("Shape.name"));
    }

    #[test]
    fn test_unit_identity() {
        let units = chunks();
        let double = units.iter().find(|u| u.name == "double").unwrap();
        assert_eq!(double.id(), format!("function:double:{}", double.start_line));
    }

    #[test]
    fn test_imports_needed_heuristic() {
        let reads: BTreeSet<String> = ["TWO".to_string(), "double".to_string()].into();
        let imports = vec!["import math".to_string(), "import doubletalk".to_string()];
        let needed = imports_for(&reads, &imports);
        // "doubletalk" token starts with the read "double" — heuristic overlap.
        assert!(needed.contains("import doubletalk"));
        assert!(!needed.contains("import math"));
    }

    #[test]
    fn test_fallback_boundary_for_eof_unit() {
        // Shape runs to EOF: its end must come from the indentation fallback.
        let units = chunks();
        let shape = units.iter().find(|u| u.name == "Shape").unwrap();
        assert!(shape.source_text.starts_with("class Shape:"));
        assert!(shape.source_text.ends_with("return \"shape\""));
        let total_lines = SRC.lines().count();
        assert_eq!(shape.end_line, total_lines);
    }

    #[test]
    fn test_decorated_eof_unit_includes_body() {
        // The decorator shares the header's indent; the fallback boundary
        // must not stop at the def line and truncate the unit to `@cached`.
        let src = "@cached\ndef f():\n    return 1\n";
        let tree = parse::parse(src).unwrap();
        let ctx = build_context(src, &tree);
        let units = chunk_file(src, &tree, &ctx);
        let f = units.iter().find(|u| u.name == "f").unwrap();
        assert_eq!(f.source_text, "@cached\ndef f():\n    return 1");
        assert_eq!(f.start_line, 1);
        assert_eq!(f.end_line, 3);
    }

    #[test]
    fn test_exact_boundary_for_dedent_unit() {
        let units = chunks();
        let double = units.iter().find(|u| u.name == "double").unwrap();
        assert_eq!(double.start_line, 5);
        assert_eq!(double.end_line, 6);
        assert_eq!(double.source_text, "def double(x):\n    return x * TWO");
    }
}
