//! Line-structural Python parser: `parse(text) -> SourceTree | ParseError`.
//!
//! Not a full grammar — a bracket- and string-aware scanner that recovers the
//! top-level shape of a file: imports, assignments, `def`/`class` blocks with
//! line spans, and class method names. The tree stays opaque to downstream
//! stages so the scanner can be swapped for a real parser later.
//!
//! Blocks closed by a dedent get an exact end line. Blocks running to EOF
//! report `end_line: None`; callers use `indent_fallback_end` to estimate the
//! boundary by indentation, which reproduces the original scan-forward
//! semantics (skip blanks, stop at a line back at the definition's indent).

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use thiserror::Error;

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopKind {
    Import,
    Assign,
    Function,
    Class,
}

/// One top-level node. `start_line`/`end_line` are 1-based inclusive;
/// decorators are included in the span.
#[derive(Debug, Clone)]
pub struct TopNode {
    pub kind: TopKind,
    pub name: String,
    pub start_line: usize,
    /// First line of the header itself, decorators excluded. The indentation
    /// fallback must scan from here: the decorator line sits at the same
    /// indent as the header and would terminate the scan immediately.
    pub header_line: usize,
    /// `None` when the block runs to EOF (no dedent observed).
    pub end_line: Option<usize>,
    /// Method names, for `Class` nodes only.
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    pub nodes: Vec<TopNode>,
}

impl SourceTree {
    pub fn imports(&self) -> impl Iterator<Item = &TopNode> {
        self.nodes.iter().filter(|n| n.kind == TopKind::Import)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TopNode> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, TopKind::Function | TopKind::Class))
    }

    pub fn assignments(&self) -> impl Iterator<Item = &TopNode> {
        self.nodes.iter().filter(|n| n.kind == TopKind::Assign)
    }
}

// ── Logical lines ─────────────────────────────────────────────────────────────

/// A logical statement: one or more physical lines joined across open
/// brackets, backslash continuations, and triple-quoted strings.
/// `code` has string bodies blanked and comments removed; `raw` keeps string
/// bodies (used by the cosmetic-change normalizer).
#[derive(Debug, Clone)]
pub(crate) struct Logical {
    /// 0-based first physical line.
    pub start: usize,
    /// 0-based last physical line, inclusive.
    pub end: usize,
    /// Leading whitespace chars of the first physical line.
    pub indent: usize,
    pub code: String,
    pub raw: String,
}

#[derive(Default)]
struct ScanState {
    depth: i32,
    /// Quote char of an open triple-quoted string.
    triple: Option<char>,
}

/// Scan one physical line. Returns (blanked, kept): `blanked` replaces string
/// bodies with a space and drops comments; `kept` preserves string bodies.
/// Updates bracket depth and triple-string state.
fn scan_code(line: &str, st: &mut ScanState) -> (String, String) {
    let chars: Vec<char> = line.chars().collect();
    let mut blanked = String::with_capacity(line.len());
    let mut kept = String::with_capacity(line.len());
    let mut i = 0;

    while i < chars.len() {
        if let Some(q) = st.triple {
            // Inside a triple-quoted string: look for the terminator.
            let mut close = None;
            let mut p = i;
            while p < chars.len() {
                if chars[p] == q && chars.get(p + 1) == Some(&q) && chars.get(p + 2) == Some(&q) {
                    close = Some(p);
                    break;
                }
                p += 1;
            }
            match close {
                Some(p) => {
                    for c in &chars[i..p + 3] {
                        kept.push(*c);
                    }
                    blanked.push(' ');
                    st.triple = None;
                    i = p + 3;
                }
                None => {
                    for c in &chars[i..] {
                        kept.push(*c);
                    }
                    return (blanked, kept);
                }
            }
            continue;
        }

        let c = chars[i];
        match c {
            '#' => break, // comment: drop the rest of the line
            '\'' | '"' => {
                if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                    st.triple = Some(c);
                    kept.push(c);
                    kept.push(c);
                    kept.push(c);
                    i += 3;
                } else {
                    // Single-line string: scan to the closing quote.
                    kept.push(c);
                    i += 1;
                    while i < chars.len() {
                        if chars[i] == '\\' && i + 1 < chars.len() {
                            kept.push(chars[i]);
                            kept.push(chars[i + 1]);
                            i += 2;
                            continue;
                        }
                        kept.push(chars[i]);
                        if chars[i] == c {
                            i += 1;
                            break;
                        }
                        i += 1;
                    }
                    blanked.push(' ');
                }
            }
            '(' | '[' | '{' => {
                st.depth += 1;
                blanked.push(c);
                kept.push(c);
                i += 1;
            }
            ')' | ']' | '}' => {
                st.depth -= 1;
                blanked.push(c);
                kept.push(c);
                i += 1;
            }
            _ => {
                blanked.push(c);
                kept.push(c);
                i += 1;
            }
        }
    }

    (blanked, kept)
}

fn indent_width(line: &str) -> usize {
    line.chars().take_while(|c| c.is_whitespace()).count()
}

/// Split source into logical statements. Blank, comment-only, and pure-string
/// (docstring) statements are dropped.
pub(crate) fn logical_lines(source: &str) -> Result<Vec<Logical>, ParseError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut st = ScanState::default();
    let mut out: Vec<Logical> = Vec::new();
    let mut cur: Option<Logical> = None;
    let mut prev_backslash = false;

    for (i, raw_line) in lines.iter().enumerate() {
        let was_continuing = st.triple.is_some() || st.depth > 0 || prev_backslash;
        let (blanked, kept) = scan_code(raw_line, &mut st);
        if st.depth < 0 {
            return Err(ParseError {
                line: i + 1,
                reason: "unbalanced closing bracket".into(),
            });
        }

        let mut code_piece = blanked.trim().to_string();
        let mut raw_piece = kept.trim().to_string();
        let backslash = st.triple.is_none() && code_piece.ends_with('\\');
        if backslash {
            code_piece.pop();
            raw_piece.pop();
            code_piece = code_piece.trim_end().to_string();
            raw_piece = raw_piece.trim_end().to_string();
        }
        prev_backslash = backslash;
        let still_open = st.depth > 0 || st.triple.is_some() || backslash;

        if was_continuing {
            if let Some(l) = cur.as_mut() {
                if !code_piece.is_empty() {
                    if !l.code.is_empty() {
                        l.code.push(' ');
                    }
                    l.code.push_str(&code_piece);
                }
                if !raw_piece.is_empty() {
                    if !l.raw.is_empty() {
                        l.raw.push(' ');
                    }
                    l.raw.push_str(&raw_piece);
                }
                l.end = i;
            }
            if !still_open {
                if let Some(l) = cur.take() {
                    if !l.code.is_empty() {
                        out.push(l);
                    }
                }
            }
        } else {
            if code_piece.is_empty() && raw_piece.is_empty() && !still_open {
                continue; // blank or comment-only line
            }
            let l = Logical {
                start: i,
                end: i,
                indent: indent_width(raw_line),
                code: code_piece,
                raw: raw_piece,
            };
            if still_open {
                cur = Some(l);
            } else if !l.code.is_empty() {
                out.push(l);
            }
            // A closed pure-string statement (docstring) is dropped.
        }
    }

    if st.triple.is_some() {
        return Err(ParseError {
            line: lines.len(),
            reason: "unterminated triple-quoted string".into(),
        });
    }
    if st.depth > 0 {
        return Err(ParseError {
            line: lines.len(),
            reason: "unbalanced open bracket at end of file".into(),
        });
    }
    Ok(out)
}

// ── Tree construction ─────────────────────────────────────────────────────────

lazy_static! {
    static ref RE_DEF: Regex = Regex::new(
        r"^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\((.*)\)\s*(?:->\s*[^:]+)?\s*:\s*(.*)$"
    )
    .expect("valid def regex");
    static ref RE_CLASS: Regex =
        Regex::new(r"^class\s+([A-Za-z_]\w*)\s*(\(.*\))?\s*:\s*(.*)$").expect("valid class regex");
    static ref RE_ASSIGN: Regex =
        Regex::new(r"^([A-Za-z_]\w*)\s*(?::[^=]+)?=[^=]").expect("valid assign regex");
    static ref RE_METHOD: Regex =
        Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").expect("valid method regex");
    static ref RE_BARE_ASSIGN: Regex =
        Regex::new(r"^([A-Za-z_]\w*)\s*(?::[^=]+)?=$").expect("valid bare assign regex");
}

struct OpenBlock {
    idx: usize,
    has_body: bool,
    last_body_line: usize,
    body_indent: Option<usize>,
}

/// Parse source into a tree of top-level nodes. O(n) in line count.
pub fn parse(source: &str) -> Result<SourceTree, ParseError> {
    let logicals = logical_lines(source)?;
    let mut nodes: Vec<TopNode> = Vec::new();
    let mut open: Option<OpenBlock> = None;
    let mut pending_decorator: Option<usize> = None;

    for l in &logicals {
        if l.indent == 0 {
            if let Some(ob) = open.take() {
                if !ob.has_body {
                    return Err(ParseError {
                        line: nodes[ob.idx].start_line,
                        reason: "expected an indented block".into(),
                    });
                }
                nodes[ob.idx].end_line = Some(ob.last_body_line + 1);
            }

            if l.code.starts_with('@') {
                if pending_decorator.is_none() {
                    pending_decorator = Some(l.start);
                }
                continue;
            }
            let start_line = pending_decorator.take().unwrap_or(l.start) + 1;

            if let Some(c) = RE_DEF.captures(&l.code) {
                let inline = !c[3].trim().is_empty();
                nodes.push(TopNode {
                    kind: TopKind::Function,
                    name: c[1].to_string(),
                    start_line,
                    header_line: l.start + 1,
                    end_line: if inline { Some(l.end + 1) } else { None },
                    methods: Vec::new(),
                });
                if !inline {
                    open = Some(OpenBlock {
                        idx: nodes.len() - 1,
                        has_body: false,
                        last_body_line: l.end,
                        body_indent: None,
                    });
                }
            } else if l.code.starts_with("def ") || l.code == "def" || l.code.starts_with("async def")
            {
                return Err(ParseError {
                    line: l.start + 1,
                    reason: "malformed function header".into(),
                });
            } else if let Some(c) = RE_CLASS.captures(&l.code) {
                let inline = !c[3].trim().is_empty();
                nodes.push(TopNode {
                    kind: TopKind::Class,
                    name: c[1].to_string(),
                    start_line,
                    header_line: l.start + 1,
                    end_line: if inline { Some(l.end + 1) } else { None },
                    methods: Vec::new(),
                });
                if !inline {
                    open = Some(OpenBlock {
                        idx: nodes.len() - 1,
                        has_body: false,
                        last_body_line: l.end,
                        body_indent: None,
                    });
                }
            } else if l.code.starts_with("class ") || l.code == "class" {
                return Err(ParseError {
                    line: l.start + 1,
                    reason: "malformed class header".into(),
                });
            } else if l.code.starts_with("import ") || l.code.starts_with("from ") {
                nodes.push(TopNode {
                    kind: TopKind::Import,
                    name: import_root(&l.code).unwrap_or_default(),
                    start_line,
                    header_line: start_line,
                    end_line: Some(l.end + 1),
                    methods: Vec::new(),
                });
            } else if RE_ASSIGN.is_match(&l.code) || RE_BARE_ASSIGN.is_match(&l.code) {
                let name = l
                    .code
                    .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .next()
                    .unwrap_or("")
                    .to_string();
                nodes.push(TopNode {
                    kind: TopKind::Assign,
                    name,
                    start_line,
                    header_line: start_line,
                    end_line: Some(l.end + 1),
                    methods: Vec::new(),
                });
            }
            // Other top-level statements (if/for/try/expressions) are untracked.
        } else if let Some(ob) = open.as_mut() {
            ob.has_body = true;
            ob.last_body_line = l.end;
            if nodes[ob.idx].kind == TopKind::Class {
                let bi = *ob.body_indent.get_or_insert(l.indent);
                if l.indent == bi {
                    if let Some(c) = RE_METHOD.captures(&l.code) {
                        nodes[ob.idx].methods.push(c[1].to_string());
                    }
                }
            }
        }
    }

    if let Some(ob) = open {
        if !ob.has_body {
            return Err(ParseError {
                line: nodes[ob.idx].start_line,
                reason: "expected an indented block".into(),
            });
        }
        // Block terminated by EOF: no explicit end boundary, leave None.
    }

    Ok(SourceTree { nodes })
}

/// True if the text is acceptable as Python source by this scanner.
pub fn is_valid_source(text: &str) -> bool {
    parse(text).is_ok()
}

/// Root module of an import statement: `import a.b as c` → `a`,
/// `from a.b import x` → `a`. Relative imports (`from . import x`) yield None.
pub fn import_root(stmt: &str) -> Option<String> {
    let mut tokens = stmt.split_whitespace();
    let module = match tokens.next()? {
        "from" => tokens.next()?,
        "import" => tokens.next()?,
        _ => return None,
    };
    let root = module.trim_start_matches('.').split('.').next()?;
    if root.is_empty() {
        None
    } else {
        Some(root.trim_end_matches(',').to_string())
    }
}

/// All import statements in the text, at any indentation depth.
pub fn import_statements(source: &str) -> Vec<String> {
    logical_lines(source)
        .map(|ls| {
            ls.into_iter()
                .filter(|l| l.code.starts_with("import ") || l.code.starts_with("from "))
                .map(|l| l.code)
                .collect()
        })
        .unwrap_or_default()
}

/// Every `def`/`class` name in the text, at any depth. Used by the
/// interface-preservation gate.
pub fn defined_names(source: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let Ok(logicals) = logical_lines(source) {
        for l in logicals {
            if let Some(c) = RE_METHOD.captures(&l.code) {
                out.insert(c[1].to_string());
            } else if let Some(c) = RE_CLASS.captures(&l.code) {
                out.insert(c[1].to_string());
            } else if let Some(rest) = l.code.strip_prefix("class ") {
                // Class header without a parsed body on this logical line.
                if let Some(name) = rest.split(|c: char| c == '(' || c == ':').next() {
                    let name = name.trim();
                    if !name.is_empty() {
                        out.insert(name.to_string());
                    }
                }
            }
        }
    }
    out
}

/// Indentation-based boundary fallback. Given the 0-based index of a
/// definition's first line, scan forward: skip blank lines, stop at the first
/// line back at (or below) the definition's indent. Returns the 0-based index
/// of the last line belonging to the block, trailing blanks excluded.
pub fn indent_fallback_end(lines: &[&str], start: usize) -> usize {
    let current_indent = indent_width(lines[start]);
    let mut end = start;
    for (i, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_width(line) <= current_indent {
            break;
        }
        end = i;
    }
    end
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
import os

def a():
    return 1

def b():
    return 2
";

    #[test]
    fn test_parse_top_level_shape() {
        let tree = parse(SAMPLE).unwrap();
        let names: Vec<&str> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["os", "a", "b"]);
    }

    #[test]
    fn test_exact_end_for_dedent_closed_block() {
        let tree = parse(SAMPLE).unwrap();
        let a = tree.definitions().find(|n| n.name == "a").unwrap();
        assert_eq!(a.start_line, 3);
        assert_eq!(a.end_line, Some(4));
    }

    #[test]
    fn test_no_end_for_eof_terminated_block() {
        let tree = parse(SAMPLE).unwrap();
        let b = tree.definitions().find(|n| n.name == "b").unwrap();
        assert_eq!(b.start_line, 6);
        assert_eq!(b.end_line, None, "EOF block has no explicit end boundary");
    }

    #[test]
    fn test_inline_body_def() {
        let tree = parse("def f(): return 1\n").unwrap();
        let f = &tree.nodes[0];
        assert_eq!(f.kind, TopKind::Function);
        assert_eq!(f.end_line, Some(1));
    }

    #[test]
    fn test_decorator_included_in_span() {
        let src = "@cached\ndef f():\n    return 1\n\nx = 2\n";
        let tree = parse(src).unwrap();
        let f = tree.definitions().next().unwrap();
        assert_eq!(f.start_line, 1);
        assert_eq!(f.header_line, 2);
        assert_eq!(f.end_line, Some(3));
    }

    #[test]
    fn test_decorated_eof_block_keeps_header_line() {
        let tree = parse("@cached\ndef f():\n    return 1\n").unwrap();
        let f = tree.definitions().next().unwrap();
        assert_eq!(f.start_line, 1);
        assert_eq!(f.header_line, 2, "fallback scans start at the header");
        assert_eq!(f.end_line, None);
    }

    #[test]
    fn test_class_methods_detected() {
        let src = "\
class Greeter:
    def __init__(self):
        self.x = 1

    def greet(self, name):
        return name
";
        let tree = parse(src).unwrap();
        let cls = tree.definitions().next().unwrap();
        assert_eq!(cls.kind, TopKind::Class);
        assert_eq!(cls.methods, vec!["__init__", "greet"]);
    }

    #[test]
    fn test_multi_line_signature() {
        let src = "def f(\n    a,\n    b,\n):\n    return a + b\n";
        let tree = parse(src).unwrap();
        let f = tree.definitions().next().unwrap();
        assert_eq!(f.name, "f");
        assert_eq!(f.start_line, 1);
    }

    #[test]
    fn test_assignment_and_import_nodes() {
        let src = "from pathlib import Path\nLIMIT = 10\n";
        let tree = parse(src).unwrap();
        assert_eq!(tree.imports().count(), 1);
        let a = tree.assignments().next().unwrap();
        assert_eq!(a.name, "LIMIT");
    }

    #[test]
    fn test_unbalanced_bracket_is_parse_error() {
        assert!(parse("x = (1,\n").is_err());
        assert!(parse("x = 1)\n").is_err());
    }

    #[test]
    fn test_unterminated_triple_string_is_parse_error() {
        assert!(parse("s = \"\"\"open\n").is_err());
    }

    #[test]
    fn test_header_without_body_is_parse_error() {
        assert!(parse("def f():\n").is_err());
        assert!(parse("def f():\nx = 1\n").is_err());
    }

    #[test]
    fn test_malformed_def_header_is_parse_error() {
        assert!(parse("def f(\n    pass\n").is_err());
    }

    #[test]
    fn test_docstrings_and_comments_invisible() {
        let src = "\"\"\"module doc\"\"\"\n# comment\nx = 1\n";
        let tree = parse(src).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.nodes[0].name, "x");
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        let tree = parse("x == 1\n").unwrap();
        assert_eq!(tree.assignments().count(), 0);
    }

    #[test]
    fn test_import_root_variants() {
        assert_eq!(import_root("import os.path"), Some("os".into()));
        assert_eq!(import_root("from a.b import c"), Some("a".into()));
        assert_eq!(import_root("import json as j"), Some("json".into()));
        assert_eq!(import_root("from . import tools"), None);
    }

    #[test]
    fn test_defined_names_any_depth() {
        let src = "class C:\n    def m(self):\n        pass\n\ndef f():\n    def inner():\n        pass\n";
        let names = defined_names(src);
        assert!(names.contains("C"));
        assert!(names.contains("m"));
        assert!(names.contains("f"));
        assert!(names.contains("inner"));
    }

    #[test]
    fn test_indent_fallback_end_excludes_trailing_blanks() {
        let src = "def f():\n    a = 1\n    return a\n\n\nx = 2\n";
        let lines: Vec<&str> = src.lines().collect();
        // Block starts at index 0; body ends at index 2 ("    return a").
        assert_eq!(indent_fallback_end(&lines, 0), 2);
    }

    #[test]
    fn test_indent_fallback_end_at_eof() {
        let src = "def f():\n    return 1\n";
        let lines: Vec<&str> = src.lines().collect();
        assert_eq!(indent_fallback_end(&lines, 0), 1);
    }

    #[test]
    fn test_strings_do_not_confuse_brackets() {
        let tree = parse("x = \"(\" + ')'\ny = 1\n").unwrap();
        assert_eq!(tree.assignments().count(), 2);
    }

    #[test]
    fn test_hash_inside_string_is_not_comment() {
        let src = "x = \"a#b\"\n";
        let tree = parse(src).unwrap();
        assert_eq!(tree.assignments().count(), 1);
    }
}
