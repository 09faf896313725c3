//! Repository-wide symbol dependency graph: which file defines each top-level
//! name, which files read it, and the resulting file→file edges. Rebuilt
//! wholesale by a full walk — there is no incremental invalidation, so impact
//! queries are only as fresh as the last `build`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::context;
use crate::parse;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// symbol → defining file (last writer wins; see `duplicate_defines`).
    defines: HashMap<String, String>,
    /// Symbols defined in more than one file. Last-writer-wins picks the edge
    /// target, but the ambiguity is surfaced instead of silently resolved.
    duplicate_defines: BTreeMap<String, Vec<String>>,
    /// file → names it reads.
    uses: HashMap<String, HashSet<String>>,
    depends_on: HashMap<String, HashSet<String>>,
    depended_on_by: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Full repository walk: parse every source file once, then link edges.
    pub fn build(root: &Path, ignore_dirs: &[String]) -> Self {
        let mut graph = Self::default();
        for path in source_files(root, ignore_dirs) {
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let rel = rel_path(root, &path);
            graph.index_file(&rel, &text);
        }
        graph.link();
        graph
    }

    /// Build from in-memory sources. Used by tests and by callers that already
    /// hold file content.
    pub fn build_from_sources(files: &[(&str, &str)]) -> Self {
        let mut graph = Self::default();
        for (rel, text) in files {
            graph.index_file(rel, text);
        }
        graph.link();
        graph
    }

    fn index_file(&mut self, rel: &str, text: &str) {
        // Unparseable files contribute nothing; the pass skips them anyway.
        let Ok(tree) = parse::parse(text) else {
            return;
        };
        for node in tree.definitions() {
            if let Some(prev) = self.defines.insert(node.name.clone(), rel.to_string()) {
                if prev != rel {
                    let entry = self
                        .duplicate_defines
                        .entry(node.name.clone())
                        .or_insert_with(|| vec![prev]);
                    if !entry.iter().any(|f| f == rel) {
                        entry.push(rel.to_string());
                    }
                }
            }
        }
        self.uses
            .insert(rel.to_string(), context::read_names(text).into_iter().collect());
    }

    /// Edge construction: file → defining file for every used name defined
    /// elsewhere. `depends_on` and `depended_on_by` are exact inverses.
    fn link(&mut self) {
        for (file, used_names) in &self.uses {
            for name in used_names {
                if let Some(def_file) = self.defines.get(name) {
                    if def_file != file {
                        self.depends_on
                            .entry(file.clone())
                            .or_default()
                            .insert(def_file.clone());
                        self.depended_on_by
                            .entry(def_file.clone())
                            .or_default()
                            .insert(file.clone());
                    }
                }
            }
        }
    }

    /// Files that reference symbols defined in `rel` — the blast radius.
    pub fn get_dependents(&self, rel: &str) -> Vec<String> {
        sorted(self.depended_on_by.get(rel))
    }

    /// Files whose symbols `rel` references.
    pub fn get_dependencies(&self, rel: &str) -> Vec<String> {
        sorted(self.depends_on.get(rel))
    }

    /// Files that read `symbol` without defining it. Changing or removing the
    /// symbol breaks these callers.
    pub fn will_break(&self, symbol: &str) -> Vec<String> {
        let def_file = self.defines.get(symbol);
        let mut out: Vec<String> = self
            .uses
            .iter()
            .filter(|(file, names)| names.contains(symbol) && def_file != Some(file))
            .map(|(file, _)| file.clone())
            .collect();
        out.sort();
        out
    }

    pub fn defining_file(&self, symbol: &str) -> Option<&str> {
        self.defines.get(symbol).map(String::as_str)
    }

    pub fn duplicate_defines(&self) -> &BTreeMap<String, Vec<String>> {
        &self.duplicate_defines
    }

    pub(crate) fn depends_on(&self) -> &HashMap<String, HashSet<String>> {
        &self.depends_on
    }

    pub(crate) fn depended_on_by(&self) -> &HashMap<String, HashSet<String>> {
        &self.depended_on_by
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut out: Vec<String> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    out.sort();
    out
}

/// All rewritable source files under `root`, honoring gitignore plus the
/// configured ignore-dir list. Sorted for deterministic pass order.
pub fn source_files(root: &Path, ignore_dirs: &[String]) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .follow_links(false);

    let mut files = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let skip = path.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            ignore_dirs.iter().any(|d| d == name.as_ref())
        });
        if skip {
            continue;
        }
        files.push(path.to_path_buf());
    }
    files.sort();
    files
}

/// Repo-relative path with forward slashes, used as the graph's file key.
pub fn rel_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> DependencyGraph {
        DependencyGraph::build_from_sources(&[
            (
                "util.py",
                "def helper(x):\n    return x + 1\n\ndef unused():\n    return 0\n",
            ),
            (
                "app.py",
                "def main():\n    return helper(41)\n",
            ),
            (
                "report.py",
                "def report():\n    return helper(1) + main()\n",
            ),
        ])
    }

    #[test]
    fn test_edges_link_user_to_definer() {
        let g = sample_graph();
        assert_eq!(g.get_dependencies("app.py"), vec!["util.py"]);
        assert_eq!(g.get_dependents("util.py"), vec!["app.py", "report.py"]);
    }

    #[test]
    fn test_no_self_edges() {
        let g = sample_graph();
        assert!(!g.get_dependencies("util.py").contains(&"util.py".to_string()));
    }

    #[test]
    fn test_graph_symmetry() {
        // A ∈ depended_on_by[B] ⟺ B ∈ depends_on[A]
        let g = sample_graph();
        for (a, deps) in g.depends_on() {
            for b in deps {
                assert!(
                    g.depended_on_by()[b].contains(a),
                    "{a} depends on {b} but inverse edge missing"
                );
            }
        }
        for (b, users) in g.depended_on_by() {
            for a in users {
                assert!(
                    g.depends_on()[a].contains(b),
                    "{b} depended on by {a} but forward edge missing"
                );
            }
        }
    }

    #[test]
    fn test_will_break_lists_callers_not_definer() {
        let g = sample_graph();
        assert_eq!(g.will_break("helper"), vec!["app.py", "report.py"]);
        assert!(g.will_break("unused").is_empty());
    }

    #[test]
    fn test_duplicate_defines_surfaced_not_resolved() {
        let g = DependencyGraph::build_from_sources(&[
            ("a.py", "def shared():\n    return 1\n"),
            ("b.py", "def shared():\n    return 2\n"),
        ]);
        let dupes = g.duplicate_defines();
        assert_eq!(dupes["shared"], vec!["a.py", "b.py"]);
        // Last writer wins for edge construction, but both files are reported.
        assert_eq!(g.defining_file("shared"), Some("b.py"));
    }

    #[test]
    fn test_unparseable_file_is_skipped() {
        let g = DependencyGraph::build_from_sources(&[
            ("bad.py", "def broken(:\n"),
            ("ok.py", "def fine():\n    return 1\n"),
        ]);
        assert_eq!(g.defining_file("fine"), Some("ok.py"));
        assert_eq!(g.defining_file("broken"), None);
    }

    #[test]
    fn test_source_files_skips_ignored_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("venv")).unwrap();
        fs::write(root.join("main.py"), "x = 1\n").unwrap();
        fs::write(root.join("venv/lib.py"), "y = 2\n").unwrap();
        fs::write(root.join("notes.txt"), "not source\n").unwrap();

        let files = source_files(root, &["venv".to_string()]);
        let rels: Vec<String> = files.iter().map(|p| rel_path(root, p)).collect();
        assert_eq!(rels, vec!["main.py"]);
    }
}
