use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::errors::{Result, StudioError};
use crate::path::{self, ToolGates, WriteRejection};

pub const DEFAULT_MAX_FILE_BYTES: usize = 1_000_000;
pub const MAX_GREP_MATCHES: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_file_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl StoreLimits {
    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrepMatch {
    pub file: String,
    pub line_number: usize,
    pub line: String,
    pub matched_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created { path: String, chars: usize },
    Updated { path: String, chars: usize },
    Rejected(WriteRejection),
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, WriteOutcome::Rejected(_))
    }
}

impl Display for WriteOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOutcome::Created { path, chars } => write!(f, "Created {path} ({chars} chars)"),
            WriteOutcome::Updated { path, chars } => write!(f, "Updated {path} ({chars} chars)"),
            WriteOutcome::Rejected(rejection) => write!(f, "{rejection}"),
        }
    }
}

enum Matcher {
    Pattern(Regex),
    Literal(String),
}

impl Matcher {
    fn new(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Matcher::Pattern(regex),
            Err(err) => {
                debug!(%err, "grep pattern is not a valid regex, using literal search");
                Matcher::Literal(pattern.to_lowercase())
            }
        }
    }

    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Pattern(regex) => regex.is_match(line),
            Matcher::Literal(needle) => line.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// In-memory project files for a single turn, keyed by absolute path.
#[derive(Debug, Clone, Default)]
pub struct VirtualFileStore {
    files: BTreeMap<String, String>,
    limits: StoreLimits,
}

impl VirtualFileStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            files: BTreeMap::new(),
            limits,
        }
    }

    pub fn from_files<I, K, V>(files: I, limits: StoreLimits) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let files = files
            .into_iter()
            .map(|(path, content)| (path::normalize(path.as_ref()), content.into()))
            .collect();
        Self { files, limits }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&path::normalize(path))
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(&path::normalize(path)).map(String::as_str)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.files.iter()
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn into_files(self) -> BTreeMap<String, String> {
        self.files
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    pub fn list_files(&self, prefix: &str) -> Vec<FileEntry> {
        let mut prefix = path::normalize(prefix);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut directories = BTreeMap::new();
        let mut files = Vec::new();
        for (stored, content) in self.files.range(prefix.clone()..) {
            let Some(remainder) = stored.strip_prefix(prefix.as_str()) else {
                break;
            };
            match remainder.split_once('/') {
                Some((directory, _)) => {
                    directories
                        .entry(directory.to_string())
                        .or_insert_with(|| format!("{prefix}{directory}"));
                }
                None => files.push(FileEntry {
                    path: stored.clone(),
                    name: remainder.to_string(),
                    entry_type: EntryType::File,
                    size: Some(content.len()),
                }),
            }
        }

        let mut entries: Vec<FileEntry> = directories
            .into_iter()
            .map(|(name, path)| FileEntry {
                path,
                name,
                entry_type: EntryType::Directory,
                size: None,
            })
            .collect();
        entries.extend(files);
        entries
    }

    /// Exact lookup first, then a case-insensitive basename match. A fallback hit is
    /// prefixed with a note naming the real path so later writes go to the right file.
    #[instrument(skip(self), fields(path = %path))]
    pub fn read_file(&self, path: &str) -> Result<String> {
        let requested = path::normalize(path);
        if let Some(content) = self.files.get(&requested) {
            return Ok(content.clone());
        }

        let wanted = basename(&requested).to_lowercase();
        let fallback = self
            .files
            .iter()
            .find(|(stored, _)| basename(stored).to_lowercase() == wanted);
        match fallback {
            Some((actual, content)) => {
                debug!(requested = %requested, actual = %actual, "read resolved by basename");
                Ok(format!(
                    "Note: {requested} does not exist, showing {actual} instead. Use the exact path {actual} for any writes.\n\n{content}"
                ))
            }
            None => Err(StudioError::not_found(requested, self.files.keys())),
        }
    }

    #[instrument(skip(self, content), fields(path = %path, bytes = content.len()))]
    pub fn write_file(&mut self, path: &str, content: &str, gates: ToolGates) -> WriteOutcome {
        let path = path::normalize(path);
        if let Err(rejection) = path::check_write(&path, gates) {
            debug!(%rejection, "write rejected by path policy");
            return WriteOutcome::Rejected(rejection);
        }
        if content.len() > self.limits.max_file_bytes {
            return WriteOutcome::Rejected(WriteRejection::TooLarge {
                path,
                size: content.len(),
                limit: self.limits.max_file_bytes,
            });
        }

        let chars = content.chars().count();
        match self.files.insert(path.clone(), content.to_string()) {
            Some(_) => WriteOutcome::Updated { path, chars },
            None => WriteOutcome::Created { path, chars },
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    pub fn delete_file(&mut self, path: &str) -> Result<String> {
        let path = path::normalize(path);
        if self.files.remove(&path).is_some() {
            Ok(format!("Deleted {path}"))
        } else {
            Err(StudioError::not_found(path, self.files.keys()))
        }
    }

    #[instrument(skip(self), fields(pattern = %pattern, path = %path))]
    pub fn grep(&self, pattern: &str, path: &str) -> Vec<GrepMatch> {
        let matcher = Matcher::new(pattern);
        let scope = path::normalize(path);

        let targets: Vec<(&String, &String)> = match self.files.get_key_value(&scope) {
            Some(single) => vec![single],
            None => {
                let mut prefix = scope;
                if !prefix.ends_with('/') {
                    prefix.push('/');
                }
                self.files
                    .iter()
                    .filter(|(stored, _)| stored.starts_with(prefix.as_str()))
                    .collect()
            }
        };

        let mut matches = Vec::new();
        for (file, content) in targets {
            for (index, line) in content.lines().enumerate() {
                if !matcher.is_match(line) {
                    continue;
                }
                matches.push(GrepMatch {
                    file: file.clone(),
                    line_number: index + 1,
                    line: line.to_string(),
                    matched_pattern: pattern.to_string(),
                });
                if matches.len() >= MAX_GREP_MATCHES {
                    return matches;
                }
            }
        }
        matches
    }

    pub fn project_structure(&self) -> String {
        if self.files.is_empty() {
            return "(empty project)".to_string();
        }
        let mut root = TreeNode::default();
        for stored in self.files.keys() {
            let segments: Vec<&str> = stored.trim_start_matches('/').split('/').collect();
            root.insert(&segments);
        }
        let mut out = String::from("/\n");
        root.render("", &mut out);
        out.trim_end().to_string()
    }

    /// Inserts or overwrites without policy checks. Used when syncing files back from a sandbox.
    pub fn merge<I>(&mut self, files: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut merged = 0;
        for (stored, content) in files {
            self.files.insert(path::normalize(&stored), content);
            merged += 1;
        }
        merged
    }

    /// Paths that are new or whose content differs from `original`.
    pub fn updated_files(&self, original: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.files
            .iter()
            .filter(|(stored, content)| original.get(*stored) != Some(*content))
            .map(|(stored, content)| (stored.clone(), content.clone()))
            .collect()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Default)]
struct TreeNode {
    directories: BTreeMap<String, TreeNode>,
    files: Vec<String>,
}

impl TreeNode {
    fn insert(&mut self, segments: &[&str]) {
        match segments {
            [] => {}
            [file] => self.files.push(file.to_string()),
            [directory, rest @ ..] => self
                .directories
                .entry(directory.to_string())
                .or_default()
                .insert(rest),
        }
    }

    fn render(&self, indent: &str, out: &mut String) {
        let total = self.directories.len() + self.files.len();
        let mut position = 0;
        for (name, child) in &self.directories {
            position += 1;
            let last = position == total;
            out.push_str(&format!("{indent}{}{name}/\n", branch(last)));
            child.render(&format!("{indent}{}", continuation(last)), out);
        }
        for name in &self.files {
            position += 1;
            out.push_str(&format!("{indent}{}{name}\n", branch(position == total)));
        }
    }
}

fn branch(last: bool) -> &'static str {
    if last {
        "└── "
    } else {
        "├── "
    }
}

fn continuation(last: bool) -> &'static str {
    if last {
        "    "
    } else {
        "│   "
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(files: &[(&str, &str)]) -> VirtualFileStore {
        VirtualFileStore::from_files(files.iter().copied(), StoreLimits::default())
    }

    #[test]
    fn list_files_puts_directories_first() {
        let store = store(&[
            ("/dapp/package.json", "{}"),
            ("/dapp/app/page.tsx", "page"),
            ("/dapp/app/layout.tsx", "layout"),
            ("/dapp/components/Button.tsx", "btn"),
            ("/dapp/README.md", "readme"),
        ]);
        let entries = store.list_files("/dapp");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["app", "components", "README.md", "package.json"]);
        assert_eq!(entries[0].entry_type, EntryType::Directory);
        assert_eq!(entries[0].path, "/dapp/app");
        assert_eq!(entries[3].size, Some(2));
    }

    #[test]
    fn list_root_shows_top_level_directories() {
        let store = store(&[("/blueprints/a.py", "x"), ("/dapp/app/page.tsx", "y")]);
        let entries = store.list_files("/");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["blueprints", "dapp"]);
    }

    #[test]
    fn read_falls_back_to_basename_with_note() {
        let store = store(&[("/dapp/app/Page.tsx", "content")]);
        let read = store.read_file("page.tsx").expect("fallback read");
        assert!(read.starts_with("Note: /page.tsx does not exist"));
        assert!(read.contains("/dapp/app/Page.tsx"));
        assert!(read.ends_with("content"));
    }

    #[test]
    fn write_rejects_oversized_content() {
        let mut store = VirtualFileStore::new(StoreLimits::default().with_max_file_bytes(4));
        let outcome = store.write_file("/dapp/a.ts", "12345", ToolGates::all());
        assert!(!outcome.is_applied());
        assert!(outcome.to_string().contains("limit is 4 bytes"));
        assert!(store.is_empty());
    }

    #[test]
    fn write_reports_created_then_updated() {
        let mut store = VirtualFileStore::default();
        let first = store.write_file("dapp/a.ts", "abc", ToolGates::all());
        assert_eq!(first.to_string(), "Created /dapp/a.ts (3 chars)");
        let second = store.write_file("/dapp/a.ts", "abcd", ToolGates::all());
        assert_eq!(second.to_string(), "Updated /dapp/a.ts (4 chars)");
    }

    #[test]
    fn grep_falls_back_to_literal_on_bad_regex() {
        let store = store(&[("/dapp/a.ts", "let x = call(\nother")]);
        let matches = store.grep("call(", "/");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line_number, 1);
    }

    #[test]
    fn grep_single_file_scope() {
        let store = store(&[("/dapp/a.ts", "needle"), ("/dapp/b.ts", "needle")]);
        let matches = store.grep("needle", "/dapp/a.ts");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].file, "/dapp/a.ts");
    }

    #[test]
    fn grep_caps_results() {
        let content = "hit\n".repeat(150);
        let store = store(&[("/dapp/a.ts", content.as_str())]);
        assert_eq!(store.grep("hit", "/dapp/").len(), MAX_GREP_MATCHES);
    }

    #[test]
    fn project_structure_renders_tree() {
        let store = store(&[
            ("/dapp/app/page.tsx", ""),
            ("/dapp/package.json", ""),
            ("/blueprints/Counter.py", ""),
        ]);
        let tree = store.project_structure();
        let expected = "/\n├── blueprints/\n│   └── Counter.py\n└── dapp/\n    ├── app/\n    │   └── page.tsx\n    └── package.json";
        assert_eq!(tree, expected);
        assert_eq!(VirtualFileStore::default().project_structure(), "(empty project)");
    }

    #[test]
    fn updated_files_reports_new_and_changed() {
        let original: BTreeMap<String, String> = [
            ("/dapp/a.ts".to_string(), "A".to_string()),
            ("/dapp/b.ts".to_string(), "B".to_string()),
        ]
        .into_iter()
        .collect();
        let mut store = VirtualFileStore::from_files(original.clone(), StoreLimits::default());
        store.write_file("/dapp/a.ts", "A2", ToolGates::all());
        store.write_file("/dapp/c.ts", "C", ToolGates::all());
        let delta = store.updated_files(&original);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["/dapp/a.ts"], "A2");
        assert_eq!(delta["/dapp/c.ts"], "C");
    }
}
