use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::errors::{Result, StudioError};

pub const BLUEPRINTS_ROOT: &str = "/blueprints/";
pub const CONTRACTS_ROOT: &str = "/contracts/";
pub const TESTS_ROOT: &str = "/tests/";
pub const DAPP_ROOT: &str = "/dapp/";
pub const BLUEPRINT_SOURCE_SUFFIX: &str = ".py";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Blueprint,
    Dapp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRoot {
    Blueprints,
    Contracts,
    Tests,
    Dapp,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct DirectoryRule {
    pub kind: ProjectKind,
    pub prefixes: &'static [&'static str],
}

pub const DIRECTORY_RULES: [DirectoryRule; 2] = [
    DirectoryRule {
        kind: ProjectKind::Blueprint,
        prefixes: &[BLUEPRINTS_ROOT, CONTRACTS_ROOT, TESTS_ROOT],
    },
    DirectoryRule {
        kind: ProjectKind::Dapp,
        prefixes: &[DAPP_ROOT],
    },
];

pub fn rule_for(kind: ProjectKind) -> &'static DirectoryRule {
    match kind {
        ProjectKind::Blueprint => &DIRECTORY_RULES[0],
        ProjectKind::Dapp => &DIRECTORY_RULES[1],
    }
}

/// Which tool families are live for the current turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ToolGates {
    pub blueprint: bool,
    pub dapp: bool,
}

impl ToolGates {
    pub fn new(blueprint: bool, dapp: bool) -> Self {
        Self { blueprint, dapp }
    }

    pub fn all() -> Self {
        Self::new(true, true)
    }

    pub fn allows(self, kind: ProjectKind) -> bool {
        match kind {
            ProjectKind::Blueprint => self.blueprint,
            ProjectKind::Dapp => self.dapp,
        }
    }

    pub fn writable_prefixes(self) -> Vec<&'static str> {
        DIRECTORY_RULES
            .iter()
            .filter(|rule| self.allows(rule.kind))
            .flat_map(|rule| rule.prefixes.iter().copied())
            .collect()
    }
}

pub fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub fn classify_root(path: &str) -> ProjectRoot {
    if path.starts_with(BLUEPRINTS_ROOT) {
        ProjectRoot::Blueprints
    } else if path.starts_with(CONTRACTS_ROOT) {
        ProjectRoot::Contracts
    } else if path.starts_with(TESTS_ROOT) {
        ProjectRoot::Tests
    } else if path.starts_with(DAPP_ROOT) {
        ProjectRoot::Dapp
    } else {
        ProjectRoot::Other
    }
}

pub fn kind_of(root: ProjectRoot) -> Option<ProjectKind> {
    match root {
        ProjectRoot::Blueprints | ProjectRoot::Contracts | ProjectRoot::Tests => {
            Some(ProjectKind::Blueprint)
        }
        ProjectRoot::Dapp => Some(ProjectKind::Dapp),
        ProjectRoot::Other => None,
    }
}

/// Blueprint sources live under `/blueprints/` or `/contracts/`; `/tests/` is writable but not a source root.
pub fn is_blueprint_location(path: &str) -> bool {
    matches!(
        classify_root(path),
        ProjectRoot::Blueprints | ProjectRoot::Contracts
    )
}

pub fn is_blueprint_source(path: &str) -> bool {
    is_blueprint_location(path) && path.ends_with(BLUEPRINT_SOURCE_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRejection {
    Traversal {
        path: String,
    },
    FamilyDisabled {
        path: String,
        kind: ProjectKind,
        allowed: Vec<&'static str>,
    },
    OutsideRoots {
        path: String,
        allowed: Vec<&'static str>,
    },
    TooLarge {
        path: String,
        size: usize,
        limit: usize,
    },
}

impl Display for WriteRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteRejection::Traversal { path } => write!(
                f,
                "Invalid path: {path}\nPaths must not contain '..' segments"
            ),
            WriteRejection::FamilyDisabled {
                path,
                kind,
                allowed,
            } => {
                let family = match kind {
                    ProjectKind::Blueprint => "Blueprint",
                    ProjectKind::Dapp => "dApp",
                };
                write!(
                    f,
                    "{family} tools are not enabled for this project, cannot write {path}\nWritable directories: {}",
                    describe_prefixes(allowed)
                )
            }
            WriteRejection::OutsideRoots { path, allowed } => write!(
                f,
                "Invalid path: {path}\nFiles must be in {} directories",
                describe_prefixes(allowed)
            ),
            WriteRejection::TooLarge { path, size, limit } => write!(
                f,
                "Cannot write {path}: content is {size} bytes, limit is {limit} bytes"
            ),
        }
    }
}

fn describe_prefixes(prefixes: &[&'static str]) -> String {
    match prefixes {
        [] => "no".to_string(),
        [single] => single.to_string(),
        [head @ .., last] => format!("{}, or {last}", head.join(", ")),
    }
}

/// Expects an already normalized path.
pub fn check_write(path: &str, gates: ToolGates) -> std::result::Result<(), WriteRejection> {
    if path.split('/').any(|segment| segment == "..") {
        return Err(WriteRejection::Traversal {
            path: path.to_string(),
        });
    }
    match kind_of(classify_root(path)) {
        Some(kind) if gates.allows(kind) => Ok(()),
        Some(kind) => Err(WriteRejection::FamilyDisabled {
            path: path.to_string(),
            kind,
            allowed: gates.writable_prefixes(),
        }),
        None => Err(WriteRejection::OutsideRoots {
            path: path.to_string(),
            allowed: gates.writable_prefixes(),
        }),
    }
}

pub fn is_write_allowed(path: &str, gates: ToolGates) -> bool {
    check_write(path, gates).is_ok()
}

pub fn ensure_absolute_base(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.is_relative() {
        return Err(StudioError::InvalidOperation(
            "sandbox base directory must be absolute".to_string(),
        ));
    }
    Ok(base_dir.to_path_buf())
}

pub fn resolve(base_dir: &Path, relative: impl AsRef<Path>) -> Result<PathBuf> {
    let relative = relative.as_ref();
    if relative.components().count() == 0 {
        return Err(StudioError::InvalidOperation(
            "path must not be empty".to_string(),
        ));
    }
    if relative.is_absolute() {
        return Err(StudioError::OutsideRoot);
    }

    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => return Err(StudioError::PathTraversal),
            Component::RootDir | Component::Prefix(_) => return Err(StudioError::OutsideRoot),
        }
    }

    let resolved = base_dir.join(clean);
    if !resolved.starts_with(base_dir) {
        return Err(StudioError::OutsideRoot);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prepends_slash_and_is_idempotent() {
        for raw in ["dapp/app/page.tsx", "blueprints/Counter.py", "x", "/already/abs"] {
            let once = normalize(raw);
            assert!(once.starts_with('/'));
            assert_eq!(normalize(&once), once);
        }
        assert_eq!(normalize("dapp/a.ts"), "/dapp/a.ts");
        assert_eq!(normalize("/dapp/a.ts"), "/dapp/a.ts");
    }

    #[test]
    fn classify_root_matches_prefixes() {
        assert_eq!(classify_root("/blueprints/a.py"), ProjectRoot::Blueprints);
        assert_eq!(classify_root("/contracts/a.py"), ProjectRoot::Contracts);
        assert_eq!(classify_root("/tests/test_a.py"), ProjectRoot::Tests);
        assert_eq!(classify_root("/dapp/app/page.tsx"), ProjectRoot::Dapp);
        assert_eq!(classify_root("/dappx/page.tsx"), ProjectRoot::Other);
        assert_eq!(classify_root("/blueprints"), ProjectRoot::Other);
    }

    #[test]
    fn write_gating_follows_enabled_families() {
        let blueprint_only = ToolGates::new(true, false);
        assert!(is_write_allowed("/blueprints/a.py", blueprint_only));
        assert!(is_write_allowed("/tests/test_a.py", blueprint_only));
        assert!(!is_write_allowed("/dapp/app/page.tsx", blueprint_only));

        let dapp_only = ToolGates::new(false, true);
        assert!(is_write_allowed("/dapp/app/page.tsx", dapp_only));
        assert!(!is_write_allowed("/contracts/a.py", dapp_only));
    }

    #[test]
    fn outside_roots_rejection_names_prefixes() {
        let rejection = check_write("/etc/passwd", ToolGates::all()).unwrap_err();
        let message = rejection.to_string();
        assert!(message.contains("/etc/passwd"));
        for prefix in ["/blueprints/", "/contracts/", "/tests/", "/dapp/"] {
            assert!(message.contains(prefix), "missing {prefix} in {message}");
        }
    }

    #[test]
    fn disabled_family_rejection_lists_remaining_prefixes() {
        let rejection = check_write("/dapp/a.ts", ToolGates::new(true, false)).unwrap_err();
        assert!(matches!(rejection, WriteRejection::FamilyDisabled { .. }));
        let message = rejection.to_string();
        assert!(message.starts_with("dApp tools are not enabled"));
        assert!(message.contains("/blueprints/, /contracts/, or /tests/"));
    }

    #[test]
    fn parent_segments_are_rejected() {
        let rejection = check_write("/dapp/../etc/passwd", ToolGates::all()).unwrap_err();
        assert!(matches!(rejection, WriteRejection::Traversal { .. }));
    }

    #[test]
    fn resolve_rejects_parent_traversal() {
        let base = Path::new("/srv/sandbox");
        assert!(matches!(
            resolve(base, "../secret"),
            Err(StudioError::PathTraversal)
        ));
        assert!(matches!(resolve(base, "/abs"), Err(StudioError::OutsideRoot)));
        let resolved = resolve(base, "app/./page.tsx").expect("valid path");
        assert_eq!(resolved, PathBuf::from("/srv/sandbox/app/page.tsx"));
    }
}
