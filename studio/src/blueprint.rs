use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, instrument, warn};
use tree_sitter::{Node, Parser};

use crate::errors::{Result, StudioError};
use crate::path;
use crate::store::VirtualFileStore;

const CONTAINER_PATTERNS: [&str; 3] = [
    r"^\s*self\.\w+\s*=\s*\{\}",
    r"^\s*self\.\w+\s*=\s*\[\]",
    r"^\s*self\.\w+\s*=\s*set\(\)",
];

/// Number of lines after a decorator searched for the decorated `def`.
const DECORATOR_LOOKAHEAD: usize = 4;

fn container_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CONTAINER_PATTERNS
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(%err, pattern, "invalid container pattern");
                    None
                }
            })
            .collect()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReport {
    InvalidLocation { path: String },
    Missing { path: String, available: Vec<String> },
    SyntaxError { path: String, line: usize, message: String },
    Passed { path: String },
    Issues { path: String, issues: Vec<Issue> },
}

impl ValidationReport {
    pub fn is_passed(&self) -> bool {
        matches!(self, ValidationReport::Passed { .. })
    }

    pub fn issues(&self) -> &[Issue] {
        match self {
            ValidationReport::Issues { issues, .. } => issues,
            _ => &[],
        }
    }

    pub fn has_critical(&self) -> bool {
        self.issues()
            .iter()
            .any(|issue| issue.severity == Severity::Critical)
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationReport::InvalidLocation { path } => write!(
                f,
                "Blueprint files must be in /blueprints/ or /contracts/ directory.\nGot: {path}\nExpected: /blueprints/*.py or /contracts/*.py"
            ),
            ValidationReport::Missing { path, available } => {
                let available = if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                };
                write!(f, "File not found: {path}\nAvailable blueprints: {available}")
            }
            ValidationReport::SyntaxError { path, line, message } => {
                write!(f, "Syntax error in {path} on line {line}: {message}")
            }
            ValidationReport::Passed { path } => {
                write!(f, "{path} passed validation. Ready for compilation.")
            }
            ValidationReport::Issues { path, issues } => {
                writeln!(f, "Validation results for {path}:")?;
                writeln!(f)?;
                for issue in issues {
                    writeln!(f, "  [{}] {}", issue.severity.label(), issue.message)?;
                }
                write!(f, "\nFix these issues before compiling.")
            }
        }
    }
}

#[instrument(skip(store), fields(path = %path))]
pub fn validate(store: &VirtualFileStore, path: &str) -> ValidationReport {
    let path = path::normalize(path);
    if !path::is_blueprint_location(&path) {
        return ValidationReport::InvalidLocation { path };
    }
    let Some(code) = store.get(&path) else {
        let available = store
            .paths()
            .filter(|stored| path::is_blueprint_location(stored))
            .cloned()
            .collect();
        return ValidationReport::Missing { path, available };
    };

    if let Some((line, message)) = syntax_error(code) {
        return ValidationReport::SyntaxError {
            path,
            line,
            message,
        };
    }

    let issues = static_checks(code);
    info!(issues = issues.len(), "blueprint validated");
    if issues.is_empty() {
        ValidationReport::Passed { path }
    } else {
        ValidationReport::Issues { path, issues }
    }
}

fn static_checks(code: &str) -> Vec<Issue> {
    let mut issues = Vec::new();

    if !code.contains("from hathor") && !code.contains("import hathor") {
        issues.push(Issue::new(
            Severity::Warning,
            "Missing Hathor imports (from hathor.nanocontracts ...)",
        ));
    }
    if !code.contains("class ") {
        issues.push(Issue::new(
            Severity::Error,
            "No class definition found (blueprints must be classes)",
        ));
    } else if !code.contains("Blueprint") {
        issues.push(Issue::new(
            Severity::Warning,
            "Class should inherit from Blueprint",
        ));
    }
    if !code.contains("__blueprint__") {
        issues.push(Issue::new(
            Severity::Error,
            "Missing __blueprint__ export (required)",
        ));
    }
    if !code.contains("@public") && !code.contains("@view") {
        issues.push(Issue::new(
            Severity::Warning,
            "No @public or @view methods found",
        ));
    }
    if !code.contains("def initialize") {
        issues.push(Issue::new(
            Severity::Warning,
            "No initialize() method found",
        ));
    }
    if code.contains("def __init__") {
        issues.push(Issue::new(
            Severity::Critical,
            "Do not define __init__, use initialize() instead",
        ));
    }

    for pattern in container_patterns() {
        let hit = code
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .find(|line| pattern.is_match(line));
        if let Some(line) = hit {
            issues.push(Issue::new(
                Severity::Critical,
                format!(
                    "Container field assignment detected: {}\n     Container fields (dict, list, set) are auto-initialized.\n     Never write: self.balances = {{}}\n     Just use: self.balances[key] = value",
                    line.trim()
                ),
            ));
        }
    }

    if code.contains("@public") && code.contains("ctx.address") {
        issues.push(Issue::new(
            Severity::Error,
            "Do not use ctx.address, use ctx.vertex.hash for caller identity",
        ));
    }
    issues
}

/// Returns the 1-based line and a description of the first syntax error, if any.
pub fn syntax_error(code: &str) -> Option<(usize, String)> {
    let mut parser = Parser::new();
    if let Err(err) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
        warn!(%err, "python grammar unavailable, skipping syntax check");
        return None;
    }
    let Some(tree) = parser.parse(code, None) else {
        warn!("python parser returned no tree, skipping syntax check");
        return None;
    };
    let root = tree.root_node();
    if !root.has_error() {
        return python3_violation(root, false);
    }
    let node = first_error(root).unwrap_or(root);
    let message = if node.is_missing() {
        format!("missing {}", node.kind())
    } else {
        "invalid syntax".to_string()
    };
    Some((node.start_position().row + 1, message))
}

/// The grammar accepts Python 2 statements and recovers from bad indentation,
/// so constructs the interpreter rejects are caught on the clean tree.
fn python3_violation(node: Node<'_>, in_function: bool) -> Option<(usize, String)> {
    let line = node.start_position().row + 1;
    let rejected = match node.kind() {
        "print_statement" => Some("Missing parentheses in call to 'print'"),
        "exec_statement" => Some("Missing parentheses in call to 'exec'"),
        "return_statement" if !in_function => Some("'return' outside function"),
        "yield" if !in_function => Some("'yield' outside function"),
        _ => None,
    };
    if let Some(message) = rejected {
        return Some((line, message.to_string()));
    }

    let in_function = match node.kind() {
        "function_definition" => true,
        "class_definition" => false,
        _ => in_function,
    };
    let holds_statements = matches!(node.kind(), "module" | "block");
    let mut indent = (node.kind() == "module").then_some(0);
    let mut previous: Option<Node<'_>> = None;
    for child in named_children(node) {
        if holds_statements {
            if let Some(message) = indentation_error(child, previous, &mut indent) {
                return Some((child.start_position().row + 1, message.to_string()));
            }
            previous = Some(child);
        }
        if let Some(found) = python3_violation(child, in_function) {
            return Some(found);
        }
    }
    None
}

fn indentation_error(
    statement: Node<'_>,
    previous: Option<Node<'_>>,
    indent: &mut Option<usize>,
) -> Option<&'static str> {
    let start = statement.start_position();
    // `a = 1; b = 2` shares a line.
    if previous.is_some_and(|previous| previous.end_position().row >= start.row) {
        return None;
    }
    let expected = *indent.get_or_insert(start.column);
    match start.column.cmp(&expected) {
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Greater if previous.is_some_and(ends_with_block) => {
            Some("unindent does not match any outer indentation level")
        }
        std::cmp::Ordering::Greater => Some("unexpected indent"),
        std::cmp::Ordering::Less => Some("unindent does not match any outer indentation level"),
    }
}

fn ends_with_block(node: Node<'_>) -> bool {
    let mut current = node;
    while let Some(last) = named_children(current).pop() {
        if last.kind() == "block" {
            return true;
        }
        current = last;
    }
    false
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect()
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}

/// Any flagged issue blocks compilation, warnings included.
pub fn compile(store: &VirtualFileStore, path: &str) -> String {
    let report = validate(store, path);
    if report.is_passed() {
        format!(
            "Blueprint ready for compilation: {}\n\nValidation passed. To compile:\n1. Save your changes\n2. Click the 'Compile' button in the IDE\n3. View compilation results in the console\n\nCompilation runs in the browser, outside this service.",
            path::normalize(path)
        )
    } else {
        format!(
            "Cannot compile due to validation errors:\n\n{report}\n\nFix these issues first, then try compiling again."
        )
    }
}

pub fn looks_like_test(code: &str) -> bool {
    code.contains("def test_") || code.contains("class Test")
}

#[instrument(skip(store), fields(path = %path))]
pub fn test_readiness(store: &VirtualFileStore, path: &str) -> Result<String> {
    let path = path::normalize(path);
    let Some(code) = store.get(&path) else {
        return Err(StudioError::not_found(path, store.paths()));
    };
    if !looks_like_test(code) {
        return Ok(format!(
            "{path} doesn't look like a pytest test file.\nTest functions should start with 'test_' or be in a class starting with 'Test'"
        ));
    }
    Ok(format!(
        "Test file ready: {path}\n\nTo run tests:\n1. Make sure your blueprint is compiled\n2. Click 'Run Tests' in the IDE\n3. View test results in the console\n\nTests run in the browser, outside this service."
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlueprintMethods {
    pub public: Vec<String>,
    pub view: Vec<String>,
}

impl BlueprintMethods {
    pub fn is_empty(&self) -> bool {
        self.public.is_empty() && self.view.is_empty()
    }
}

pub fn scan_methods(code: &str) -> BlueprintMethods {
    let lines: Vec<&str> = code.lines().collect();
    let mut methods = BlueprintMethods::default();
    for (index, line) in lines.iter().enumerate() {
        let bucket = if line.contains("@public") {
            &mut methods.public
        } else if line.contains("@view") {
            &mut methods.view
        } else {
            continue;
        };
        let window_end = (index + 1 + DECORATOR_LOOKAHEAD).min(lines.len());
        let definition = lines[index + 1..window_end]
            .iter()
            .map(|candidate| candidate.trim())
            .find(|candidate| candidate.starts_with("def "));
        if let Some(definition) = definition {
            bucket.push(definition.to_string());
        }
    }
    methods
}

pub fn list_methods(store: &VirtualFileStore, path: &str) -> Result<String> {
    let path = path::normalize(path);
    let Some(code) = store.get(&path) else {
        return Err(StudioError::not_found(path, store.paths()));
    };
    let methods = scan_methods(code);
    if methods.is_empty() {
        return Ok(format!("No @public or @view methods found in {path}"));
    }

    let mut out = format!("Methods in {path}:\n\n");
    if !methods.public.is_empty() {
        out.push_str("@public methods (state-changing):\n");
        for method in &methods.public {
            out.push_str(&format!("  {method}\n"));
        }
        out.push('\n');
    }
    if !methods.view.is_empty() {
        out.push_str("@view methods (read-only):\n");
        for method in &methods.view {
            out.push_str(&format!("  {method}\n"));
        }
    }
    Ok(out.trim_end().to_string())
}
