use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::path::{self, ToolGates, DAPP_ROOT};
use crate::store::VirtualFileStore;

pub const PATH_CONFIDENCE: f64 = 0.95;
pub const EMPTY_PROJECT_CONFIDENCE: f64 = 0.95;
pub const CONTENT_CONFIDENCE: f64 = 0.85;
pub const MESSAGE_CONFIDENCE: f64 = 0.70;
pub const UNDETERMINED_CONFIDENCE: f64 = 0.50;
pub const FORCED_CONFIDENCE: f64 = 1.0;

const BLUEPRINT_CONTENT_MARKERS: &[&str] = &[
    "from hathor.nanocontracts",
    "import hathor",
    "@public",
    "@view",
    "__blueprint__",
    "Blueprint",
    "Context",
];

const DAPP_CONTENT_MARKERS: &[&str] = &[
    "next.config",
    "package.json",
    "tailwind.config",
    "tsconfig.json",
    "import React",
    "export default",
    "use client",
    "use server",
];

const BLUEPRINT_KEYWORDS: &[&str] = &[
    "blueprint",
    "contract",
    "nano contract",
    "@public",
    "@view",
    "compile",
    "hathor",
    "initialize",
    "method",
    "ctx",
    "context",
];

const DAPP_KEYWORDS: &[&str] = &[
    "dapp",
    "d-app",
    "frontend",
    "next.js",
    "nextjs",
    "react",
    "component",
    "page",
    "button",
    "ui",
    "interface",
    "style",
    "tailwind",
    "app router",
    "bootstrap",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Blueprint,
    Dapp,
    Mixed,
    Empty,
}

impl EnvironmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentKind::Blueprint => "blueprint",
            EnvironmentKind::Dapp => "dapp",
            EnvironmentKind::Mixed => "mixed",
            EnvironmentKind::Empty => "empty",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "blueprint" => Some(EnvironmentKind::Blueprint),
            "dapp" => Some(EnvironmentKind::Dapp),
            "mixed" => Some(EnvironmentKind::Mixed),
            "empty" => Some(EnvironmentKind::Empty),
            _ => None,
        }
    }

    fn from_counts(blueprint: usize, dapp: usize) -> Option<Self> {
        match (blueprint > 0, dapp > 0) {
            (true, true) => Some(EnvironmentKind::Mixed),
            (true, false) => Some(EnvironmentKind::Blueprint),
            (false, true) => Some(EnvironmentKind::Dapp),
            (false, false) => None,
        }
    }
}

impl Display for EnvironmentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVerdict {
    pub kind: EnvironmentKind,
    pub confidence: f64,
    pub matched_blueprint_paths: BTreeSet<String>,
    pub matched_dapp_paths: BTreeSet<String>,
    pub reason: String,
}

impl EnvironmentVerdict {
    fn new(kind: EnvironmentKind, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            kind,
            confidence,
            matched_blueprint_paths: BTreeSet::new(),
            matched_dapp_paths: BTreeSet::new(),
            reason: reason.into(),
        }
    }

    pub fn forced(kind: EnvironmentKind) -> Self {
        Self::new(kind, FORCED_CONFIDENCE, "forced by request")
    }

    pub fn blueprint_tools_enabled(&self) -> bool {
        blueprint_tools_enabled(self.kind)
    }

    pub fn dapp_tools_enabled(&self) -> bool {
        dapp_tools_enabled(self.kind)
    }

    pub fn gates(&self) -> ToolGates {
        ToolGates::from(self)
    }
}

impl From<&EnvironmentVerdict> for ToolGates {
    fn from(verdict: &EnvironmentVerdict) -> Self {
        ToolGates::new(
            verdict.blueprint_tools_enabled(),
            verdict.dapp_tools_enabled(),
        )
    }
}

/// EMPTY enables both families so a fresh project can be bootstrapped either way.
pub fn blueprint_tools_enabled(kind: EnvironmentKind) -> bool {
    matches!(
        kind,
        EnvironmentKind::Blueprint | EnvironmentKind::Mixed | EnvironmentKind::Empty
    )
}

pub fn dapp_tools_enabled(kind: EnvironmentKind) -> bool {
    matches!(
        kind,
        EnvironmentKind::Dapp | EnvironmentKind::Mixed | EnvironmentKind::Empty
    )
}

type Tier = fn(&VirtualFileStore, Option<&str>) -> Option<EnvironmentVerdict>;

const TIERS: [(&str, Tier); 3] = [
    ("paths", by_paths),
    ("content", by_content),
    ("message", by_message),
];

pub fn classify(files: &VirtualFileStore, message: Option<&str>) -> EnvironmentVerdict {
    // Checked before any tier: a keyword-heavy message must not override an empty project.
    if files.is_empty() {
        return EnvironmentVerdict::new(
            EnvironmentKind::Empty,
            EMPTY_PROJECT_CONFIDENCE,
            "Empty project - no files yet",
        );
    }

    for (tier, evaluate) in TIERS {
        if let Some(verdict) = evaluate(files, message) {
            debug!(tier, kind = %verdict.kind, confidence = verdict.confidence, "environment classified");
            return verdict;
        }
    }

    EnvironmentVerdict::new(
        EnvironmentKind::Empty,
        UNDETERMINED_CONFIDENCE,
        "Could not determine environment",
    )
}

fn by_paths(files: &VirtualFileStore, _message: Option<&str>) -> Option<EnvironmentVerdict> {
    let blueprint: BTreeSet<String> = files
        .paths()
        .filter(|stored| path::is_blueprint_source(stored))
        .cloned()
        .collect();
    let dapp: BTreeSet<String> = files
        .paths()
        .filter(|stored| stored.starts_with(DAPP_ROOT))
        .cloned()
        .collect();

    let kind = EnvironmentKind::from_counts(blueprint.len(), dapp.len())?;
    let reason = match kind {
        EnvironmentKind::Mixed => format!(
            "Found {} blueprint file(s) and {} dApp file(s)",
            blueprint.len(),
            dapp.len()
        ),
        EnvironmentKind::Blueprint => format!("Found {} blueprint file(s)", blueprint.len()),
        _ => format!("Found {} dApp file(s)", dapp.len()),
    };
    Some(EnvironmentVerdict {
        kind,
        confidence: PATH_CONFIDENCE,
        matched_blueprint_paths: blueprint,
        matched_dapp_paths: dapp,
        reason,
    })
}

fn by_content(files: &VirtualFileStore, _message: Option<&str>) -> Option<EnvironmentVerdict> {
    let mut blueprint = BTreeSet::new();
    let mut dapp = BTreeSet::new();
    for (stored, content) in files.iter() {
        if contains_any(content, BLUEPRINT_CONTENT_MARKERS) {
            blueprint.insert(stored.clone());
        }
        if contains_any(content, DAPP_CONTENT_MARKERS) {
            dapp.insert(stored.clone());
        }
    }

    let kind = EnvironmentKind::from_counts(blueprint.len(), dapp.len())?;
    let reason = match kind {
        EnvironmentKind::Mixed => "Content contains both blueprint and dApp patterns",
        EnvironmentKind::Blueprint => "Content contains Hathor blueprint patterns",
        _ => "Content contains Next.js/React patterns",
    };
    Some(EnvironmentVerdict {
        kind,
        confidence: CONTENT_CONFIDENCE,
        matched_blueprint_paths: blueprint,
        matched_dapp_paths: dapp,
        reason: reason.to_string(),
    })
}

fn by_message(_files: &VirtualFileStore, message: Option<&str>) -> Option<EnvironmentVerdict> {
    let message = message.map(str::trim).filter(|text| !text.is_empty())?;
    let lowered = message.to_lowercase();
    let blueprint = count_hits(&lowered, BLUEPRINT_KEYWORDS);
    let dapp = count_hits(&lowered, DAPP_KEYWORDS);

    // Any overlap is MIXED regardless of magnitude.
    let kind = EnvironmentKind::from_counts(blueprint, dapp)?;
    let reason = match kind {
        EnvironmentKind::Mixed => "Message mentions both blueprint and dApp work",
        EnvironmentKind::Blueprint => "Message is about blueprint development",
        _ => "Message is about dApp development",
    };
    Some(EnvironmentVerdict::new(
        kind,
        MESSAGE_CONFIDENCE,
        reason,
    ))
}

fn contains_any(content: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| content.contains(marker))
}

fn count_hits(lowered: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .filter(|keyword| lowered.contains(*keyword))
        .count()
}
