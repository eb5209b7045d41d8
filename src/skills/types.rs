//! Skill model and catalog entries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a skill was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    Workspace,
    Builtin,
}

impl fmt::Display for SkillSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillSource::Workspace => write!(f, "workspace"),
            SkillSource::Builtin => write!(f, "builtin"),
        }
    }
}

/// Loaded skill model.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Where the `SKILL.md` was read from.
    pub path: String,
    pub source: SkillSource,
    pub metadata: SkillMetadata,
    /// Instructions after the frontmatter.
    pub content: String,
}

/// Catalog entry rendered into the system prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
    /// Path of the `SKILL.md` the model can read for details.
    pub location: String,
    pub source: SkillSource,
    /// Whether the declared requirements are met on this host.
    pub available: bool,
}

/// YAML frontmatter of a `SKILL.md`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    pub version: Option<String>,
    pub tags: Vec<String>,
    /// Runtime requirements.
    pub requires: SkillRequirements,
}

/// What the host must provide for a skill to be usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillRequirements {
    /// Binaries that must be on `PATH`.
    pub bins: Vec<String>,
    /// Environment variables that must be set.
    pub env: Vec<String>,
}
