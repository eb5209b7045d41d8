//! Skills loader and parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::{expand_home, Config};

use super::types::{Skill, SkillMetadata, SkillSource, SkillSummary};

static FRONTMATTER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)^---\r?\n(.*?)\r?\n---\r?\n?").ok());

/// Discover and load markdown skills from workspace and builtin directories.
///
/// A skill is a directory holding a `SKILL.md`, optionally starting with a
/// YAML frontmatter block (`name`, `description`, `requires`, ...). A
/// workspace skill overrides a builtin skill of the same name.
#[derive(Debug, Clone)]
pub struct SkillsLoader {
    workspace_dir: PathBuf,
    builtin_dir: Option<PathBuf>,
}

impl SkillsLoader {
    /// Create loader with explicit directories.
    pub fn new(workspace_dir: PathBuf, builtin_dir: Option<PathBuf>) -> Self {
        Self {
            workspace_dir,
            builtin_dir,
        }
    }

    /// Loader for the directories named in `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.skills_dir(),
            config.skills.builtin_dir.as_deref().map(expand_home),
        )
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn builtin_dir(&self) -> Option<&Path> {
        self.builtin_dir.as_deref()
    }

    /// Load every discoverable skill, sorted by name.
    pub fn list_skills(&self) -> Vec<Skill> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        collect_skills(&self.workspace_dir, SkillSource::Workspace, &mut out, &mut seen);
        if let Some(ref builtin) = self.builtin_dir {
            collect_skills(builtin, SkillSource::Builtin, &mut out, &mut seen);
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Load one skill by directory name.
    pub fn load_skill(&self, name: &str) -> Option<Skill> {
        let workspace = self.workspace_dir.join(name).join("SKILL.md");
        if workspace.is_file() {
            return parse_skill_file(&workspace, name, SkillSource::Workspace);
        }

        let builtin = self.builtin_dir.as_ref()?.join(name).join("SKILL.md");
        if builtin.is_file() {
            return parse_skill_file(&builtin, name, SkillSource::Builtin);
        }

        None
    }

    /// Catalog consumed by the context builder.
    pub fn catalog(&self) -> Vec<SkillSummary> {
        self.list_skills()
            .into_iter()
            .map(|skill| SkillSummary {
                available: check_requirements(&skill),
                name: skill.name,
                description: skill.description,
                location: skill.path,
                source: skill.source,
            })
            .collect()
    }
}

/// Check that required binaries and environment variables are present.
pub fn check_requirements(skill: &Skill) -> bool {
    let requires = &skill.metadata.requires;
    requires.bins.iter().all(|bin| binary_in_path(bin))
        && requires.env.iter().all(|name| std::env::var(name).is_ok())
}

fn collect_skills(
    dir: &Path,
    source: SkillSource,
    output: &mut Vec<Skill>,
    seen: &mut HashSet<String>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let dir_name = entry.file_name().to_string_lossy().to_string();
        let skill_file = path.join("SKILL.md");
        if !skill_file.is_file() {
            continue;
        }

        let Some(skill) = parse_skill_file(&skill_file, &dir_name, source) else {
            continue;
        };
        if seen.insert(skill.name.clone()) {
            output.push(skill);
        }
    }
}

fn parse_skill_file(path: &Path, fallback_name: &str, source: SkillSource) -> Option<Skill> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read skill file");
            return None;
        }
    };
    let (metadata, body) = parse_frontmatter(&raw);

    let name = if metadata.name.trim().is_empty() {
        fallback_name.to_string()
    } else {
        metadata.name.trim().to_string()
    };
    let description = if metadata.description.trim().is_empty() {
        format!("Skill '{}'", name)
    } else {
        metadata.description.trim().to_string()
    };

    Some(Skill {
        name,
        description,
        path: path.to_string_lossy().to_string(),
        source,
        metadata,
        content: body,
    })
}

/// Split a `SKILL.md` into frontmatter metadata and markdown body.
pub fn parse_frontmatter(content: &str) -> (SkillMetadata, String) {
    if let Some(captures) = FRONTMATTER.as_ref().and_then(|re| re.captures(content)) {
        if let (Some(frontmatter), Some(full)) = (captures.get(1), captures.get(0)) {
            let metadata = match serde_yaml::from_str::<SkillMetadata>(frontmatter.as_str()) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(error = %e, "Failed to parse skill frontmatter");
                    SkillMetadata::default()
                }
            };
            let body = content[full.end()..].trim().to_string();
            return (metadata, body);
        }
    }

    (SkillMetadata::default(), content.to_string())
}

fn binary_in_path(bin: &str) -> bool {
    if bin.trim().is_empty() {
        return false;
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(bin).is_file())
}
