//! Skills system - markdown skill discovery and loading.

mod loader;
mod types;

pub use loader::{check_requirements, parse_frontmatter, SkillsLoader};
pub use types::{Skill, SkillMetadata, SkillRequirements, SkillSource, SkillSummary};
