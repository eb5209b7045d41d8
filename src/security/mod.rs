//! Security policy for RelayClaw
//!
//! [`SecurityPolicy`] is the single place filesystem tools, the exec tool and
//! the delegation manager consult before acting.

pub mod path;
pub mod shell;

pub use path::{validate_path_in_workspace, SafePath};
pub use shell::ShellGuard;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::SecurityConfig;
use crate::error::{RelayError, Result};

/// Nesting allowed for delegated loops. Nested registries never carry the
/// delegation tools, so a delegated loop always runs at depth 1.
pub const MAX_DELEGATION_DEPTH: u32 = 1;

/// Centralized policy for paths, commands and delegation.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    restrict_to_workspace: bool,
    shell: ShellGuard,
    exec_timeout: Duration,
    max_delegation_depth: u32,
}

impl SecurityPolicy {
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            restrict_to_workspace: config.restrict_to_workspace,
            shell: ShellGuard::with_patterns(&config.deny_patterns)?,
            exec_timeout: Duration::from_secs(config.exec_timeout_secs.max(1)),
            max_delegation_depth: MAX_DELEGATION_DEPTH,
        })
    }

    /// No containment and no command filtering. Tests and trusted hosts only.
    pub fn permissive() -> Self {
        Self {
            restrict_to_workspace: false,
            shell: ShellGuard::permissive(),
            exec_timeout: Duration::from_secs(60),
            max_delegation_depth: MAX_DELEGATION_DEPTH,
        }
    }

    pub fn restricts_to_workspace(&self) -> bool {
        self.restrict_to_workspace
    }

    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }

    /// Resolve a tool-supplied path, enforcing workspace containment when on.
    pub fn resolve_path(&self, path: &str, workspace: &Path) -> Result<PathBuf> {
        if self.restrict_to_workspace {
            Ok(validate_path_in_workspace(path, workspace)?.into_path_buf())
        } else {
            path::resolve(path, workspace)
        }
    }

    pub fn check_command(&self, command: &str) -> Result<()> {
        self.shell.check(command)
    }

    /// Reject delegation nested deeper than the policy allows.
    pub fn check_delegation(&self, depth: u32) -> Result<()> {
        if depth > self.max_delegation_depth {
            return Err(RelayError::SecurityViolation(format!(
                "Delegation depth {} exceeds the limit of {}",
                depth, self.max_delegation_depth
            )));
        }
        Ok(())
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            shell: ShellGuard::new(),
            exec_timeout: Duration::from_secs(60),
            max_delegation_depth: MAX_DELEGATION_DEPTH,
        }
    }
}
