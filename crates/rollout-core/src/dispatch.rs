//! Mode dispatch

use crate::error::RunError;
use crate::runner::{RunReport, Runner};
use std::fmt;
use std::str::FromStr;

/// Invocation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Blue/green deployment of every selected stack
    Deploy,
    /// Removal of every live version of the selected stacks
    Delete,
    /// Read-only view of the live group
    Status,
    /// In-place capacity resize of the live group
    Update,
}

impl Mode {
    /// All modes
    pub const ALL: [Mode; 4] = [Mode::Deploy, Mode::Delete, Mode::Status, Mode::Update];

    /// Mode token
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Delete => "delete",
            Self::Status => "status",
            Self::Update => "update",
        }
    }

    /// Mode reads the stack manifest
    #[inline]
    #[must_use]
    pub fn requires_manifest(self) -> bool {
        matches!(self, Self::Deploy | Self::Delete)
    }

    /// Mode changes live infrastructure
    #[inline]
    #[must_use]
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Status)
    }
}

impl FromStr for Mode {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RunError::UnknownMode(s.to_string()))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Runner {
    /// Run the flow for `mode`
    ///
    /// # Errors
    /// Whatever the selected flow returns
    pub async fn run(&mut self, mode: Mode) -> Result<RunReport, RunError> {
        tracing::debug!(%mode, "dispatching");
        match mode {
            Mode::Deploy => self.deploy().await,
            Mode::Delete => self.delete().await,
            Mode::Status => self.status().await,
            Mode::Update => self.update().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_modes() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
    }

    #[test]
    fn parse_unknown_mode() {
        let err = "rollback".parse::<Mode>().unwrap_err();
        assert!(matches!(err, RunError::UnknownMode(ref m) if m == "rollback"));
        assert_eq!(err.to_string(), "no function exists to run for rollback");
    }

    #[test]
    fn mode_classification() {
        assert!(Mode::Deploy.requires_manifest());
        assert!(Mode::Delete.requires_manifest());
        assert!(!Mode::Status.requires_manifest());
        assert!(!Mode::Update.requires_manifest());
        assert!(!Mode::Status.is_mutating());
        assert!(Mode::Update.is_mutating());
    }
}
