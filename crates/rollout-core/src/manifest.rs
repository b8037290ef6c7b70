//! Stack manifest loading
//!
//! A manifest is a YAML document naming the application, its stacks and
//! the API test templates they reference:
//!
//! ```yaml
//! name: hello
//! stacks:
//!   - stack: artd
//!     region: us-east-1
//!     capacity: { min: 1, max: 2, desired: 1 }
//! ```

use crate::error::ValidationError;
use crate::types::{ApiTestTemplate, Stack};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Declared application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Application name
    pub name: String,
    /// Declared stacks
    pub stacks: Vec<Stack>,
    /// API test templates
    #[serde(default)]
    pub api_test_templates: Vec<ApiTestTemplate>,
}

impl Manifest {
    /// Read and validate a manifest file
    ///
    /// # Errors
    /// - `ValidationError::ManifestNotFound` if `path` does not exist
    /// - `ValidationError::InvalidManifest` if parsing or validation fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ValidationError::ManifestNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ValidationError::InvalidManifest(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse and validate manifest text
    ///
    /// # Errors
    /// `ValidationError::InvalidManifest` if parsing or validation fails
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let manifest: Self = serde_yaml::from_str(text)
            .map_err(|e| ValidationError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check manifest consistency
    ///
    /// # Errors
    /// `ValidationError::InvalidManifest` naming the first problem found
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::InvalidManifest(msg));

        if self.name.trim().is_empty() {
            return invalid("application name is empty".to_string());
        }
        if self.stacks.is_empty() {
            return invalid("no stacks declared".to_string());
        }

        let templates: BTreeSet<&str> = self
            .api_test_templates
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        let mut seen = BTreeSet::new();

        for stack in &self.stacks {
            if !seen.insert(stack.stack.as_str()) {
                return invalid(format!("duplicate stack {}", stack.stack));
            }
            if !stack.capacity.is_consistent() {
                return invalid(format!(
                    "stack {} has inconsistent capacity ({})",
                    stack.stack, stack.capacity
                ));
            }
            if stack.api_test_enabled {
                match stack.api_test_template.as_deref() {
                    Some(name) if templates.contains(name) => {}
                    Some(name) => {
                        return invalid(format!(
                            "stack {} references unknown api test template {name}",
                            stack.stack
                        ))
                    }
                    None => {
                        return invalid(format!(
                            "stack {} enables api test without a template",
                            stack.stack
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Stack by name
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.stack == name)
    }
}
