//! External collaborators consumed by the engine
//!
//! The engine only needs these contracts:
//! - [`MetricsCollector`] validates metrics storage and receives per-stack metrics
//! - [`Notifier`] delivers chat notifications; failures are never fatal
//! - [`Inspector`] reads and resizes live groups for status and update
//! - [`Prompt`] asks the operator to confirm mutating runs

use crate::error::CollaboratorError;
use crate::types::{Capacity, GroupDescriptor, RunConfig, Stack};
use serde::Serialize;

/// Metrics forwarded by a deployer after acting on a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentMetrics {
    /// Application name
    pub application: String,
    /// Stack name
    pub stack: String,
    /// Region
    pub region: String,
    /// Group deployed by this run, if any
    pub deployed_group: Option<String>,
    /// Previous groups acted on
    pub previous_groups: Vec<String>,
    /// Capacity of the deployed group
    pub capacity: Option<Capacity>,
    /// Healthy instances of the deployed group
    pub healthy_count: Option<i64>,
}

/// Metrics storage backend
#[async_trait::async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Validate the backend is reachable
    async fn check_storage(&self) -> Result<(), CollaboratorError>;

    /// Store metrics for one stack
    async fn record(&self, metrics: &DeploymentMetrics) -> Result<(), CollaboratorError>;
}

/// Notification channel
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Channel is configured and can deliver
    fn is_valid(&self) -> bool;

    /// Send a one-line message
    async fn send_simple_message(&self, text: &str) -> Result<(), CollaboratorError>;

    /// Send the pre-deployment summary for `stacks`
    async fn send_summary_message(
        &self,
        config: &RunConfig,
        stacks: &[Stack],
        name: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Opaque handle to a live group chosen by [`Inspector::select_stack`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub String);

/// Resize request applied by [`Inspector::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFields {
    /// Group to resize
    pub group_name: String,
    /// New bounds
    pub capacity: Capacity,
}

/// Read and resize path over live groups
#[async_trait::async_trait]
pub trait Inspector: Send + Sync {
    /// Choose the live group serving `application`
    async fn select_stack(&self, application: &str) -> Result<GroupHandle, CollaboratorError>;

    /// Describe the chosen group
    async fn get_stack_information(
        &self,
        handle: &GroupHandle,
    ) -> Result<GroupDescriptor, CollaboratorError>;

    /// Apply a resize to a live group
    async fn update(&self, fields: &UpdateFields) -> Result<(), CollaboratorError>;

    /// Build a stack descriptor mirroring a live group
    fn generate_stack(&self, region: &str, group: &GroupDescriptor) -> Stack;
}

/// Operator confirmation
pub trait Prompt: Send + Sync {
    /// An operator is present to answer
    fn is_interactive(&self) -> bool;

    /// Ask `message`; `true` means proceed
    fn confirm(&self, message: &str) -> bool;
}

/// Notifier that writes messages to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier {
    enabled: bool,
}

impl LogNotifier {
    /// Create notifier; a disabled one reports itself invalid
    #[inline]
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn is_valid(&self) -> bool {
        self.enabled
    }

    async fn send_simple_message(&self, text: &str) -> Result<(), CollaboratorError> {
        tracing::info!(target: "rollout::notify", "{}", text);
        Ok(())
    }

    async fn send_summary_message(
        &self,
        config: &RunConfig,
        stacks: &[Stack],
        name: &str,
    ) -> Result<(), CollaboratorError> {
        let names: Vec<&str> = stacks.iter().map(|s| s.stack.as_str()).collect();
        tracing::info!(
            target: "rollout::notify",
            application = name,
            region = %config.region,
            stacks = ?names,
            "deployment started"
        );
        Ok(())
    }
}

/// Metrics collector that writes metrics to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCollector;

#[async_trait::async_trait]
impl MetricsCollector for LogCollector {
    async fn check_storage(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn record(&self, metrics: &DeploymentMetrics) -> Result<(), CollaboratorError> {
        let line = serde_json::to_string(metrics)
            .map_err(|e| CollaboratorError::Metrics(e.to_string()))?;
        tracing::info!(target: "rollout::metrics", "{}", line);
        Ok(())
    }
}

/// Prompt used when nobody is attached; never asks
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Prompt for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_validity_follows_flag() {
        assert!(LogNotifier::new(true).is_valid());
        assert!(!LogNotifier::new(false).is_valid());
        assert!(LogNotifier::new(true)
            .send_simple_message("hello")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn log_collector_records() {
        let metrics = DeploymentMetrics {
            application: "hello".to_string(),
            stack: "artd".to_string(),
            region: "us-east-1".to_string(),
            deployed_group: Some("hello-artd_v001".to_string()),
            previous_groups: vec!["hello-artd_v000".to_string()],
            capacity: Some(Capacity::new(1, 2, 1)),
            healthy_count: Some(1),
        };
        assert!(LogCollector.check_storage().await.is_ok());
        assert!(LogCollector.record(&metrics).await.is_ok());
    }

    #[test]
    fn non_interactive_never_blocks() {
        assert!(!NonInteractive.is_interactive());
        assert!(NonInteractive.confirm("proceed?"));
    }
}
