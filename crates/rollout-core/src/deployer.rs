//! Stack deployer contract
//!
//! One deployer is bound to exactly one stack. The runner drives deployers
//! through lifecycle steps and the convergence poller probes them; deployers
//! never talk to each other.

use crate::error::DeployerError;
use crate::types::{RunConfig, Stack};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Map key signalling an unrecoverable probe in [`ProbeReport::to_map`]
pub const ERROR_SENTINEL: &str = "error";

/// Outcome of one health or termination probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReport {
    /// Probe ran; `met` tells whether the condition holds
    Status {
        /// Stack that was probed
        stack: String,
        /// Condition satisfied
        met: bool,
    },
    /// Probe could not determine the condition and never will
    Unrecoverable {
        /// Stack that was probed
        stack: String,
        /// Failure description
        reason: String,
    },
}

impl ProbeReport {
    /// Normal probe result
    #[inline]
    #[must_use]
    pub fn status(stack: impl Into<String>, met: bool) -> Self {
        Self::Status {
            stack: stack.into(),
            met,
        }
    }

    /// Unrecoverable probe result
    #[inline]
    #[must_use]
    pub fn unrecoverable(stack: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unrecoverable {
            stack: stack.into(),
            reason: reason.into(),
        }
    }

    /// Stack the report is about
    #[inline]
    #[must_use]
    pub fn stack(&self) -> &str {
        match self {
            Self::Status { stack, .. } | Self::Unrecoverable { stack, .. } => stack,
        }
    }

    /// True for a normal probe whose condition holds
    #[inline]
    #[must_use]
    pub fn is_met(&self) -> bool {
        matches!(self, Self::Status { met: true, .. })
    }

    /// Single-entry map form: `{stack: met}` or `{"error": true}`
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, bool> {
        match self {
            Self::Status { stack, met } => HashMap::from([(stack.clone(), *met)]),
            Self::Unrecoverable { .. } => HashMap::from([(ERROR_SENTINEL.to_string(), true)]),
        }
    }
}

/// Lifecycle operations for one stack
///
/// Every method may run concurrently with the same method on a different
/// deployer instance.
#[async_trait::async_trait]
pub trait StackDeployer: Send + Sync {
    /// Stable identifier used by the convergence poller
    fn stack_name(&self) -> &str;

    /// Discover the currently live version
    async fn check_previous(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Provision the new version
    async fn deploy(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Mark the deploy step as intentionally bypassed
    fn skip_deploy_step(&self);

    /// Post-healthy work such as attaching scaling policies
    async fn finish_additional_work(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Invoke lifecycle hooks on the previous version
    async fn trigger_lifecycle_callbacks(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Decommission the previous version
    async fn clean_previous_version(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Collect and forward metrics for the version just acted on
    async fn gather_metrics(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Run acceptance tests; `Ok` when none are configured
    async fn run_api_test(&self, config: &RunConfig) -> Result<(), DeployerError>;

    /// Probe whether the new version is healthy
    async fn health_checking(&self, config: &RunConfig) -> ProbeReport;

    /// Probe whether the previous version finished terminating
    async fn terminate_checking(&self, config: &RunConfig) -> ProbeReport;
}

/// Builds one deployer per stack
pub trait DeployerFactory: Send + Sync {
    /// Create the deployer bound to `stack`
    fn build(&self, stack: &Stack, config: &RunConfig) -> Arc<dyn StackDeployer>;
}

/// Per-stack lifecycle step run inside a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// [`StackDeployer::check_previous`]
    CheckPrevious,
    /// [`StackDeployer::deploy`]
    Deploy,
    /// [`StackDeployer::skip_deploy_step`]
    SkipDeploy,
    /// [`StackDeployer::finish_additional_work`]
    FinishAdditionalWork,
    /// [`StackDeployer::trigger_lifecycle_callbacks`]
    TriggerLifecycleCallbacks,
    /// [`StackDeployer::clean_previous_version`]
    CleanPreviousVersion,
    /// [`StackDeployer::gather_metrics`]
    GatherMetrics,
    /// [`StackDeployer::run_api_test`]
    RunApiTest,
}

impl Step {
    /// Log name of the step
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CheckPrevious => "StepCheckPrevious",
            Self::Deploy => "StepDeploy",
            Self::SkipDeploy => "StepSkipDeploy",
            Self::FinishAdditionalWork => "StepFinishAdditionalWork",
            Self::TriggerLifecycleCallbacks => "StepTriggerLifecycleCallbacks",
            Self::CleanPreviousVersion => "StepCleanPreviousVersion",
            Self::GatherMetrics => "StepGatherMetrics",
            Self::RunApiTest => "StepRunApiTest",
        }
    }

    /// Run this step against `deployer`
    pub async fn apply(
        self,
        deployer: &dyn StackDeployer,
        config: &RunConfig,
    ) -> Result<(), DeployerError> {
        match self {
            Self::CheckPrevious => deployer.check_previous(config).await,
            Self::Deploy => deployer.deploy(config).await,
            Self::SkipDeploy => {
                deployer.skip_deploy_step();
                Ok(())
            }
            Self::FinishAdditionalWork => deployer.finish_additional_work(config).await,
            Self::TriggerLifecycleCallbacks => deployer.trigger_lifecycle_callbacks(config).await,
            Self::CleanPreviousVersion => deployer.clean_previous_version(config).await,
            Self::GatherMetrics => deployer.gather_metrics(config).await,
            Self::RunApiTest => deployer.run_api_test(config).await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
