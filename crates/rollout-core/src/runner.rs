//! Phase runner
//!
//! Builds one deployer per in-scope stack and walks them through the
//! ordered phases of a mode. Inside a phase every deployer runs its steps
//! concurrently; the runner joins all of them before the next phase starts.
//!
//! Per-stack step failures are logged and recorded in the [`RunReport`] but
//! never abort the phase or the run. Only confirmation decline, upfront
//! checks and the convergence polls end a run early.

use crate::collaborators::{
    Inspector, LogCollector, LogNotifier, MetricsCollector, NonInteractive, Notifier, Prompt,
};
use crate::clock::Clock;
use crate::deployer::{DeployerFactory, StackDeployer, Step};
use crate::error::{CollaboratorError, RunError, ValidationError};
use crate::poller::{Convergence, ConvergencePoller};
use crate::types::{RunConfig, Stack};
use crate::update::{check_capacity_bounds, plan_capacity};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Ordered group of steps applied to every deployer concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    /// Log name
    pub name: &'static str,
    /// Steps run in order for each deployer
    pub steps: &'static [Step],
}

impl Phase {
    /// Discover the live version and provision the new one
    pub const PROVISION: Phase = Phase {
        name: "provision",
        steps: &[Step::CheckPrevious, Step::Deploy],
    };

    /// Post-healthy work and decommission of the previous version
    pub const CUTOVER: Phase = Phase {
        name: "cutover",
        steps: &[
            Step::FinishAdditionalWork,
            Step::TriggerLifecycleCallbacks,
            Step::CleanPreviousVersion,
        ],
    };

    /// Delete-mode teardown without provisioning
    pub const DECOMMISSION: Phase = Phase {
        name: "decommission",
        steps: &[
            Step::CheckPrevious,
            Step::SkipDeploy,
            Step::TriggerLifecycleCallbacks,
            Step::CleanPreviousVersion,
        ],
    };

    /// Metrics gathering
    pub const GATHER_METRICS: Phase = Phase {
        name: "gather-metrics",
        steps: &[Step::GatherMetrics],
    };

    /// Acceptance tests
    pub const API_TEST: Phase = Phase {
        name: "api-test",
        steps: &[Step::RunApiTest],
    };
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Failed step of one stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Stack name
    pub stack: String,
    /// Step that failed
    pub step: Step,
    /// Error or panic message
    pub error: String,
}

/// Outcome of one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    /// Phase that ran
    pub phase: Phase,
    /// Stacks whose tasks completed
    pub completed: Vec<String>,
    /// Step failures, in completion order
    pub failures: Vec<StepFailure>,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Outcome of a mode run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Stacks a deployer was built for
    pub deployers: Vec<String>,
    /// Phases in execution order
    pub phases: Vec<PhaseReport>,
    /// Health convergence, when it ran
    pub health: Option<Convergence>,
    /// Termination convergence, when it ran
    pub termination: Option<Convergence>,
}

impl RunReport {
    /// All step failures across phases
    pub fn failures(&self) -> impl Iterator<Item = &StepFailure> {
        self.phases.iter().flat_map(|p| p.failures.iter())
    }

    /// Number of step failures
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// Report of the named phase
    #[must_use]
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase.name == name)
    }
}

/// Run `phase` for every deployer and wait for all of them
///
/// Failed or panicking steps are recorded; later steps of the same stack
/// and every other stack still run.
pub async fn run_phase(
    phase: Phase,
    deployers: &[Arc<dyn StackDeployer>],
    config: &Arc<RunConfig>,
) -> PhaseReport {
    tracing::debug!(%phase, stacks = deployers.len(), "phase started");
    let mut tasks = JoinSet::new();

    for deployer in deployers {
        let deployer = Arc::clone(deployer);
        let config = Arc::clone(config);
        tasks.spawn(async move {
            let stack = deployer.stack_name().to_string();
            let mut failures = Vec::new();
            for &step in phase.steps {
                let outcome = AssertUnwindSafe(step.apply(deployer.as_ref(), &config))
                    .catch_unwind()
                    .await;
                let error = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => format!("step panicked: {}", panic_message(panic.as_ref())),
                };
                tracing::error!(phase = phase.name, %stack, "[{}] {}", step, error);
                failures.push(StepFailure {
                    stack: stack.clone(),
                    step,
                    error,
                });
            }
            (stack, failures)
        });
    }

    let mut report = PhaseReport::new(phase);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((stack, failures)) => {
                report.completed.push(stack);
                report.failures.extend(failures);
            }
            Err(e) => tracing::error!(%phase, error = %e, "phase task aborted"),
        }
    }
    tracing::debug!(%phase, failures = report.failures.len(), "phase finished");
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Orchestration engine for one invocation
pub struct Runner {
    pub(crate) config: RunConfig,
    pub(crate) stacks: Vec<Stack>,
    pub(crate) factory: Arc<dyn DeployerFactory>,
    pub(crate) inspector: Option<Arc<dyn Inspector>>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) collector: Arc<dyn MetricsCollector>,
    pub(crate) prompt: Arc<dyn Prompt>,
    pub(crate) poller: ConvergencePoller,
    pub(crate) out: Box<dyn Write + Send + Sync>,
}

impl Runner {
    /// Create runner over declared `stacks`
    #[must_use]
    pub fn new(config: RunConfig, stacks: Vec<Stack>, factory: Arc<dyn DeployerFactory>) -> Self {
        Self {
            config,
            stacks,
            factory,
            inspector: None,
            notifier: Arc::new(LogNotifier::new(false)),
            collector: Arc::new(LogCollector),
            prompt: Arc::new(NonInteractive),
            poller: ConvergencePoller::new(),
            out: Box::new(std::io::stdout()),
        }
    }

    /// With inspector for status and update
    #[must_use]
    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// With notifier
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// With metrics collector
    #[must_use]
    pub fn with_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// With confirmation prompt
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// With poller clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.poller = ConvergencePoller::with_clock(clock);
        self
    }

    /// With operator output sink
    #[must_use]
    pub fn with_output(mut self, out: Box<dyn Write + Send + Sync>) -> Self {
        self.out = out;
        self
    }

    /// Current configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Declared stacks admitted by the stack filter
    #[must_use]
    pub fn selected_stacks(&self) -> Vec<Stack> {
        self.stacks
            .iter()
            .filter(|s| self.config.selects(s))
            .cloned()
            .collect()
    }

    /// Ask the operator before a mutating run
    ///
    /// # Errors
    /// `RunError::Declined` when the operator answers no
    pub fn local_check(&self, message: &str) -> Result<(), RunError> {
        if self.config.auto_apply || !self.prompt.is_interactive() {
            return Ok(());
        }
        if self.prompt.confirm(message) {
            Ok(())
        } else {
            Err(RunError::Declined)
        }
    }

    /// Validate metrics storage when metrics are enabled
    ///
    /// # Errors
    /// `RunError::MetricsStorage` when the backend is unreachable
    pub async fn check_enabled_metrics(&self) -> Result<(), RunError> {
        if !self.config.metrics_enabled {
            return Ok(());
        }
        tracing::info!("metric measurement is enabled");
        self.collector
            .check_storage()
            .await
            .map_err(RunError::MetricsStorage)
    }

    /// Build one deployer per selected stack
    pub fn build_deployers(&self) -> Vec<Arc<dyn StackDeployer>> {
        let mut deployers = Vec::new();
        for stack in &self.stacks {
            if !self.config.selects(stack) {
                tracing::debug!(stack = %stack.stack, "skipping this stack");
                continue;
            }
            tracing::debug!(stack = %stack.stack, "add deployer");
            deployers.push(self.factory.build(stack, &self.config));
        }
        if deployers.is_empty() {
            tracing::warn!(filter = ?self.config.stack, "no stack selected for this run");
        }
        deployers
    }

    /// Merged capacity of every selected stack must hold its bounds
    ///
    /// # Errors
    /// `ValidationError::StackCapacity` for the first stack in manifest order
    pub fn check_deploy_capacity(&self) -> Result<(), ValidationError> {
        if self.config.force_manifest_capacity {
            return Ok(());
        }
        for stack in self.stacks.iter().filter(|s| self.config.selects(s)) {
            let capacity = plan_capacity(stack.capacity, &self.config);
            check_capacity_bounds(capacity).map_err(|reason| {
                ValidationError::StackCapacity {
                    stack: stack.stack.clone(),
                    reason: Box::new(reason),
                }
            })?;
        }
        Ok(())
    }

    /// Main flow of `deploy`
    ///
    /// # Errors
    /// Invalid stack capacity, decline, metrics storage failure, health
    /// timeout or unrecoverable health probe. Per-stack step failures are
    /// only reported.
    pub async fn deploy(&mut self) -> Result<RunReport, RunError> {
        self.check_deploy_capacity()?;
        self.local_check("Do you really want to deploy this application? ")?;
        tracing::info!(application = %self.config.application, "beginning deployment");

        self.print_summary()?;
        self.announce().await;
        self.check_enabled_metrics().await?;

        let deployers = self.build_deployers();
        let config = Arc::new(self.config.clone());
        let mut report = RunReport {
            deployers: names(&deployers),
            ..RunReport::default()
        };

        report
            .phases
            .push(run_phase(Phase::PROVISION, &deployers, &config).await);

        report.health = Some(
            self.poller
                .wait_healthy(&deployers, Arc::clone(&config))
                .await?,
        );

        report
            .phases
            .push(run_phase(Phase::CUTOVER, &deployers, &config).await);

        report.termination = Some(
            self.poller
                .wait_terminated(&deployers, Arc::clone(&config))
                .await?,
        );

        if config.metrics_enabled {
            report
                .phases
                .push(run_phase(Phase::GATHER_METRICS, &deployers, &config).await);
        }

        report
            .phases
            .push(run_phase(Phase::API_TEST, &deployers, &config).await);

        let done = format!(":100: Deployment is done: {}", self.config.application);
        self.notify(&done).await;
        Ok(report)
    }

    /// Main flow of `delete`
    ///
    /// # Errors
    /// Decline or metrics storage failure.
    pub async fn delete(&mut self) -> Result<RunReport, RunError> {
        self.local_check("Do you really want to delete applications? ")?;
        tracing::info!(application = %self.config.application, "beginning delete process");
        self.config.notifications_off = true;

        self.check_enabled_metrics().await?;

        let deployers = self.build_deployers();
        let config = Arc::new(self.config.clone());
        let mut report = RunReport {
            deployers: names(&deployers),
            ..RunReport::default()
        };

        report
            .phases
            .push(run_phase(Phase::DECOMMISSION, &deployers, &config).await);

        report.termination = Some(
            self.poller
                .wait_terminated(&deployers, Arc::clone(&config))
                .await?,
        );

        if config.metrics_enabled {
            report
                .phases
                .push(run_phase(Phase::GATHER_METRICS, &deployers, &config).await);
        }

        Ok(report)
    }

    pub(crate) fn inspector(&self) -> Result<Arc<dyn Inspector>, RunError> {
        self.inspector.clone().ok_or_else(|| {
            RunError::Collaborator(CollaboratorError::NotFound(
                "no inspector configured".to_string(),
            ))
        })
    }

    fn print_summary(&mut self) -> Result<(), RunError> {
        let stacks = self.selected_stacks();
        let out = &mut self.out;
        writeln!(out, "==================== Summary ====================")?;
        writeln!(out, "Application: {}", self.config.application)?;
        writeln!(out, "Region: {}", self.config.region)?;
        writeln!(out, "Timeout: {}s", self.config.timeout.as_secs())?;
        writeln!(
            out,
            "Polling interval: {}s",
            self.config.polling_interval.as_secs()
        )?;
        writeln!(out, "Stacks:")?;
        for stack in &stacks {
            writeln!(out, "  - {} [{}] {}", stack.stack, stack.region, stack.capacity)?;
        }
        writeln!(out, "=================================================")?;
        out.flush()?;
        Ok(())
    }

    /// Send the pre-deployment summary; a failure disables notifications
    async fn announce(&mut self) {
        if self.notifier.is_valid() {
            tracing::debug!("notification channel is valid");
            let stacks = self.selected_stacks();
            let sent = self
                .notifier
                .send_summary_message(&self.config, &stacks, &self.config.application)
                .await;
            if let Err(e) = sent {
                tracing::warn!(error = %e, "summary notification failed, notifications disabled");
                self.config.notifications_off = true;
            }
        } else if !self.config.notifications_off {
            tracing::warn!("no notification channel is configured");
        }
    }

    async fn notify(&mut self, text: &str) {
        if self.config.notifications_off || !self.notifier.is_valid() {
            return;
        }
        let sent = self.notifier.send_simple_message(text).await;
        if let Err(e) = sent {
            tracing::warn!(error = %e, "notification failed, notifications disabled");
            self.config.notifications_off = true;
        }
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("stacks", &self.stacks.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn names(deployers: &[Arc<dyn StackDeployer>]) -> Vec<String> {
    deployers
        .iter()
        .map(|d| d.stack_name().to_string())
        .collect()
}
