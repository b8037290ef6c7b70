//! Convergence polling
//!
//! Drives a set of deployers to a target condition (healthy, or previous
//! version terminated):
//! - each round probes only the stacks not yet done, one task per stack
//! - probe tasks are pure producers on a per-round channel
//! - the collector owns the done set and counts down exactly the probes it launched
//!
//! Only health convergence has a deadline. Termination convergence keeps
//! polling until every previous version is gone.

use crate::clock::{Clock, SystemClock};
use crate::deployer::{ProbeReport, StackDeployer};
use crate::error::RunError;
use crate::types::RunConfig;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Condition a convergence poll waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// New version healthy
    Healthy,
    /// Previous version terminated
    Terminated,
}

impl Target {
    /// Unrecoverable probes abort the poll
    #[inline]
    #[must_use]
    pub fn probe_errors_are_fatal(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Poll is bounded by the configured timeout
    #[inline]
    #[must_use]
    pub fn has_deadline(self) -> bool {
        matches!(self, Self::Healthy)
    }

    async fn probe(self, deployer: &dyn StackDeployer, config: &RunConfig) -> ProbeReport {
        match self {
            Self::Healthy => deployer.health_checking(config).await,
            Self::Terminated => deployer.terminate_checking(config).await,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Result of a successful convergence poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence {
    /// Rounds run, including the final one
    pub rounds: usize,
    /// Stacks that reached the condition
    pub done: BTreeSet<String>,
    /// Time from loop entry to convergence
    pub elapsed: Duration,
}

/// Fan-out/fan-in poller shared by health and termination convergence
#[derive(Clone)]
pub struct ConvergencePoller {
    clock: Arc<dyn Clock>,
}

impl ConvergencePoller {
    /// Create a poller on the system clock
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a poller on a custom clock
    #[inline]
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Wait until every deployer reports its new version healthy
    ///
    /// # Errors
    /// - `RunError::ProbeFailed` the first round any probe is unrecoverable
    /// - `RunError::Timeout` when a round ends incomplete past `config.timeout`
    pub async fn wait_healthy(
        &self,
        deployers: &[Arc<dyn StackDeployer>],
        config: Arc<RunConfig>,
    ) -> Result<Convergence, RunError> {
        self.converge(Target::Healthy, deployers, config).await
    }

    /// Wait until every deployer reports its previous version terminated
    ///
    /// Never times out.
    pub async fn wait_terminated(
        &self,
        deployers: &[Arc<dyn StackDeployer>],
        config: Arc<RunConfig>,
    ) -> Result<Convergence, RunError> {
        self.converge(Target::Terminated, deployers, config).await
    }

    /// Poll until every deployer satisfies `target`
    pub async fn converge(
        &self,
        target: Target,
        deployers: &[Arc<dyn StackDeployer>],
        config: Arc<RunConfig>,
    ) -> Result<Convergence, RunError> {
        let start = self.clock.now();
        let mut done = BTreeSet::new();
        let mut rounds = 0;

        tracing::debug!(
            %target,
            stacks = deployers.len(),
            timeout_secs = config.timeout.as_secs(),
            "start convergence polling"
        );

        loop {
            rounds += 1;
            self.run_round(target, deployers, &config, &mut done).await?;

            if deployers.iter().all(|d| done.contains(d.stack_name())) {
                let elapsed = self.clock.now().saturating_duration_since(start);
                tracing::info!(%target, rounds, "all stacks are {}", target);
                return Ok(Convergence {
                    rounds,
                    done,
                    elapsed,
                });
            }

            if target.has_deadline() {
                let elapsed = self.clock.now().saturating_duration_since(start);
                if elapsed > config.timeout {
                    return Err(RunError::timeout(config.timeout, elapsed));
                }
            }

            tracing::info!(
                %target,
                done = done.len(),
                total = deployers.len(),
                "not all stacks are {} yet, waiting",
                target
            );
            self.clock.sleep(config.polling_interval).await;
        }
    }

    /// One probe round; merges satisfied stacks into `done`
    async fn run_round(
        &self,
        target: Target,
        deployers: &[Arc<dyn StackDeployer>],
        config: &Arc<RunConfig>,
        done: &mut BTreeSet<String>,
    ) -> Result<(), RunError> {
        let (tx, mut rx) = mpsc::channel::<ProbeReport>(1);
        let mut outstanding = 0usize;

        for deployer in deployers {
            if done.contains(deployer.stack_name()) {
                continue;
            }
            outstanding += 1;

            let deployer = Arc::clone(deployer);
            let config = Arc::clone(config);
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = target.probe(deployer.as_ref(), &config).await;
                // A closed channel means the collector already gave up on this round.
                let _ = tx.send(report).await;
            });
        }
        drop(tx);

        while outstanding > 0 {
            let Some(report) = rx.recv().await else {
                tracing::warn!(
                    %target,
                    missing = outstanding,
                    "probe tasks ended without reporting"
                );
                break;
            };
            outstanding -= 1;

            match report {
                ProbeReport::Unrecoverable { stack, reason } if target.probe_errors_are_fatal() => {
                    return Err(RunError::ProbeFailed { stack, reason });
                }
                ProbeReport::Unrecoverable { stack, reason } => {
                    tracing::warn!(%target, %stack, %reason, "probe failed, retrying next round");
                }
                ProbeReport::Status { stack, met: true } => {
                    tracing::debug!(%target, %stack, "stack reached condition");
                    done.insert(stack);
                }
                ProbeReport::Status { .. } => {}
            }
        }

        Ok(())
    }
}

impl Default for ConvergencePoller {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConvergencePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvergencePoller").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployerError;

    /// Deployer whose probes always report the same value
    struct Fixed {
        name: String,
        healthy: bool,
    }

    #[async_trait::async_trait]
    impl StackDeployer for Fixed {
        fn stack_name(&self) -> &str {
            &self.name
        }
        async fn check_previous(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        async fn deploy(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        fn skip_deploy_step(&self) {}
        async fn finish_additional_work(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        async fn trigger_lifecycle_callbacks(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        async fn clean_previous_version(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        async fn gather_metrics(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        async fn run_api_test(&self, _: &RunConfig) -> Result<(), DeployerError> {
            Ok(())
        }
        async fn health_checking(&self, _: &RunConfig) -> ProbeReport {
            ProbeReport::status(&self.name, self.healthy)
        }
        async fn terminate_checking(&self, _: &RunConfig) -> ProbeReport {
            ProbeReport::status(&self.name, true)
        }
    }

    fn fixed(name: &str, healthy: bool) -> Arc<dyn StackDeployer> {
        Arc::new(Fixed {
            name: name.to_string(),
            healthy,
        })
    }

    #[tokio::test]
    async fn empty_set_converges_in_one_round() {
        let poller = ConvergencePoller::new();
        let result = poller
            .wait_healthy(&[], Arc::new(RunConfig::default()))
            .await
            .unwrap();
        assert_eq!(result.rounds, 1);
        assert!(result.done.is_empty());
    }

    #[tokio::test]
    async fn healthy_stacks_converge_in_one_round() {
        let poller = ConvergencePoller::new();
        let deployers = vec![fixed("a", true), fixed("b", true)];
        let result = poller
            .wait_healthy(&deployers, Arc::new(RunConfig::default()))
            .await
            .unwrap();
        assert_eq!(result.rounds, 1);
        assert_eq!(result.done.len(), 2);
    }

    #[tokio::test]
    async fn unhealthy_stack_times_out_on_zero_timeout() {
        let poller = ConvergencePoller::new();
        let deployers = vec![fixed("a", true), fixed("b", false)];
        let config = RunConfig::default()
            .with_timeout(Duration::ZERO)
            .with_polling_interval(Duration::from_millis(1));

        let result = poller.wait_healthy(&deployers, Arc::new(config)).await;
        assert!(matches!(result, Err(RunError::Timeout { .. })));
    }

    #[test]
    fn target_properties() {
        assert!(Target::Healthy.has_deadline());
        assert!(!Target::Terminated.has_deadline());
        assert!(Target::Healthy.probe_errors_are_fatal());
        assert!(!Target::Terminated.probe_errors_are_fatal());
    }
}
