//! Testing utilities for the rollout workspace
//!
//! Hand-written fakes for every seam of the engine: deployers with scripted
//! probes, collaborators that record what they were asked, and clocks that
//! report arbitrary elapsed time without sleeping.

#![allow(missing_docs)]

use chrono::Utc;
use parking_lot::Mutex;
use rollout_core::{
    Capacity, Clock, CollaboratorError, DeployerError, DeployerFactory, DeploymentMetrics,
    GroupDescriptor, GroupHandle, Inspector, MetricsCollector, Notifier, ProbeReport, Prompt,
    RunConfig, Stack, StackDeployer, Step, UpdateFields,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared `(stack, operation)` log, in completion order
pub type CallLog = Arc<Mutex<Vec<(String, String)>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Operations of `stack` in `log`, in order
pub fn ops_of(log: &CallLog, stack: &str) -> Vec<String> {
    log.lock()
        .iter()
        .filter(|(s, _)| s == stack)
        .map(|(_, op)| op.clone())
        .collect()
}

/// Position of the first entry for `op` in `log`
pub fn first_index(log: &CallLog, op: &str) -> Option<usize> {
    log.lock().iter().position(|(_, o)| o == op)
}

/// Position of the last entry for `op` in `log`
pub fn last_index(log: &CallLog, op: &str) -> Option<usize> {
    log.lock().iter().rposition(|(_, o)| o == op)
}

// ============================================================================
// Deployer
// ============================================================================

/// Deployer with scripted probe answers
///
/// A probe script is consumed front to back; its last entry repeats
/// forever. An empty script always reports the condition met.
pub struct FakeDeployer {
    name: String,
    health: Mutex<VecDeque<ProbeReport>>,
    terminate: Mutex<VecDeque<ProbeReport>>,
    failing: HashSet<Step>,
    panicking: HashSet<Step>,
    probe_delay: Duration,
    step_delay: Duration,
    health_probes: AtomicUsize,
    terminate_probes: AtomicUsize,
    log: CallLog,
}

impl FakeDeployer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health: Mutex::new(VecDeque::new()),
            terminate: Mutex::new(VecDeque::new()),
            failing: HashSet::new(),
            panicking: HashSet::new(),
            probe_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            health_probes: AtomicUsize::new(0),
            terminate_probes: AtomicUsize::new(0),
            log: call_log(),
        }
    }

    /// Health probes report not-met `rounds` times, then met
    #[must_use]
    pub fn healthy_after(self, rounds: usize) -> Self {
        let script = self.met_after(rounds);
        *self.health.lock() = script;
        self
    }

    /// Health probes never report met
    #[must_use]
    pub fn never_healthy(self) -> Self {
        *self.health.lock() = VecDeque::from([ProbeReport::status(&self.name, false)]);
        self
    }

    /// Termination probes report not-met `rounds` times, then met
    #[must_use]
    pub fn terminated_after(self, rounds: usize) -> Self {
        let script = self.met_after(rounds);
        *self.terminate.lock() = script;
        self
    }

    #[must_use]
    pub fn with_health_reports(self, reports: Vec<ProbeReport>) -> Self {
        *self.health.lock() = reports.into();
        self
    }

    #[must_use]
    pub fn with_terminate_reports(self, reports: Vec<ProbeReport>) -> Self {
        *self.terminate.lock() = reports.into();
        self
    }

    #[must_use]
    pub fn failing_at(mut self, step: Step) -> Self {
        self.failing.insert(step);
        self
    }

    #[must_use]
    pub fn panicking_at(mut self, step: Step) -> Self {
        self.panicking.insert(step);
        self
    }

    #[must_use]
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn health_probes(&self) -> usize {
        self.health_probes.load(Ordering::SeqCst)
    }

    pub fn terminate_probes(&self) -> usize {
        self.terminate_probes.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> CallLog {
        Arc::clone(&self.log)
    }

    fn met_after(&self, rounds: usize) -> VecDeque<ProbeReport> {
        let mut script: VecDeque<ProbeReport> = (0..rounds)
            .map(|_| ProbeReport::status(&self.name, false))
            .collect();
        script.push_back(ProbeReport::status(&self.name, true));
        script
    }

    fn record(&self, op: &str) {
        self.log.lock().push((self.name.clone(), op.to_string()));
    }

    async fn step(&self, step: Step) -> Result<(), DeployerError> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        self.record(step.name());
        if self.panicking.contains(&step) {
            panic!("{} blew up in {}", self.name, step);
        }
        if self.failing.contains(&step) {
            return Err(DeployerError::MissingState {
                step: step.name(),
                stack: self.name.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn probe(
        &self,
        script: &Mutex<VecDeque<ProbeReport>>,
        counter: &AtomicUsize,
        op: &str,
    ) -> ProbeReport {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        self.record(op);

        let mut script = script.lock();
        match script.pop_front() {
            Some(report) => {
                if script.is_empty() {
                    script.push_back(report.clone());
                }
                report
            }
            None => ProbeReport::status(&self.name, true),
        }
    }
}

#[async_trait::async_trait]
impl StackDeployer for FakeDeployer {
    fn stack_name(&self) -> &str {
        &self.name
    }

    async fn check_previous(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::CheckPrevious).await
    }

    async fn deploy(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::Deploy).await
    }

    fn skip_deploy_step(&self) {
        self.record(Step::SkipDeploy.name());
        if self.panicking.contains(&Step::SkipDeploy) {
            panic!("{} blew up in {}", self.name, Step::SkipDeploy);
        }
    }

    async fn finish_additional_work(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::FinishAdditionalWork).await
    }

    async fn trigger_lifecycle_callbacks(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::TriggerLifecycleCallbacks).await
    }

    async fn clean_previous_version(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::CleanPreviousVersion).await
    }

    async fn gather_metrics(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::GatherMetrics).await
    }

    async fn run_api_test(&self, _: &RunConfig) -> Result<(), DeployerError> {
        self.step(Step::RunApiTest).await
    }

    async fn health_checking(&self, _: &RunConfig) -> ProbeReport {
        self.probe(&self.health, &self.health_probes, "health").await
    }

    async fn terminate_checking(&self, _: &RunConfig) -> ProbeReport {
        self.probe(&self.terminate, &self.terminate_probes, "terminate")
            .await
    }
}

/// Wrap fakes for the poller
pub fn as_deployers(fakes: &[Arc<FakeDeployer>]) -> Vec<Arc<dyn StackDeployer>> {
    fakes
        .iter()
        .map(|f| Arc::clone(f) as Arc<dyn StackDeployer>)
        .collect()
}

/// Factory handing out preconfigured fakes, or default ones on the shared log
pub struct FakeFactory {
    log: CallLog,
    prepared: HashMap<String, Arc<FakeDeployer>>,
    built: Mutex<Vec<String>>,
    last_config: Mutex<Option<RunConfig>>,
}

impl FakeFactory {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            prepared: HashMap::new(),
            built: Mutex::new(Vec::new()),
            last_config: Mutex::new(None),
        }
    }

    /// Hand out `deployer` for its stack name
    #[must_use]
    pub fn with_deployer(mut self, deployer: FakeDeployer) -> Self {
        let deployer = deployer.with_log(Arc::clone(&self.log));
        self.prepared
            .insert(deployer.stack_name().to_string(), Arc::new(deployer));
        self
    }

    /// Stacks built so far, in build order
    pub fn built(&self) -> Vec<String> {
        self.built.lock().clone()
    }

    /// Configuration seen by the latest build
    pub fn last_config(&self) -> Option<RunConfig> {
        self.last_config.lock().clone()
    }

    pub fn prepared(&self, stack: &str) -> Option<Arc<FakeDeployer>> {
        self.prepared.get(stack).cloned()
    }
}

impl DeployerFactory for FakeFactory {
    fn build(&self, stack: &Stack, config: &RunConfig) -> Arc<dyn StackDeployer> {
        self.built.lock().push(stack.stack.clone());
        *self.last_config.lock() = Some(config.clone());
        match self.prepared.get(&stack.stack) {
            Some(deployer) => Arc::clone(deployer) as Arc<dyn StackDeployer>,
            None => Arc::new(FakeDeployer::new(&stack.stack).with_log(Arc::clone(&self.log))),
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    valid: bool,
    fail_summary: bool,
    messages: Mutex<Vec<String>>,
    summaries: Mutex<Vec<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new(valid: bool) -> Self {
        Self {
            valid,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing_summary(mut self) -> Self {
        self.fail_summary = true;
        self
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Stack names of every summary sent
    pub fn summaries(&self) -> Vec<Vec<String>> {
        self.summaries.lock().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    fn is_valid(&self) -> bool {
        self.valid
    }

    async fn send_simple_message(&self, text: &str) -> Result<(), CollaboratorError> {
        self.messages.lock().push(text.to_string());
        Ok(())
    }

    async fn send_summary_message(
        &self,
        _config: &RunConfig,
        stacks: &[Stack],
        _name: &str,
    ) -> Result<(), CollaboratorError> {
        if self.fail_summary {
            return Err(CollaboratorError::Notification("webhook down".to_string()));
        }
        self.summaries
            .lock()
            .push(stacks.iter().map(|s| s.stack.clone()).collect());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCollector {
    fail_storage: bool,
    storage_checks: AtomicUsize,
    recorded: Mutex<Vec<DeploymentMetrics>>,
}

impl FakeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_storage(mut self) -> Self {
        self.fail_storage = true;
        self
    }

    pub fn storage_checks(&self) -> usize {
        self.storage_checks.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<DeploymentMetrics> {
        self.recorded.lock().clone()
    }
}

#[async_trait::async_trait]
impl MetricsCollector for FakeCollector {
    async fn check_storage(&self) -> Result<(), CollaboratorError> {
        self.storage_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_storage {
            return Err(CollaboratorError::Metrics("table not found".to_string()));
        }
        Ok(())
    }

    async fn record(&self, metrics: &DeploymentMetrics) -> Result<(), CollaboratorError> {
        self.recorded.lock().push(metrics.clone());
        Ok(())
    }
}

/// Live group descriptor for inspector fakes
pub fn group(name: &str, stack: &str, capacity: Capacity) -> GroupDescriptor {
    GroupDescriptor {
        name: name.to_string(),
        region: "us-east-1".to_string(),
        stack: stack.to_string(),
        capacity,
        instance_count: capacity.desired,
        healthy_count: capacity.desired,
        created_at: Utc::now(),
        tags: BTreeMap::new(),
    }
}

/// Inspector over a single live group
pub struct FakeInspector {
    group: Mutex<Option<GroupDescriptor>>,
    updates: Mutex<Vec<UpdateFields>>,
}

impl FakeInspector {
    pub fn new(group: GroupDescriptor) -> Self {
        Self {
            group: Mutex::new(Some(group)),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Inspector with no live group
    pub fn empty() -> Self {
        Self {
            group: Mutex::new(None),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn updates(&self) -> Vec<UpdateFields> {
        self.updates.lock().clone()
    }
}

#[async_trait::async_trait]
impl Inspector for FakeInspector {
    async fn select_stack(&self, application: &str) -> Result<GroupHandle, CollaboratorError> {
        self.group
            .lock()
            .as_ref()
            .map(|g| GroupHandle(g.name.clone()))
            .ok_or_else(|| CollaboratorError::NotFound(format!("no live group for {application}")))
    }

    async fn get_stack_information(
        &self,
        handle: &GroupHandle,
    ) -> Result<GroupDescriptor, CollaboratorError> {
        self.group
            .lock()
            .clone()
            .filter(|g| g.name == handle.0)
            .ok_or_else(|| CollaboratorError::NotFound(handle.0.clone()))
    }

    async fn update(&self, fields: &UpdateFields) -> Result<(), CollaboratorError> {
        self.updates.lock().push(fields.clone());
        if let Some(group) = self.group.lock().as_mut() {
            group.capacity = fields.capacity;
        }
        Ok(())
    }

    fn generate_stack(&self, region: &str, group: &GroupDescriptor) -> Stack {
        Stack::new(group.stack.clone(), region, group.capacity)
    }
}

/// Prompt with a fixed answer
pub struct ScriptedPrompt {
    interactive: bool,
    answer: bool,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(interactive: bool, answer: bool) -> Self {
        Self {
            interactive,
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

impl Prompt for ScriptedPrompt {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn confirm(&self, message: &str) -> bool {
        self.asked.lock().push(message.to_string());
        self.answer
    }
}

// ============================================================================
// Clock and output
// ============================================================================

/// Clock that never waits
///
/// Every `now()` call advances time by `tick`; every `sleep` advances it
/// by the requested duration and yields.
pub struct StepClock {
    base: Instant,
    tick: Duration,
    offset: Mutex<Duration>,
    sleeps: AtomicUsize,
}

impl StepClock {
    pub fn new(tick: Duration) -> Self {
        Self {
            base: Instant::now(),
            tick,
            offset: Mutex::new(Duration::ZERO),
            sleeps: AtomicUsize::new(0),
        }
    }

    /// Clock that only moves on `sleep`
    pub fn frozen() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

#[async_trait::async_trait]
impl Clock for StepClock {
    fn now(&self) -> Instant {
        let mut offset = self.offset.lock();
        *offset += self.tick;
        self.base + *offset
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        *self.offset.lock() += duration;
        tokio::task::yield_now().await;
    }
}

/// Cloneable in-memory writer for runner output
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
