//! Blue/green stack deployer
//!
//! Each deployment creates a new autoscaling group named
//! `{application}-{stack}_v{NNN}` next to the live one, waits for it to be
//! healthy, then removes every previous version of the stack.
//!
//! All cloud interaction goes through [`CloudProvider`].

use crate::collaborators::{DeploymentMetrics, MetricsCollector};
use crate::deployer::{DeployerFactory, ProbeReport, StackDeployer};
use crate::error::{CollaboratorError, DeployerError};
use crate::types::{ApiTestTemplate, Capacity, GroupDescriptor, RunConfig, Stack};
use crate::update::plan_capacity;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Version numbers wrap after this many deployments
const VERSION_MODULUS: u32 = 1000;

/// Group creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    /// Group name
    pub name: String,
    /// Stack the group belongs to
    pub stack: String,
    /// Autoscaling bounds
    pub capacity: Capacity,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

/// Cloud API used by [`BlueGreenDeployer`]
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Live groups in `region` whose name starts with `prefix`
    async fn live_groups(
        &self,
        region: &str,
        prefix: &str,
    ) -> Result<Vec<GroupDescriptor>, CollaboratorError>;

    /// Create a group
    async fn create_group(
        &self,
        region: &str,
        request: &GroupRequest,
    ) -> Result<GroupDescriptor, CollaboratorError>;

    /// Describe a group; `None` once it no longer exists
    async fn describe_group(
        &self,
        region: &str,
        name: &str,
    ) -> Result<Option<GroupDescriptor>, CollaboratorError>;

    /// Start deleting a group
    async fn delete_group(&self, region: &str, name: &str) -> Result<(), CollaboratorError>;

    /// Attach scaling policies
    async fn attach_scaling_policies(
        &self,
        region: &str,
        name: &str,
        policies: &[String],
    ) -> Result<(), CollaboratorError>;

    /// Run one lifecycle callback against a group
    async fn run_lifecycle_callback(
        &self,
        region: &str,
        name: &str,
        command: &str,
    ) -> Result<(), CollaboratorError>;

    /// Run an API test against a group's endpoint
    async fn run_api_test(
        &self,
        region: &str,
        name: &str,
        template: &ApiTestTemplate,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Default)]
struct DeployState {
    previous: Vec<String>,
    deployed: Option<String>,
    skipped: bool,
}

/// Production [`StackDeployer`]
pub struct BlueGreenDeployer {
    application: String,
    stack: Stack,
    region: String,
    api_test: Option<ApiTestTemplate>,
    provider: Arc<dyn CloudProvider>,
    collector: Arc<dyn MetricsCollector>,
    state: Mutex<DeployState>,
}

impl BlueGreenDeployer {
    /// Create a deployer for `stack`
    #[must_use]
    pub fn new(
        application: impl Into<String>,
        stack: Stack,
        region: impl Into<String>,
        api_test: Option<ApiTestTemplate>,
        provider: Arc<dyn CloudProvider>,
        collector: Arc<dyn MetricsCollector>,
    ) -> Self {
        let region = region.into();
        let region = if stack.region.is_empty() {
            region
        } else {
            stack.region.clone()
        };
        Self {
            application: application.into(),
            stack,
            region,
            api_test,
            provider,
            collector,
            state: Mutex::new(DeployState::default()),
        }
    }

    /// Name prefix shared by every version of this stack
    #[must_use]
    pub fn prefix(&self) -> String {
        group_prefix(&self.application, &self.stack.stack)
    }

    /// Previous versions found by `check_previous`
    #[must_use]
    pub fn previous_versions(&self) -> Vec<String> {
        self.state.lock().previous.clone()
    }

    /// Group created by `deploy`
    #[must_use]
    pub fn deployed_group(&self) -> Option<String> {
        self.state.lock().deployed.clone()
    }

    fn deployed_or(&self, step: &'static str) -> Result<String, DeployerError> {
        self.deployed_group()
            .ok_or_else(|| DeployerError::MissingState {
                step,
                stack: self.stack.stack.clone(),
                reason: "no group was deployed".to_string(),
            })
    }

    fn capacity_for(&self, config: &RunConfig) -> Capacity {
        if config.force_manifest_capacity {
            self.stack.capacity
        } else {
            plan_capacity(self.stack.capacity, config)
        }
    }
}

/// `{application}-{stack}_v`
#[must_use]
pub fn group_prefix(application: &str, stack: &str) -> String {
    format!("{application}-{stack}_v")
}

/// Version number of `name` under `prefix`
#[must_use]
pub fn parse_version(prefix: &str, name: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Name for the version following the newest one in `previous`
///
/// Versions wrap at 1000, so the newest is the live version followed by the
/// widest run of unused numbers. `None` when every number is live.
#[must_use]
pub fn next_group_name(prefix: &str, previous: &[String]) -> Option<String> {
    let mut versions: Vec<u32> = previous
        .iter()
        .filter_map(|name| parse_version(prefix, name))
        .filter(|v| *v < VERSION_MODULUS)
        .collect();
    versions.sort_unstable();
    versions.dedup();

    let next = match versions.len() {
        0 => 0,
        len => {
            let newest = (0..len)
                .max_by_key(|&i| {
                    let gap = (versions[(i + 1) % len] + VERSION_MODULUS - versions[i])
                        % VERSION_MODULUS;
                    if gap == 0 {
                        VERSION_MODULUS
                    } else {
                        gap
                    }
                })
                .map_or(0, |i| versions[i]);
            let next = (newest + 1) % VERSION_MODULUS;
            if versions.binary_search(&next).is_ok() {
                return None;
            }
            next
        }
    };
    Some(format!("{prefix}{next:03}"))
}

#[async_trait::async_trait]
impl StackDeployer for BlueGreenDeployer {
    fn stack_name(&self) -> &str {
        &self.stack.stack
    }

    async fn check_previous(&self, _config: &RunConfig) -> Result<(), DeployerError> {
        let prefix = self.prefix();
        let mut previous: Vec<String> = self
            .provider
            .live_groups(&self.region, &prefix)
            .await?
            .into_iter()
            .filter(|g| parse_version(&prefix, &g.name).is_some())
            .map(|g| g.name)
            .collect();
        previous.sort();

        tracing::debug!(stack = %self.stack.stack, ?previous, "previous versions");
        self.state.lock().previous = previous;
        Ok(())
    }

    async fn deploy(&self, config: &RunConfig) -> Result<(), DeployerError> {
        let prefix = self.prefix();
        let name = next_group_name(&prefix, &self.previous_versions()).ok_or_else(|| {
            DeployerError::MissingState {
                step: "deploy",
                stack: self.stack.stack.clone(),
                reason: "every version name is in use".to_string(),
            }
        })?;
        let mut tags = self.stack.tags.clone();
        tags.insert("app".to_string(), self.application.clone());
        tags.insert("stack".to_string(), self.stack.stack.clone());

        let request = GroupRequest {
            name: name.clone(),
            stack: self.stack.stack.clone(),
            capacity: self.capacity_for(config),
            tags,
        };
        self.provider.create_group(&self.region, &request).await?;

        tracing::info!(stack = %self.stack.stack, group = %name, capacity = %request.capacity, "new group created");
        self.state.lock().deployed = Some(name);
        Ok(())
    }

    fn skip_deploy_step(&self) {
        tracing::debug!(stack = %self.stack.stack, "deploy step skipped");
        self.state.lock().skipped = true;
    }

    async fn finish_additional_work(&self, _config: &RunConfig) -> Result<(), DeployerError> {
        let group = self.deployed_or("StepFinishAdditionalWork")?;
        if self.stack.scaling_policies.is_empty() {
            return Ok(());
        }
        self.provider
            .attach_scaling_policies(&self.region, &group, &self.stack.scaling_policies)
            .await?;
        tracing::info!(stack = %self.stack.stack, %group, "scaling policies attached");
        Ok(())
    }

    async fn trigger_lifecycle_callbacks(&self, _config: &RunConfig) -> Result<(), DeployerError> {
        for group in self.previous_versions() {
            for command in &self.stack.lifecycle_callbacks {
                self.provider
                    .run_lifecycle_callback(&self.region, &group, command)
                    .await?;
                tracing::debug!(stack = %self.stack.stack, %group, %command, "lifecycle callback done");
            }
        }
        Ok(())
    }

    async fn clean_previous_version(&self, _config: &RunConfig) -> Result<(), DeployerError> {
        let (previous, skipped) = {
            let state = self.state.lock();
            (state.previous.clone(), state.skipped)
        };
        if previous.is_empty() {
            tracing::info!(stack = %self.stack.stack, "no previous version to clean");
            return Ok(());
        }
        if skipped {
            tracing::info!(stack = %self.stack.stack, count = previous.len(), "removing every live version");
        }
        for group in previous {
            self.provider.delete_group(&self.region, &group).await?;
            tracing::info!(stack = %self.stack.stack, %group, "previous version deleted");
        }
        Ok(())
    }

    async fn gather_metrics(&self, _config: &RunConfig) -> Result<(), DeployerError> {
        let deployed = self.deployed_group();
        let described = match &deployed {
            Some(name) => self.provider.describe_group(&self.region, name).await?,
            None => None,
        };
        let metrics = DeploymentMetrics {
            application: self.application.clone(),
            stack: self.stack.stack.clone(),
            region: self.region.clone(),
            deployed_group: deployed,
            previous_groups: self.previous_versions(),
            capacity: described.as_ref().map(|g| g.capacity),
            healthy_count: described.as_ref().map(|g| g.healthy_count),
        };
        self.collector.record(&metrics).await?;
        Ok(())
    }

    async fn run_api_test(&self, _config: &RunConfig) -> Result<(), DeployerError> {
        if !self.stack.api_test_enabled {
            return Ok(());
        }
        let Some(template) = &self.api_test else {
            return Err(DeployerError::ApiTest {
                stack: self.stack.stack.clone(),
                reason: format!(
                    "template {} not found",
                    self.stack.api_test_template.as_deref().unwrap_or("<unnamed>")
                ),
            });
        };
        let group = self.deployed_or("StepRunApiTest")?;
        self.provider
            .run_api_test(&self.region, &group, template)
            .await
            .map_err(|e| DeployerError::ApiTest {
                stack: self.stack.stack.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(stack = %self.stack.stack, template = %template.name, "api test passed");
        Ok(())
    }

    async fn health_checking(&self, config: &RunConfig) -> ProbeReport {
        let name = &self.stack.stack;
        let target = config.target_group.clone().or_else(|| self.deployed_group());
        let Some(group) = target else {
            return ProbeReport::unrecoverable(name, "no deployed group to check");
        };

        match self.provider.describe_group(&self.region, &group).await {
            Ok(Some(g)) => {
                let met = if config.downsizing_update {
                    g.healthy_count == g.capacity.desired
                } else {
                    g.healthy_count >= g.capacity.desired
                };
                tracing::debug!(stack = %name, %group, healthy = g.healthy_count, desired = g.capacity.desired, met, "health probe");
                ProbeReport::status(name, met)
            }
            Ok(None) => ProbeReport::status(name, false),
            Err(e) => ProbeReport::unrecoverable(name, e.to_string()),
        }
    }

    async fn terminate_checking(&self, _config: &RunConfig) -> ProbeReport {
        let name = &self.stack.stack;
        for group in self.previous_versions() {
            match self.provider.describe_group(&self.region, &group).await {
                Ok(Some(_)) => {
                    tracing::debug!(stack = %name, %group, "previous version still terminating");
                    return ProbeReport::status(name, false);
                }
                Ok(None) => {}
                Err(e) => return ProbeReport::unrecoverable(name, e.to_string()),
            }
        }
        ProbeReport::status(name, true)
    }
}

/// Builds [`BlueGreenDeployer`]s for a manifest
pub struct BlueGreenFactory {
    application: String,
    api_test_templates: Vec<ApiTestTemplate>,
    provider: Arc<dyn CloudProvider>,
    collector: Arc<dyn MetricsCollector>,
}

impl BlueGreenFactory {
    /// Create factory
    #[must_use]
    pub fn new(
        application: impl Into<String>,
        provider: Arc<dyn CloudProvider>,
        collector: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            application: application.into(),
            api_test_templates: Vec::new(),
            provider,
            collector,
        }
    }

    /// With API test templates
    #[inline]
    #[must_use]
    pub fn with_api_test_templates(mut self, templates: Vec<ApiTestTemplate>) -> Self {
        self.api_test_templates = templates;
        self
    }
}

impl DeployerFactory for BlueGreenFactory {
    fn build(&self, stack: &Stack, config: &RunConfig) -> Arc<dyn StackDeployer> {
        let api_test = if stack.api_test_enabled {
            self.api_test_templates
                .iter()
                .find(|t| Some(&t.name) == stack.api_test_template.as_ref())
                .cloned()
        } else {
            None
        };

        Arc::new(BlueGreenDeployer::new(
            self.application.clone(),
            stack.clone(),
            config.region.clone(),
            api_test,
            Arc::clone(&self.provider),
            Arc::clone(&self.collector),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_name_starts_at_zero() {
        assert_eq!(
            next_group_name("hello-artd_v", &[]).as_deref(),
            Some("hello-artd_v000")
        );
    }

    #[test]
    fn next_name_follows_highest_version() {
        let previous = vec![
            "hello-artd_v003".to_string(),
            "hello-artd_v011".to_string(),
            "hello-artd_vx".to_string(),
        ];
        assert_eq!(
            next_group_name("hello-artd_v", &previous).as_deref(),
            Some("hello-artd_v012")
        );
    }

    #[test]
    fn next_name_wraps() {
        let previous = vec!["hello-artd_v999".to_string()];
        assert_eq!(
            next_group_name("hello-artd_v", &previous).as_deref(),
            Some("hello-artd_v000")
        );
    }

    #[test]
    fn next_name_after_wrap_skips_live_versions() {
        let previous = vec!["hello-artd_v000".to_string(), "hello-artd_v999".to_string()];
        assert_eq!(
            next_group_name("hello-artd_v", &previous).as_deref(),
            Some("hello-artd_v001")
        );

        let previous = vec![
            "hello-artd_v001".to_string(),
            "hello-artd_v998".to_string(),
            "hello-artd_v999".to_string(),
        ];
        assert_eq!(
            next_group_name("hello-artd_v", &previous).as_deref(),
            Some("hello-artd_v002")
        );
    }

    #[test]
    fn next_name_is_none_when_every_version_is_live() {
        let previous: Vec<String> = (0..1000).map(|v| format!("hello-artd_v{v:03}")).collect();
        assert_eq!(next_group_name("hello-artd_v", &previous), None);
    }

    #[test]
    fn version_parsing_ignores_other_stacks() {
        assert_eq!(parse_version("hello-artd_v", "hello-artd_v007"), Some(7));
        assert_eq!(parse_version("hello-artd_v", "hello-gpu_v007"), None);
    }
}
