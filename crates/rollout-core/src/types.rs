//! Core types for the rollout engine
//!
//! Defines:
//! - Stacks and their capacity bounds
//! - API test templates referenced by stacks
//! - Live group descriptors as reported by the cloud
//! - The per-invocation run configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Default health convergence timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default sleep between convergence rounds
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

/// Autoscaling bounds of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capacity {
    /// Minimum instance count
    pub min: i64,
    /// Maximum instance count
    pub max: i64,
    /// Desired instance count
    pub desired: i64,
}

impl Capacity {
    /// Create new capacity
    #[inline]
    #[must_use]
    pub fn new(min: i64, max: i64, desired: i64) -> Self {
        Self { min, max, desired }
    }

    /// Check `min <= desired <= max`
    #[inline]
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.min <= self.desired && self.desired <= self.max
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Min: {}, Desired: {}, Max: {}",
            self.min, self.desired, self.max
        )
    }
}

/// How a stack replaces its running version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementType {
    /// New group next to the old one, old one removed after cutover
    #[default]
    BlueGreen,
}

/// Declared deployment unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    /// Stack identifier, unique within a manifest
    pub stack: String,
    /// Replacement strategy
    #[serde(default)]
    pub replacement_type: ReplacementType,
    /// Region the stack lives in
    pub region: String,
    /// Autoscaling bounds
    pub capacity: Capacity,
    /// Whether acceptance tests run after deployment
    #[serde(default)]
    pub api_test_enabled: bool,
    /// Name of the API test template to run
    #[serde(default)]
    pub api_test_template: Option<String>,
    /// Commands run against previous versions before they are terminated
    #[serde(default)]
    pub lifecycle_callbacks: Vec<String>,
    /// Scaling policies attached once the new version is healthy
    #[serde(default)]
    pub scaling_policies: Vec<String>,
    /// Tags propagated to created groups
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Stack {
    /// Create a blue/green stack with no optional features
    #[must_use]
    pub fn new(stack: impl Into<String>, region: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            stack: stack.into(),
            replacement_type: ReplacementType::BlueGreen,
            region: region.into(),
            capacity,
            api_test_enabled: false,
            api_test_template: None,
            lifecycle_callbacks: Vec::new(),
            scaling_policies: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Enable API tests with the named template
    #[inline]
    #[must_use]
    pub fn with_api_test(mut self, template: impl Into<String>) -> Self {
        self.api_test_enabled = true;
        self.api_test_template = Some(template.into());
        self
    }

    /// Add a lifecycle callback
    #[inline]
    #[must_use]
    pub fn with_lifecycle_callback(mut self, command: impl Into<String>) -> Self {
        self.lifecycle_callbacks.push(command.into());
        self
    }

    /// Add a scaling policy
    #[inline]
    #[must_use]
    pub fn with_scaling_policy(mut self, policy: impl Into<String>) -> Self {
        self.scaling_policies.push(policy.into());
        self
    }
}

/// One request issued by an API test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTestRequest {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Path relative to the group endpoint
    pub path: String,
    /// Expected status code
    #[serde(default = "default_status")]
    pub expected_status: u16,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

/// Named acceptance test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTestTemplate {
    /// Template name referenced by stacks
    pub name: String,
    /// Requests to issue
    #[serde(default)]
    pub requests: Vec<ApiTestRequest>,
}

/// Live autoscaling group as reported by the cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    /// Group name, `{application}-{stack}_v{NNN}`
    pub name: String,
    /// Region
    pub region: String,
    /// Stack the group was created for
    pub stack: String,
    /// Autoscaling bounds
    pub capacity: Capacity,
    /// Instances currently running
    pub instance_count: i64,
    /// Instances reporting healthy
    pub healthy_count: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Group tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Parameters for one invocation
///
/// Created once at start and read-only afterwards, apart from the
/// update flow recording downsizing and its target group.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Application name
    pub application: String,
    /// Restrict the run to one declared stack
    pub stack: Option<String>,
    /// Default region
    pub region: String,
    /// Invocation start
    pub start_timestamp: DateTime<Utc>,
    /// Health convergence deadline
    pub timeout: Duration,
    /// Sleep between convergence rounds
    pub polling_interval: Duration,
    /// Minimum capacity override
    pub min: Option<i64>,
    /// Maximum capacity override
    pub max: Option<i64>,
    /// Desired capacity override
    pub desired: Option<i64>,
    /// Ignore overrides and use the manifest capacity
    pub force_manifest_capacity: bool,
    /// Skip the confirmation prompt
    pub auto_apply: bool,
    /// Disable notifications for this run
    pub notifications_off: bool,
    /// Check metrics storage and gather metrics
    pub metrics_enabled: bool,
    /// Set by the update flow when desired capacity shrinks
    pub downsizing_update: bool,
    /// Set by the update flow to the group being resized
    pub target_group: Option<String>,
    /// Print status as JSON
    pub json_output: bool,
}

impl RunConfig {
    /// Create configuration for an application
    #[must_use]
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            ..Self::default()
        }
    }

    /// With region
    #[inline]
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// With stack filter
    #[inline]
    #[must_use]
    pub fn with_stack_filter(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// With health timeout
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// With polling interval
    #[inline]
    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// With capacity overrides, `None` keeps the live value
    #[inline]
    #[must_use]
    pub fn with_capacity_overrides(
        mut self,
        min: Option<i64>,
        max: Option<i64>,
        desired: Option<i64>,
    ) -> Self {
        self.min = min;
        self.max = max;
        self.desired = desired;
        self
    }

    /// With auto approve
    #[inline]
    #[must_use]
    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    /// With metrics collection
    #[inline]
    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// With notifications disabled
    #[inline]
    #[must_use]
    pub fn with_notifications_off(mut self, off: bool) -> Self {
        self.notifications_off = off;
        self
    }

    /// Check whether the stack filter admits `stack`
    #[inline]
    #[must_use]
    pub fn selects(&self, stack: &Stack) -> bool {
        self.stack.as_deref().map_or(true, |name| name == stack.stack)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            application: String::new(),
            stack: None,
            region: "us-east-1".to_string(),
            start_timestamp: Utc::now(),
            timeout: DEFAULT_TIMEOUT,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            min: None,
            max: None,
            desired: None,
            force_manifest_capacity: false,
            auto_apply: false,
            notifications_off: false,
            metrics_enabled: false,
            downsizing_update: false,
            target_group: None,
            json_output: false,
        }
    }
}
