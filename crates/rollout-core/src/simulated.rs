//! In-memory cloud
//!
//! Implements [`CloudProvider`] and [`Inspector`] without a cloud account.
//! Groups converge one instance per describe call and disappear one
//! describe after deletion, so convergence polling behaves as it does
//! against an eventually consistent API. State can be saved to a JSON
//! file so separate invocations see the same groups.

use crate::blue_green::{CloudProvider, GroupRequest};
use crate::collaborators::{GroupHandle, Inspector, UpdateFields};
use crate::error::CollaboratorError;
use crate::types::{ApiTestTemplate, GroupDescriptor, Stack};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimGroup {
    descriptor: GroupDescriptor,
    /// Describe calls left before a deleted group is gone
    terminating: Option<u32>,
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    callbacks: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    groups: BTreeMap<String, SimGroup>,
}

/// Simulated autoscaling API
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    /// Empty cloud
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load state saved by [`SimulatedCloud::save`]; a missing file is an empty cloud
    ///
    /// # Errors
    /// Unreadable or unparsable state file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CollaboratorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| CollaboratorError::Api(format!("{}: {e}", path.display())))?;
        let state: SimState = serde_json::from_str(&text)
            .map_err(|e| CollaboratorError::Api(format!("{}: {e}", path.display())))?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Write state as JSON
    ///
    /// # Errors
    /// Unwritable state file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CollaboratorError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&*self.state.lock())
            .map_err(|e| CollaboratorError::Api(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| CollaboratorError::Api(format!("{}: {e}", path.display())))
    }

    /// Names of groups that still exist, including terminating ones
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.state.lock().groups.keys().cloned().collect()
    }

    /// Current view of a group without advancing it
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<GroupDescriptor> {
        self.state
            .lock()
            .groups
            .get(name)
            .map(|g| g.descriptor.clone())
    }

    /// Lifecycle callbacks run against a group
    #[must_use]
    pub fn callbacks(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .groups
            .get(name)
            .map(|g| g.callbacks.clone())
            .unwrap_or_default()
    }

    /// Insert a group that is already fully healthy
    pub fn seed(&self, descriptor: GroupDescriptor) {
        self.state.lock().groups.insert(
            descriptor.name.clone(),
            SimGroup {
                descriptor,
                terminating: None,
                policies: Vec::new(),
                callbacks: Vec::new(),
            },
        );
    }
}

fn not_found(name: &str) -> CollaboratorError {
    CollaboratorError::NotFound(format!("group {name}"))
}

#[async_trait::async_trait]
impl CloudProvider for SimulatedCloud {
    async fn live_groups(
        &self,
        region: &str,
        prefix: &str,
    ) -> Result<Vec<GroupDescriptor>, CollaboratorError> {
        Ok(self
            .state
            .lock()
            .groups
            .values()
            .filter(|g| g.terminating.is_none())
            .filter(|g| g.descriptor.region == region && g.descriptor.name.starts_with(prefix))
            .map(|g| g.descriptor.clone())
            .collect())
    }

    async fn create_group(
        &self,
        region: &str,
        request: &GroupRequest,
    ) -> Result<GroupDescriptor, CollaboratorError> {
        if !request.capacity.is_consistent() {
            return Err(CollaboratorError::Api(format!(
                "invalid capacity for {}: {}",
                request.name, request.capacity
            )));
        }
        let mut state = self.state.lock();
        if state.groups.contains_key(&request.name) {
            return Err(CollaboratorError::Api(format!(
                "group {} already exists",
                request.name
            )));
        }
        let descriptor = GroupDescriptor {
            name: request.name.clone(),
            region: region.to_string(),
            stack: request.stack.clone(),
            capacity: request.capacity,
            instance_count: 0,
            healthy_count: 0,
            created_at: Utc::now(),
            tags: request.tags.clone(),
        };
        state.groups.insert(
            request.name.clone(),
            SimGroup {
                descriptor: descriptor.clone(),
                terminating: None,
                policies: Vec::new(),
                callbacks: Vec::new(),
            },
        );
        Ok(descriptor)
    }

    async fn describe_group(
        &self,
        _region: &str,
        name: &str,
    ) -> Result<Option<GroupDescriptor>, CollaboratorError> {
        let mut state = self.state.lock();
        let Some(group) = state.groups.get_mut(name) else {
            return Ok(None);
        };

        match group.terminating {
            Some(0) => {
                state.groups.remove(name);
                return Ok(None);
            }
            Some(left) => group.terminating = Some(left - 1),
            None => {
                let d = &mut group.descriptor;
                d.instance_count += (d.capacity.desired - d.instance_count).signum();
                d.healthy_count = d.instance_count;
            }
        }
        Ok(Some(group.descriptor.clone()))
    }

    async fn delete_group(&self, _region: &str, name: &str) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        let group = state.groups.get_mut(name).ok_or_else(|| not_found(name))?;
        group.terminating.get_or_insert(1);
        Ok(())
    }

    async fn attach_scaling_policies(
        &self,
        _region: &str,
        name: &str,
        policies: &[String],
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        let group = state.groups.get_mut(name).ok_or_else(|| not_found(name))?;
        group.policies.extend(policies.iter().cloned());
        Ok(())
    }

    async fn run_lifecycle_callback(
        &self,
        _region: &str,
        name: &str,
        command: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        let group = state.groups.get_mut(name).ok_or_else(|| not_found(name))?;
        group.callbacks.push(command.to_string());
        Ok(())
    }

    async fn run_api_test(
        &self,
        _region: &str,
        name: &str,
        template: &ApiTestTemplate,
    ) -> Result<(), CollaboratorError> {
        let state = self.state.lock();
        let group = state.groups.get(name).ok_or_else(|| not_found(name))?;
        if group.descriptor.healthy_count == 0 {
            return Err(CollaboratorError::Api(format!(
                "{}: no healthy instance to test {}",
                template.name, name
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Inspector for SimulatedCloud {
    async fn select_stack(&self, application: &str) -> Result<GroupHandle, CollaboratorError> {
        let prefix = format!("{application}-");
        self.state
            .lock()
            .groups
            .values()
            .filter(|g| g.terminating.is_none() && g.descriptor.name.starts_with(&prefix))
            .max_by(|a, b| {
                (a.descriptor.created_at, &a.descriptor.name)
                    .cmp(&(b.descriptor.created_at, &b.descriptor.name))
            })
            .map(|g| GroupHandle(g.descriptor.name.clone()))
            .ok_or_else(|| CollaboratorError::NotFound(format!("no live group for {application}")))
    }

    async fn get_stack_information(
        &self,
        handle: &GroupHandle,
    ) -> Result<GroupDescriptor, CollaboratorError> {
        self.snapshot(&handle.0).ok_or_else(|| not_found(&handle.0))
    }

    async fn update(&self, fields: &UpdateFields) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .get_mut(&fields.group_name)
            .ok_or_else(|| not_found(&fields.group_name))?;
        group.descriptor.capacity = fields.capacity;
        Ok(())
    }

    fn generate_stack(&self, region: &str, group: &GroupDescriptor) -> Stack {
        let region = if group.region.is_empty() {
            region
        } else {
            &group.region
        };
        let mut stack = Stack::new(group.stack.clone(), region, group.capacity);
        stack.tags = group.tags.clone();
        stack
    }
}
