//! Capacity update planner
//!
//! Resizes a live group in place: read the current bounds, merge the
//! operator overrides, validate, confirm, apply, then reuse health
//! convergence on a single synthetic stack to confirm the resize landed.

use crate::collaborators::UpdateFields;
use crate::error::{RunError, ValidationError};
use crate::runner::{names, RunReport, Runner};
use crate::types::{Capacity, RunConfig};
use std::io::Write;
use std::sync::Arc;

/// Override if present and non-negative, else `origin`
#[inline]
#[must_use]
pub fn null_check(input: Option<i64>, origin: i64) -> i64 {
    match input {
        Some(value) if value >= 0 => value,
        _ => origin,
    }
}

/// New bounds from `old` and the overrides in `config`
#[must_use]
pub fn plan_capacity(old: Capacity, config: &RunConfig) -> Capacity {
    Capacity::new(
        null_check(config.min, old.min),
        null_check(config.max, old.max),
        null_check(config.desired, old.desired),
    )
}

/// Check `min <= max`, `min <= desired` and `desired <= max` in that order
///
/// # Errors
/// The first violated bound as a `ValidationError`
pub fn check_capacity_bounds(capacity: Capacity) -> Result<(), ValidationError> {
    if capacity.min > capacity.max {
        return Err(ValidationError::MinAboveMax);
    }
    if capacity.min > capacity.desired {
        return Err(ValidationError::MinAboveDesired);
    }
    if capacity.desired > capacity.max {
        return Err(ValidationError::DesiredAboveMax);
    }
    Ok(())
}

/// Validate a resize, reporting the first violated rule
///
/// Rules in order: the bounds of [`check_capacity_bounds`], then the new
/// bounds must differ from the old ones.
///
/// # Errors
/// The first violated rule as a `ValidationError`
pub fn check_update_information(old: Capacity, new: Capacity) -> Result<(), ValidationError> {
    check_capacity_bounds(new)?;
    if old == new {
        return Err(ValidationError::NothingUpdated);
    }
    Ok(())
}

/// Desired capacity shrinks
#[inline]
#[must_use]
pub fn is_downsizing(old: Capacity, new: Capacity) -> bool {
    old.desired > new.desired
}

impl Runner {
    /// Main flow of `update`
    ///
    /// # Errors
    /// Inspector failures, validation errors, decline, and health
    /// convergence failures of the resized group.
    pub async fn update(&mut self) -> Result<RunReport, RunError> {
        let inspector = self.inspector()?;

        let handle = inspector.select_stack(&self.config.application).await?;
        let group = inspector.get_stack_information(&handle).await?;

        let old = group.capacity;
        let new = plan_capacity(old, &self.config);
        check_update_information(old, new)?;

        writeln!(self.out, "[ AS IS ]")?;
        writeln!(self.out, "{old}")?;
        writeln!(self.out, "[ TO BE ]")?;
        writeln!(self.out, "{new}")?;
        self.out.flush()?;

        self.local_check("Do you really want to update? ")?;

        let downsizing = is_downsizing(old, new);
        if downsizing {
            tracing::debug!("downsizing operation is triggered");
        }

        let fields = UpdateFields {
            group_name: group.name.clone(),
            capacity: new,
        };
        tracing::debug!(group = %fields.group_name, "start updating configuration");
        inspector.update(&fields).await?;
        tracing::debug!("update configuration is triggered");

        let stack = inspector.generate_stack(&self.config.region, &group);
        self.config.downsizing_update = downsizing;
        self.config.target_group = Some(fields.group_name);
        self.config.force_manifest_capacity = false;

        tracing::debug!(stack = %stack.stack, "create deployer for update");
        let deployers = vec![self.factory.build(&stack, &self.config)];
        let config = Arc::new(self.config.clone());

        let health = self.poller.wait_healthy(&deployers, config).await?;
        tracing::info!("update operation is finished");

        Ok(RunReport {
            deployers: names(&deployers),
            health: Some(health),
            ..RunReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_check_prefers_non_negative_override() {
        assert_eq!(null_check(Some(3), 1), 3);
        assert_eq!(null_check(Some(0), 1), 0);
        assert_eq!(null_check(Some(-1), 1), 1);
        assert_eq!(null_check(None, 1), 1);
    }

    #[test]
    fn plan_merges_overrides() {
        let old = Capacity::new(1, 4, 2);
        let config = RunConfig::default().with_capacity_overrides(None, Some(8), Some(5));
        assert_eq!(plan_capacity(old, &config), Capacity::new(1, 8, 5));
    }

    #[test]
    fn rules_fire_in_order() {
        let old = Capacity::new(1, 4, 2);
        // Violates every rule; the first one wins.
        assert_eq!(
            check_update_information(old, Capacity::new(5, 3, 4)),
            Err(ValidationError::MinAboveMax)
        );
        assert_eq!(
            check_update_information(old, Capacity::new(3, 5, 2)),
            Err(ValidationError::MinAboveDesired)
        );
        assert_eq!(
            check_update_information(old, Capacity::new(1, 3, 4)),
            Err(ValidationError::DesiredAboveMax)
        );
        assert_eq!(
            check_update_information(old, old),
            Err(ValidationError::NothingUpdated)
        );
        assert_eq!(check_update_information(old, Capacity::new(1, 4, 3)), Ok(()));
    }

    #[test]
    fn bounds_ignore_the_live_capacity() {
        assert_eq!(check_capacity_bounds(Capacity::new(1, 4, 2)), Ok(()));
        assert_eq!(check_capacity_bounds(Capacity::new(0, 0, 0)), Ok(()));
        assert_eq!(
            check_capacity_bounds(Capacity::new(0, 2, 3)),
            Err(ValidationError::DesiredAboveMax)
        );
    }

    #[test]
    fn downsizing_detection() {
        assert!(is_downsizing(Capacity::new(1, 4, 3), Capacity::new(1, 4, 2)));
        assert!(!is_downsizing(Capacity::new(1, 4, 2), Capacity::new(1, 4, 2)));
        assert!(!is_downsizing(Capacity::new(1, 4, 2), Capacity::new(1, 4, 3)));
    }
}
