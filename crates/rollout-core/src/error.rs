//! Error types for the rollout engine
//!
//! Errors fall into four groups:
//! - Validation errors (bad capacity bounds, no-op update, broken manifest)
//! - Per-stack deployer errors, which are logged and never change the verdict
//! - Convergence errors (health timeout, unrecoverable probe)
//! - Operator decline at the confirmation prompt

use std::path::PathBuf;
use std::time::Duration;

/// Main run error type
///
/// Every variant is fatal to the run that produced it.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Upfront validation failed before any deployer was touched
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Health convergence did not finish within the configured timeout
    #[error("timeout has been exceeded: {timeout_minutes} minutes (elapsed {elapsed_secs}s)")]
    Timeout {
        /// Configured timeout in whole minutes
        timeout_minutes: u64,
        /// Time spent polling when the deadline was detected
        elapsed_secs: u64,
    },

    /// A health probe reported an unrecoverable failure
    #[error("error happened while healthchecking {stack}: {reason}")]
    ProbeFailed {
        /// Stack whose probe failed
        stack: String,
        /// Failure reported by the probe
        reason: String,
    },

    /// Operator declined the confirmation prompt
    #[error("you declined to run command")]
    Declined,

    /// Mode token does not name a known flow
    #[error("no function exists to run for {0}")]
    UnknownMode(String),

    /// Metrics storage is not reachable
    #[error("metrics storage check failed: {0}")]
    MetricsStorage(#[source] CollaboratorError),

    /// Inspector or cloud collaborator failed on the read/update path
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Writing operator output failed
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

impl RunError {
    /// Build a timeout error from the configured timeout and measured elapsed time
    #[must_use]
    pub fn timeout(timeout: Duration, elapsed: Duration) -> Self {
        Self::Timeout {
            timeout_minutes: timeout.as_secs().saturating_add(30) / 60,
            elapsed_secs: elapsed.as_secs(),
        }
    }

    /// Check if error was raised before any side effect
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownMode(_))
    }

    /// Check if error came out of a convergence poll
    #[inline]
    #[must_use]
    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ProbeFailed { .. })
    }

    /// Check if the operator asked for the abort
    #[inline]
    #[must_use]
    pub fn is_declined(&self) -> bool {
        matches!(self, Self::Declined)
    }
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// New minimum is above new maximum
    #[error("minimum value cannot be larger than maximum value")]
    MinAboveMax,

    /// New minimum is above new desired
    #[error("desired value cannot be smaller than minimum value")]
    MinAboveDesired,

    /// New desired is above new maximum
    #[error("desired value cannot be larger than max value")]
    DesiredAboveMax,

    /// New capacity equals the live capacity
    #[error("nothing is updated")]
    NothingUpdated,

    /// Merged capacity of one stack breaks its bounds
    #[error("capacity of {stack} is invalid: {reason}")]
    StackCapacity {
        /// Stack name
        stack: String,
        /// Violated bound
        reason: Box<ValidationError>,
    },

    /// Manifest file does not exist
    #[error("manifest not found: {}", .0.display())]
    ManifestNotFound(PathBuf),

    /// Manifest could not be parsed or is inconsistent
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Error reported by a single stack's deployer
///
/// Logged with phase and stack; never aborts a phase.
#[derive(Debug, thiserror::Error)]
pub enum DeployerError {
    /// Cloud provider call failed
    #[error("provider error: {0}")]
    Provider(#[from] CollaboratorError),

    /// Step needs state an earlier step did not produce
    #[error("{step} cannot run for {stack}: {reason}")]
    MissingState {
        /// Step name
        step: &'static str,
        /// Stack name
        stack: String,
        /// What was missing
        reason: String,
    },

    /// Acceptance test failed
    #[error("api test failed for {stack}: {reason}")]
    ApiTest {
        /// Stack name
        stack: String,
        /// Failure description
        reason: String,
    },
}

/// Errors from external collaborators (cloud provider, inspector, notifier, metrics)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Remote resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote API call failed
    #[error("api call failed: {0}")]
    Api(String),

    /// Notification delivery failed
    #[error("notification failed: {0}")]
    Notification(String),

    /// Metrics backend failed
    #[error("metrics backend failed: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_display() {
        let err = RunError::timeout(Duration::from_secs(3600), Duration::from_secs(3661));
        assert_eq!(
            err.to_string(),
            "timeout has been exceeded: 60 minutes (elapsed 3661s)"
        );
    }

    #[test]
    fn timeout_minutes_round_to_nearest() {
        let minutes = |secs| match RunError::timeout(Duration::from_secs(secs), Duration::ZERO) {
            RunError::Timeout { timeout_minutes, .. } => timeout_minutes,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(minutes(0), 0);
        assert_eq!(minutes(89), 1);
        assert_eq!(minutes(90), 2);
        assert_eq!(minutes(u64::MAX), u64::MAX / 60);
    }

    #[test]
    fn stack_capacity_names_the_stack() {
        let err = RunError::from(ValidationError::StackCapacity {
            stack: "gpu".to_string(),
            reason: Box::new(ValidationError::DesiredAboveMax),
        });
        assert_eq!(
            err.to_string(),
            "capacity of gpu is invalid: desired value cannot be larger than max value"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn validation_error_is_transparent() {
        let err = RunError::from(ValidationError::NothingUpdated);
        assert_eq!(err.to_string(), "nothing is updated");
        assert!(err.is_validation());
    }

    #[test]
    fn run_error_classification() {
        assert!(RunError::timeout(Duration::from_secs(60), Duration::ZERO).is_convergence());
        assert!(RunError::ProbeFailed {
            stack: "a".to_string(),
            reason: "boom".to_string(),
        }
        .is_convergence());
        assert!(RunError::Declined.is_declined());
        assert!(RunError::UnknownMode("x".to_string()).is_validation());
        assert!(!RunError::Declined.is_validation());
    }

    #[test]
    fn deployer_error_from_collaborator() {
        let err = DeployerError::from(CollaboratorError::Api("throttled".to_string()));
        assert!(err.to_string().contains("throttled"));
    }
}
