//! Rollout Core - concurrent blue/green stack deployment
//!
//! The engine behind the `rollout` command:
//! - Builds one deployer per in-scope stack of an application
//! - Runs lifecycle phases concurrently across stacks with a barrier between phases
//! - Polls health and termination until every stack converges
//! - Resizes and inspects the live group in place
//!
//! # Example
//!
//! ```rust,ignore
//! use rollout_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manifest = Manifest::load("rollout.yaml")?;
//! let cloud = Arc::new(SimulatedCloud::new());
//! let factory = BlueGreenFactory::new(&manifest.name, cloud.clone(), Arc::new(LogCollector));
//!
//! let config = RunConfig::new(&manifest.name).with_auto_apply(true);
//! let mut runner = Runner::new(config, manifest.stacks, Arc::new(factory));
//! let report = runner.run(Mode::Deploy).await?;
//!
//! println!("{} step failures", report.failure_count());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Engine
pub mod clock;
pub mod deployer;
pub mod dispatch;
pub mod poller;
pub mod runner;

// Modes
pub mod status;
pub mod update;

// Providers and collaborators
pub mod blue_green;
pub mod collaborators;
pub mod simulated;

// Data
pub mod error;
pub mod manifest;
pub mod types;

// Re-exports
pub use blue_green::{BlueGreenDeployer, BlueGreenFactory, CloudProvider, GroupRequest};
pub use clock::{Clock, SystemClock};
pub use collaborators::{
    DeploymentMetrics, GroupHandle, Inspector, LogCollector, LogNotifier, MetricsCollector,
    NonInteractive, Notifier, Prompt, UpdateFields,
};
pub use deployer::{DeployerFactory, ProbeReport, StackDeployer, Step, ERROR_SENTINEL};
pub use dispatch::Mode;
pub use error::{CollaboratorError, DeployerError, RunError, ValidationError};
pub use manifest::Manifest;
pub use poller::{Convergence, ConvergencePoller, Target};
pub use runner::{run_phase, Phase, PhaseReport, RunReport, Runner, StepFailure};
pub use simulated::SimulatedCloud;
pub use status::StatusSummary;
pub use types::{
    ApiTestRequest, ApiTestTemplate, Capacity, GroupDescriptor, ReplacementType, RunConfig, Stack,
    DEFAULT_POLLING_INTERVAL, DEFAULT_TIMEOUT,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a rollout
    pub use crate::{
        BlueGreenFactory, Capacity, DeployerFactory, LogCollector, LogNotifier, Manifest, Mode,
        RunConfig, RunError, RunReport, Runner, SimulatedCloud, Stack, StackDeployer,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
