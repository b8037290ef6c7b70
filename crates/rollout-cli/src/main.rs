//! `rollout` command line
//!
//! Wires a manifest, the simulated cloud and the log-only collaborators
//! into a [`Runner`] and runs one mode. Exit code is 0 on success and 1 on
//! any run error or panic.

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rollout_core::{
    BlueGreenFactory, LogCollector, LogNotifier, Manifest, Mode, Prompt, RunConfig, Runner,
    SimulatedCloud,
};
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_STATE_FILE: &str = ".rollout-state.json";

fn cli() -> Command {
    Command::new("rollout")
        .version(rollout_core::VERSION)
        .about("Concurrent blue/green deployment of declared stacks")
        .arg(
            Arg::new("mode")
                .required(true)
                .help("One of deploy, delete, status, update"),
        )
        .arg(
            Arg::new("manifest")
                .long("manifest")
                .short('m')
                .value_parser(value_parser!(PathBuf))
                .help("Stack manifest (deploy and delete)"),
        )
        .arg(
            Arg::new("application")
                .long("application")
                .short('a')
                .help("Application name (status and update)"),
        )
        .arg(
            Arg::new("stack")
                .long("stack")
                .short('s')
                .help("Only act on this stack"),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .default_value("us-east-1")
                .help("Region used when a stack does not name one"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value("60")
                .value_parser(value_parser!(u64))
                .help("Health convergence timeout in minutes"),
        )
        .arg(
            Arg::new("polling-interval")
                .long("polling-interval")
                .default_value("60")
                .value_parser(value_parser!(u64))
                .help("Seconds between convergence rounds"),
        )
        .arg(
            Arg::new("min")
                .long("min")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .help("Minimum capacity override"),
        )
        .arg(
            Arg::new("max")
                .long("max")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .help("Maximum capacity override"),
        )
        .arg(
            Arg::new("desired")
                .long("desired")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .help("Desired capacity override"),
        )
        .arg(
            Arg::new("auto-apply")
                .long("auto-apply")
                .action(ArgAction::SetTrue)
                .help("Skip the confirmation prompt"),
        )
        .arg(
            Arg::new("notifications-off")
                .long("notifications-off")
                .action(ArgAction::SetTrue)
                .help("Do not send notifications"),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Skip the metrics storage check and metrics gathering"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print status as JSON"),
        )
        .arg(
            Arg::new("state")
                .long("state")
                .default_value(DEFAULT_STATE_FILE)
                .value_parser(value_parser!(PathBuf))
                .help("Simulated cloud state file"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Log filter used when RUST_LOG is not set"),
        )
}

/// Confirmation on the controlling terminal
struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn confirm(&self, message: &str) -> bool {
        let mut stdout = std::io::stdout();
        if write!(stdout, "{message}[y/N] ")
            .and_then(|()| stdout.flush())
            .is_err()
        {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_config(args: &ArgMatches, application: String) -> RunConfig {
    let mut config = RunConfig::new(application)
        .with_timeout(Duration::from_secs(
            args.get_one::<u64>("timeout")
                .copied()
                .unwrap_or(60)
                .saturating_mul(60),
        ))
        .with_polling_interval(Duration::from_secs(
            args.get_one::<u64>("polling-interval")
                .copied()
                .unwrap_or(60),
        ))
        .with_capacity_overrides(
            args.get_one::<i64>("min").copied(),
            args.get_one::<i64>("max").copied(),
            args.get_one::<i64>("desired").copied(),
        )
        .with_auto_apply(args.get_flag("auto-apply"))
        .with_notifications_off(args.get_flag("notifications-off"))
        .with_metrics(!args.get_flag("disable-metrics"));

    if let Some(region) = args.get_one::<String>("region") {
        config = config.with_region(region);
    }
    if let Some(stack) = args.get_one::<String>("stack") {
        config = config.with_stack_filter(stack);
    }
    config.json_output = args.get_flag("json");
    config
}

async fn execute(args: ArgMatches) -> Result<()> {
    let mode: Mode = args
        .get_one::<String>("mode")
        .context("mode is required")?
        .parse()?;

    let state = args
        .get_one::<PathBuf>("state")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    let cloud = Arc::new(SimulatedCloud::load(&state)?);

    let manifest = if mode.requires_manifest() {
        let path = args
            .get_one::<PathBuf>("manifest")
            .with_context(|| format!("--manifest is required for {mode}"))?;
        Some(Manifest::load(path)?)
    } else {
        None
    };
    let application = match (&manifest, args.get_one::<String>("application")) {
        (Some(manifest), _) => manifest.name.clone(),
        (None, Some(application)) => application.clone(),
        (None, None) => bail!("--application is required for {mode}"),
    };
    let (stacks, templates) = manifest
        .map(|m| (m.stacks, m.api_test_templates))
        .unwrap_or_default();

    let config = run_config(&args, application.clone());
    let notify = !config.notifications_off;
    let factory = BlueGreenFactory::new(application, cloud.clone(), Arc::new(LogCollector))
        .with_api_test_templates(templates);

    let mut runner = Runner::new(config, stacks, Arc::new(factory))
        .with_inspector(cloud.clone())
        .with_notifier(Arc::new(LogNotifier::new(notify)))
        .with_prompt(Arc::new(TerminalPrompt));

    let outcome = tokio::spawn(async move { runner.run(mode).await }).await;

    if mode.is_mutating() {
        cloud
            .save(&state)
            .with_context(|| format!("saving {}", state.display()))?;
    }

    match outcome {
        Ok(Ok(report)) => {
            let failures = report.failure_count();
            if failures > 0 {
                tracing::warn!(failures, "{} finished with step failures", mode);
            } else {
                tracing::info!("{} finished", mode);
            }
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) if e.is_panic() => bail!("{mode} panicked"),
        Err(e) => Err(e).context("run task was cancelled"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli().get_matches();
    init_tracing(
        args.get_one::<String>("log-level")
            .map_or("info", String::as_str),
    );

    match execute(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r"
name: hello
stacks:
  - stack: artd
    region: us-east-1
    capacity: { min: 1, max: 3, desired: 2 }
";

    fn args(extra: &[&str]) -> ArgMatches {
        let mut argv = vec!["rollout"];
        argv.extend_from_slice(extra);
        cli().try_get_matches_from(argv).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn flags_map_onto_run_config() {
        let config = run_config(
            &args(&[
                "update",
                "--timeout",
                "5",
                "--polling-interval",
                "2",
                "--desired",
                "4",
                "--min",
                "-1",
                "--stack",
                "artd",
                "--auto-apply",
                "--disable-metrics",
                "--json",
            ]),
            "hello".to_string(),
        );
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.polling_interval, Duration::from_secs(2));
        assert_eq!(config.desired, Some(4));
        assert_eq!(config.min, Some(-1));
        assert_eq!(config.max, None);
        assert_eq!(config.stack.as_deref(), Some("artd"));
        assert!(config.auto_apply);
        assert!(!config.metrics_enabled);
        assert!(config.json_output);
    }

    #[test]
    fn huge_timeout_saturates() {
        let max = u64::MAX.to_string();
        let config = run_config(
            &args(&["deploy", "--timeout", max.as_str()]),
            "hello".to_string(),
        );
        assert_eq!(config.timeout, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn yes_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }

    #[tokio::test]
    async fn unknown_mode_fails() {
        let err = execute(args(&["rollback"])).await.unwrap_err();
        assert_eq!(err.to_string(), "no function exists to run for rollback");
    }

    #[tokio::test]
    async fn deploy_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let err = execute(args(&["deploy", "--state", state.to_str().unwrap()]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--manifest is required"));
    }

    #[tokio::test]
    async fn deploy_status_delete_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("rollout.yaml");
        std::fs::write(&manifest, MANIFEST).unwrap();
        let state = dir.path().join("state.json");
        let manifest = manifest.to_str().unwrap();
        let state_arg = state.to_str().unwrap();
        let common = ["--state", state_arg, "--auto-apply", "--polling-interval", "0"];

        let mut deploy = vec!["deploy", "--manifest", manifest];
        deploy.extend_from_slice(&common);
        execute(args(&deploy)).await.unwrap();
        assert_eq!(
            SimulatedCloud::load(&state).unwrap().group_names(),
            vec!["hello-artd_v000"]
        );

        let mut status = vec!["status", "--application", "hello"];
        status.extend_from_slice(&common);
        execute(args(&status)).await.unwrap();

        let mut delete = vec!["delete", "--manifest", manifest];
        delete.extend_from_slice(&common);
        execute(args(&delete)).await.unwrap();
        assert!(SimulatedCloud::load(&state)
            .unwrap()
            .group_names()
            .is_empty());
    }
}
