use rollout_core::{
    BlueGreenFactory, Capacity, Manifest, Mode, RunConfig, Runner, SimulatedCloud,
};
use rollout_test_utils::{group, FakeCollector, SharedBuffer, StepClock};
use std::sync::Arc;

const MANIFEST: &str = r"
name: hello
stacks:
  - stack: artd
    region: us-east-1
    capacity: { min: 1, max: 4, desired: 2 }
    lifecycle_callbacks: [drain]
    scaling_policies: [cpu-60]
    api_test_enabled: true
    api_test_template: smoke
  - stack: gpu
    region: us-east-1
    capacity: { min: 0, max: 2, desired: 1 }
api_test_templates:
  - name: smoke
    requests:
      - path: /health
";

struct World {
    manifest: Manifest,
    cloud: Arc<SimulatedCloud>,
    collector: Arc<FakeCollector>,
}

impl World {
    fn new() -> Self {
        Self {
            manifest: Manifest::parse(MANIFEST).unwrap(),
            cloud: Arc::new(SimulatedCloud::new()),
            collector: Arc::new(FakeCollector::new()),
        }
    }

    fn runner(&self, config: RunConfig) -> Runner {
        let factory = BlueGreenFactory::new(
            &self.manifest.name,
            self.cloud.clone(),
            self.collector.clone(),
        )
        .with_api_test_templates(self.manifest.api_test_templates.clone());

        Runner::new(config, self.manifest.stacks.clone(), Arc::new(factory))
            .with_inspector(self.cloud.clone())
            .with_collector(self.collector.clone())
            .with_clock(Arc::new(StepClock::frozen()))
            .with_output(Box::new(SharedBuffer::new()))
    }
}

fn config() -> RunConfig {
    RunConfig::new("hello")
        .with_auto_apply(true)
        .with_metrics(true)
}

#[tokio::test]
async fn test_first_deploy_creates_version_zero() {
    let world = World::new();
    let report = world.runner(config()).run(Mode::Deploy).await.unwrap();

    assert_eq!(report.failure_count(), 0);
    assert_eq!(
        world.cloud.group_names(),
        vec!["hello-artd_v000", "hello-gpu_v000"]
    );
    // artd needs two describe calls to reach two healthy instances.
    assert_eq!(report.health.unwrap().rounds, 2);
    assert_eq!(report.termination.unwrap().rounds, 1);

    let recorded = world.collector.recorded();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|m| m.previous_groups.is_empty()));
}

#[tokio::test]
async fn test_redeploy_replaces_previous_version() {
    let world = World::new();
    world.runner(config()).run(Mode::Deploy).await.unwrap();
    let report = world.runner(config()).run(Mode::Deploy).await.unwrap();

    assert_eq!(report.failure_count(), 0);
    assert_eq!(
        world.cloud.group_names(),
        vec!["hello-artd_v001", "hello-gpu_v001"]
    );
    // Deleted groups linger for one describe before they are gone.
    assert_eq!(report.termination.unwrap().rounds, 2);

    let artd = world
        .collector
        .recorded()
        .into_iter()
        .filter(|m| m.stack == "artd")
        .last()
        .unwrap();
    assert_eq!(artd.deployed_group.as_deref(), Some("hello-artd_v001"));
    assert_eq!(artd.previous_groups, vec!["hello-artd_v000"]);
    assert_eq!(artd.capacity, Some(Capacity::new(1, 4, 2)));
}

#[tokio::test]
async fn test_stack_filter_leaves_other_stacks_alone() {
    let world = World::new();
    world.runner(config()).run(Mode::Deploy).await.unwrap();
    world
        .runner(config().with_stack_filter("gpu"))
        .run(Mode::Deploy)
        .await
        .unwrap();

    assert_eq!(
        world.cloud.group_names(),
        vec!["hello-artd_v000", "hello-gpu_v001"]
    );
}

#[tokio::test]
async fn test_capacity_overrides_apply_to_new_groups() {
    let world = World::new();
    world
        .runner(
            config()
                .with_stack_filter("gpu")
                .with_capacity_overrides(None, Some(3), Some(3)),
        )
        .run(Mode::Deploy)
        .await
        .unwrap();

    let gpu = world.cloud.snapshot("hello-gpu_v000").unwrap();
    assert_eq!(gpu.capacity, Capacity::new(0, 3, 3));
    assert_eq!(gpu.healthy_count, 3);
}

#[tokio::test]
async fn test_update_resizes_live_group() {
    let world = World::new();
    world
        .runner(config().with_stack_filter("artd"))
        .run(Mode::Deploy)
        .await
        .unwrap();

    let report = world
        .runner(config().with_capacity_overrides(None, None, Some(1)))
        .run(Mode::Update)
        .await
        .unwrap();

    assert_eq!(report.deployers, vec!["artd"]);
    let artd = world.cloud.snapshot("hello-artd_v000").unwrap();
    assert_eq!(artd.capacity, Capacity::new(1, 4, 1));
    assert_eq!(artd.healthy_count, 1);
}

#[tokio::test]
async fn test_status_reads_newest_group() {
    let world = World::new();
    world
        .runner(config().with_stack_filter("artd"))
        .run(Mode::Deploy)
        .await
        .unwrap();

    let out = SharedBuffer::new();
    world
        .runner(config())
        .with_output(Box::new(out.clone()))
        .run(Mode::Status)
        .await
        .unwrap();
    assert!(out.contents().contains("Name:       hello-artd_v000"));
}

#[tokio::test]
async fn test_delete_removes_every_version() {
    let world = World::new();
    world.runner(config()).run(Mode::Deploy).await.unwrap();
    let report = world.runner(config()).run(Mode::Delete).await.unwrap();

    assert_eq!(report.failure_count(), 0);
    assert!(world.cloud.group_names().is_empty());
    assert!(report.health.is_none());
}

#[tokio::test]
async fn test_delete_of_nothing_is_a_no_op() {
    let world = World::new();
    let report = world.runner(config()).run(Mode::Delete).await.unwrap();
    assert_eq!(report.failure_count(), 0);
    assert_eq!(report.termination.unwrap().rounds, 1);
}

#[tokio::test]
async fn test_invalid_override_creates_no_group() {
    let world = World::new();
    // desired 3 exceeds gpu's max of 2.
    let err = world
        .runner(config().with_capacity_overrides(None, None, Some(3)))
        .run(Mode::Deploy)
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert!(world.cloud.group_names().is_empty());
    assert!(world.collector.recorded().is_empty());
}

#[tokio::test]
async fn test_deploy_after_version_wrap_picks_unused_name() {
    let world = World::new();
    world
        .cloud
        .seed(group("hello-artd_v999", "artd", Capacity::new(1, 4, 2)));
    world
        .cloud
        .seed(group("hello-artd_v000", "artd", Capacity::new(1, 4, 2)));

    let report = world
        .runner(config().with_stack_filter("artd"))
        .run(Mode::Deploy)
        .await
        .unwrap();

    assert_eq!(report.failure_count(), 0);
    assert_eq!(world.cloud.group_names(), vec!["hello-artd_v001"]);
    let artd = world.collector.recorded().pop().unwrap();
    assert_eq!(artd.deployed_group.as_deref(), Some("hello-artd_v001"));
    assert_eq!(
        artd.previous_groups,
        vec!["hello-artd_v000", "hello-artd_v999"]
    );
}
