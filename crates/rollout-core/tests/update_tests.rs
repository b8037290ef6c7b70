use proptest::prelude::*;
use rollout_core::update::{check_update_information, is_downsizing, plan_capacity};
use rollout_core::{Capacity, Mode, RunConfig, RunError, Runner, ValidationError};
use rollout_test_utils::{
    call_log, group, FakeFactory, FakeInspector, ScriptedPrompt, SharedBuffer, StepClock,
};
use std::sync::Arc;

fn live() -> FakeInspector {
    FakeInspector::new(group("hello-artd_v002", "artd", Capacity::new(1, 4, 2)))
}

fn runner(config: RunConfig, inspector: &Arc<FakeInspector>, factory: &Arc<FakeFactory>) -> Runner {
    Runner::new(config, Vec::new(), factory.clone())
        .with_inspector(inspector.clone())
        .with_clock(Arc::new(StepClock::frozen()))
}

#[tokio::test]
async fn test_downsizing_update_resizes_and_waits_for_exact_count() {
    let inspector = Arc::new(live());
    let factory = Arc::new(FakeFactory::new(call_log()));
    let out = SharedBuffer::new();
    let config = RunConfig::new("hello")
        .with_auto_apply(true)
        .with_capacity_overrides(None, None, Some(1));

    let report = runner(config, &inspector, &factory)
        .with_output(Box::new(out.clone()))
        .run(Mode::Update)
        .await
        .unwrap();

    let updates = inspector.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].group_name, "hello-artd_v002");
    assert_eq!(updates[0].capacity, Capacity::new(1, 4, 1));

    let seen = factory.last_config().unwrap();
    assert!(seen.downsizing_update);
    assert_eq!(seen.target_group.as_deref(), Some("hello-artd_v002"));
    assert!(!seen.force_manifest_capacity);
    assert_eq!(factory.built(), vec!["artd"]);
    assert_eq!(report.health.unwrap().rounds, 1);

    let text = out.contents();
    assert!(text.contains("[ AS IS ]\nMin: 1, Desired: 2, Max: 4"));
    assert!(text.contains("[ TO BE ]\nMin: 1, Desired: 1, Max: 4"));
}

#[tokio::test]
async fn test_upsizing_update_is_not_downsizing() {
    let inspector = Arc::new(live());
    let factory = Arc::new(FakeFactory::new(call_log()));
    let config = RunConfig::new("hello")
        .with_auto_apply(true)
        .with_capacity_overrides(None, Some(8), Some(6));

    runner(config, &inspector, &factory)
        .with_output(Box::new(SharedBuffer::new()))
        .update()
        .await
        .unwrap();

    assert!(!factory.last_config().unwrap().downsizing_update);
    assert_eq!(inspector.updates()[0].capacity, Capacity::new(1, 8, 6));
}

#[tokio::test]
async fn test_no_op_update_is_rejected_before_prompt() {
    let inspector = Arc::new(live());
    let factory = Arc::new(FakeFactory::new(call_log()));
    let prompt = Arc::new(ScriptedPrompt::new(true, true));

    let err = runner(RunConfig::new("hello"), &inspector, &factory)
        .with_prompt(prompt.clone())
        .with_output(Box::new(SharedBuffer::new()))
        .update()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Validation(ValidationError::NothingUpdated)));
    assert!(prompt.asked().is_empty());
    assert!(inspector.updates().is_empty());
    assert!(factory.built().is_empty());
}

#[tokio::test]
async fn test_invalid_bounds_are_rejected() {
    let inspector = Arc::new(live());
    let factory = Arc::new(FakeFactory::new(call_log()));
    let config = RunConfig::new("hello")
        .with_auto_apply(true)
        .with_capacity_overrides(Some(3), None, None);

    let err = runner(config, &inspector, &factory)
        .with_output(Box::new(SharedBuffer::new()))
        .update()
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "desired value cannot be smaller than minimum value"
    );
    assert!(inspector.updates().is_empty());
}

#[tokio::test]
async fn test_declined_update_applies_nothing() {
    let inspector = Arc::new(live());
    let factory = Arc::new(FakeFactory::new(call_log()));
    let config = RunConfig::new("hello").with_capacity_overrides(None, None, Some(3));

    let err = runner(config, &inspector, &factory)
        .with_prompt(Arc::new(ScriptedPrompt::new(true, false)))
        .with_output(Box::new(SharedBuffer::new()))
        .update()
        .await
        .unwrap_err();

    assert!(err.is_declined());
    assert!(inspector.updates().is_empty());
}

#[test]
fn test_negative_overrides_keep_live_values() {
    let config = RunConfig::new("hello").with_capacity_overrides(Some(-1), Some(-5), Some(3));
    assert_eq!(
        plan_capacity(Capacity::new(1, 4, 2), &config),
        Capacity::new(1, 4, 3)
    );
}

fn capacity() -> impl Strategy<Value = Capacity> {
    (0i64..6, 0i64..6, 0i64..6).prop_map(|(min, max, desired)| Capacity::new(min, max, desired))
}

proptest! {
    #[test]
    fn prop_update_check_matches_rules(old in capacity(), new in capacity()) {
        let result = check_update_information(old, new);
        let expected = if new.min > new.max {
            Err(ValidationError::MinAboveMax)
        } else if new.min > new.desired {
            Err(ValidationError::MinAboveDesired)
        } else if new.desired > new.max {
            Err(ValidationError::DesiredAboveMax)
        } else if old == new {
            Err(ValidationError::NothingUpdated)
        } else {
            Ok(())
        };
        prop_assert_eq!(result, expected);
    }

    #[test]
    fn prop_accepted_update_is_consistent(old in capacity(), new in capacity()) {
        if check_update_information(old, new).is_ok() {
            prop_assert!(new.is_consistent());
            prop_assert_ne!(old, new);
            prop_assert_eq!(is_downsizing(old, new), new.desired < old.desired);
        }
    }
}
