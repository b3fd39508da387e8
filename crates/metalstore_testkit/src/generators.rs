//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use crate::fixtures::Machine;
use metalstore_core::{EntityId, PoolConfig, Step, Task};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for generating valid entity IDs.
pub fn entity_id_strategy() -> impl Strategy<Value = EntityId> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,23}")
        .expect("Invalid regex")
        .prop_map(EntityId::new)
}

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,31}")
        .expect("Invalid regex")
        .prop_filter("Collection name must not be empty", |s| !s.is_empty())
}

/// Strategy for generating small pool ranges `(min, max)` with `min <= max`.
pub fn pool_range_strategy(max_size: u32) -> impl Strategy<Value = (u32, u32)> {
    (0u32..1_000_000, 0..max_size).prop_map(|(min, span)| (min, min + span))
}

/// Strategy for generating valid pool configurations.
pub fn pool_config_strategy(max_size: u32) -> impl Strategy<Value = PoolConfig> {
    (collection_name_strategy(), pool_range_strategy(max_size))
        .prop_map(|(name, (min, max))| PoolConfig::new(format!("pool_{name}"), min, max))
}

/// Strategy for generating optional step arguments.
pub fn args_strategy() -> impl Strategy<Value = Option<Value>> {
    prop::option::of(
        (any::<u16>(), "[a-z]{0,8}").prop_map(|(n, s)| json!({ "n": n, "label": s })),
    )
}

/// Strategy for generating steps drawn from `actions`.
pub fn step_strategy(actions: &'static [&'static str]) -> impl Strategy<Value = Step> {
    (
        entity_id_strategy(),
        prop::sample::select(actions),
        args_strategy(),
    )
        .prop_map(|(target, action, args)| {
            let step = Step::new(target, action);
            match args {
                Some(args) => step.with_args(args),
                None => step,
            }
        })
}

/// Strategy for generating tasks of one to `max_steps` steps.
pub fn task_strategy(
    actions: &'static [&'static str],
    max_steps: usize,
) -> impl Strategy<Value = Task> {
    prop::collection::vec(step_strategy(actions), 1..=max_steps.max(1)).prop_map(Task::new)
}

/// Strategy for generating machines without timestamps.
pub fn machine_strategy() -> impl Strategy<Value = Machine> {
    (entity_id_strategy(), "rack-[0-9]{1,2}", "(ready|allocated|wiped)").prop_map(
        |(id, rack, state)| {
            let mut machine = Machine::new(id.as_str(), &rack);
            machine.state = state;
            machine
        },
    )
}

/// Strategy for generating a batch of machines with unique ids.
pub fn machine_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Machine>> {
    prop::collection::vec(machine_strategy(), 0..max).prop_map(|machines| {
        let mut seen = std::collections::HashSet::new();
        machines
            .into_iter()
            .filter(|m| seen.insert(m.meta.id.clone()))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use metalstore_core::Entity;

    proptest! {
        #[test]
        fn generated_ids_are_not_empty(id in entity_id_strategy()) {
            prop_assert!(!id.is_empty());
        }

        #[test]
        fn generated_pool_configs_validate(config in pool_config_strategy(64)) {
            prop_assert!(config.validate().is_ok());
            prop_assert!(config.size() <= 64);
        }

        #[test]
        fn generated_tasks_decode(task in task_strategy(&["release", "wipe"], 4)) {
            let decoded = Task::decode(&task.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, task);
        }

        #[test]
        fn machine_batches_have_unique_ids(batch in machine_batch_strategy(20)) {
            let ids: std::collections::HashSet<_> = batch.iter().map(|m| m.id().clone()).collect();
            prop_assert_eq!(ids.len(), batch.len());
        }
    }
}
