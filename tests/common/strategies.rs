use orchestration_core::scheduler::Priority;
use proptest::prelude::*;

/// A single topic segment: lowercase identifier, never a wildcard
pub fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}"
}

/// Concrete event types with one to six segments
pub fn topic_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(segment_strategy(), 1..=6)
}

pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

/// Step names accepted by the factory
pub fn step_name_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_-]{0,31}"
}

pub fn semver_strategy() -> impl Strategy<Value = String> {
    (0u32..20, 0u32..50, 0u32..100).prop_map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
}
