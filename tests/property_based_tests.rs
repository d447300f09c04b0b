mod common;

use common::strategies::*;
use orchestration_core::events::TopicPattern;
use orchestration_core::scheduler::{PriorityJob, PriorityScheduler};
use orchestration_core::steps::{step_fn, StepDefinition, StepFactory};
use proptest::prelude::*;
use serde_json::json;

proptest! {
    /// Property: an exact pattern matches only its own topic
    #[test]
    fn exact_patterns_match_themselves(topic in topic_strategy(), other in topic_strategy()) {
        let topic = topic.join(".");
        let other = other.join(".");
        let pattern = TopicPattern::parse(&topic).unwrap();

        prop_assert!(pattern.is_exact());
        prop_assert!(pattern.matches(&topic));
        prop_assert_eq!(pattern.matches(&other), topic == other);
    }

    /// Property: `prefix.**` matches every topic under the prefix, and the prefix itself
    #[test]
    fn double_star_matches_any_suffix(prefix in topic_strategy(), suffix in prop::collection::vec(segment_strategy(), 0..4)) {
        let pattern = TopicPattern::parse(&format!("{}.**", prefix.join("."))).unwrap();
        let topic = prefix.iter().chain(suffix.iter()).cloned().collect::<Vec<_>>().join(".");
        prop_assert!(pattern.matches(&topic));
    }

    /// Property: `*` stands for exactly one segment
    #[test]
    fn single_star_matches_one_segment(segments in topic_strategy(), index in any::<prop::sample::Index>()) {
        let position = index.index(segments.len());
        let mut pattern_segments = segments.clone();
        pattern_segments[position] = "*".to_string();
        let pattern = TopicPattern::parse(&pattern_segments.join(".")).unwrap();

        prop_assert!(pattern.matches(&segments.join(".")));

        let mut longer = segments.clone();
        longer.insert(position, "extra".to_string());
        prop_assert!(!pattern.matches(&longer.join(".")));
    }

    /// Property: dequeue order is priority-descending and FIFO within a priority
    #[test]
    fn priority_queue_is_stable_by_level(priorities in prop::collection::vec(priority_strategy(), 0..40)) {
        let queue = PriorityScheduler::new(1);
        for (n, priority) in priorities.iter().enumerate() {
            queue.enqueue(PriorityJob::new(n.to_string(), *priority, "wf"));
        }

        let drained: Vec<PriorityJob> = std::iter::from_fn(|| queue.dequeue()).collect();
        prop_assert_eq!(drained.len(), priorities.len());
        for pair in drained.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a.priority >= b.priority);
            if a.priority == b.priority {
                prop_assert!(a.id.parse::<usize>().unwrap() < b.id.parse::<usize>().unwrap());
            }
        }
    }

    /// Property: every step the factory creates re-validates cleanly
    #[test]
    fn created_steps_revalidate(name in step_name_strategy(), version in semver_strategy(), tags in prop::collection::vec(segment_strategy(), 0..4)) {
        let factory = StepFactory::new();
        let step = factory
            .create_step(
                StepDefinition {
                    version: Some(version.clone()),
                    tags,
                    input_schema: Some(json!({"type": "object"})),
                    ..StepDefinition::new(name)
                },
                step_fn(|input, _ctx| async move { Ok(input) }),
            )
            .unwrap();

        prop_assert!(factory.validate_definition(&step.metadata().to_definition()).valid);
        prop_assert_eq!(&step.metadata().version, &version);
    }
}
