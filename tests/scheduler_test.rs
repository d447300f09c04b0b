//! Scheduler facade wired to an event bus, the way an application would run it

mod common;

use common::*;
use orchestration_core::config::ConfigLoader;
use orchestration_core::constants::events;
use orchestration_core::error::{ErrorCode, OrchestrationError};
use orchestration_core::scheduler::{
    runner_fn, PriorityJob, PriorityScheduler, Priority, RunOutcome, ScheduleDefinition,
    ScheduleStatus, Scheduler, TriggerSpec,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_priority_dequeue_order() {
    let queue = PriorityScheduler::new(1);
    for (id, priority) in [
        ("low", Priority::Low),
        ("critical-a", Priority::Critical),
        ("normal", Priority::Normal),
        ("critical-b", Priority::Critical),
    ] {
        queue.enqueue(PriorityJob::new(id, priority, "wf"));
    }

    let order: Vec<String> = (0..4).filter_map(|_| queue.dequeue()).map(|job| job.id).collect();
    assert_eq!(order, vec!["critical-a", "critical-b", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_lifecycle_publishes_events() {
    let bus = awaited_bus(100);
    let topics = Arc::new(Mutex::new(Vec::new()));
    let sink = topics.clone();
    bus.subscribe(
        events::ALL_SCHEDULE_EVENTS,
        move |event| {
            sink.lock().push(event.event_type.clone());
            async { Ok::<(), anyhow::Error>(()) }
        },
        Default::default(),
    )
    .await
    .unwrap();

    let calls = CallCounter::new();
    let counter = calls.clone();
    let runner = runner_fn(move |workflow_id, input| {
        let counter = counter.clone();
        async move {
            counter.hit();
            Ok(json!({"workflow": workflow_id, "input": input}))
        }
    });
    let scheduler = Scheduler::builder(runner).event_bus(bus.clone()).build();

    scheduler
        .schedule(
            ScheduleDefinition::new("hourly", "sync", TriggerSpec::interval(Duration::from_secs(3600)))
                .with_input(json!({"full": false})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3601)).await;
    scheduler.pause("hourly").await.unwrap();
    scheduler.resume("hourly").await.unwrap();
    scheduler.unschedule("hourly").await.unwrap();

    assert_eq!(calls.count(), 1);
    assert_eq!(
        *topics.lock(),
        vec![
            events::SCHEDULE_REGISTERED,
            events::SCHEDULE_TRIGGERED,
            events::SCHEDULE_COMPLETED,
            events::SCHEDULE_PAUSED,
            events::SCHEDULE_RESUMED,
            events::SCHEDULE_STOPPED,
        ]
    );

    let completed = bus
        .get_history()
        .unwrap()
        .into_iter()
        .find(|event| event.event_type == events::SCHEDULE_COMPLETED)
        .unwrap();
    assert_eq!(completed.data["output"]["input"]["full"], false);
    assert_eq!(completed.source.as_deref(), Some("scheduler"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_schedule_keeps_running() {
    let runner = runner_fn(|workflow_id, _input: Value| async move {
        Err::<Value, _>(OrchestrationError::workflow_execution(workflow_id, "unreachable"))
    });
    let scheduler = Scheduler::builder(runner).build();
    scheduler
        .schedule(ScheduleDefinition::new(
            "every-minute",
            "ping",
            TriggerSpec::interval(Duration::from_secs(60)),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(181)).await;

    let info = scheduler.get("every-minute").unwrap();
    assert_eq!(info.status, ScheduleStatus::Active);
    assert_eq!(info.stats.failure_count, 3);
    assert_eq!(
        info.stats.last_error.as_ref().unwrap()["code"],
        "WORKFLOW_EXECUTION_ERROR"
    );
}

#[tokio::test]
async fn test_trigger_now_on_unknown_schedule() {
    let scheduler = Scheduler::builder(runner_fn(|_, _| async { Ok(Value::Null) })).build();
    let err = scheduler.trigger_now("missing").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ScheduleNotFound);
}

#[tokio::test]
async fn test_scheduler_built_from_configuration() {
    let config = ConfigLoader::from_toml_str(
        r#"
[scheduler]
timezone = "Europe/Berlin"
overlap_policy = "allow"
priority_max_concurrency = 2
"#,
    )
    .unwrap();
    let scheduler_config = config.scheduler.to_scheduler_config();
    assert_eq!(scheduler_config.timezone, chrono_tz::Europe::Berlin);

    let scheduler = Scheduler::new(
        scheduler_config,
        runner_fn(|_, _| async { Ok(json!({"ok": true})) }),
    );
    scheduler
        .schedule(ScheduleDefinition::new(
            "berlin-morning",
            "report",
            TriggerSpec::cron("0 8 * * 1-5"),
        ))
        .await
        .unwrap();

    let info = scheduler.get("berlin-morning").unwrap();
    assert!(info.next_run_at.is_some());
    let outcome = scheduler.trigger_now("berlin-morning").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { attempts: 1, .. }));
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}
