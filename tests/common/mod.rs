//! Shared fixtures for integration tests

#![allow(dead_code)] // Each test binary uses a different subset

pub mod strategies;

use orchestration_core::error::OrchestrationError;
use orchestration_core::events::{DispatchMode, EventBus, EventBusConfig, SubscribeOptions};
use orchestration_core::steps::{step_fn, StepDefinition, StepExecutor, StepFactory, WorkflowStep};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts how many times a step executor or event handler ran
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executor that fails `failures` times before echoing its input
pub fn flaky_executor(failures: u32, calls: CallCounter) -> Arc<dyn StepExecutor> {
    step_fn(move |input, ctx| {
        let calls = calls.clone();
        async move {
            let call = calls.hit();
            if call <= failures {
                return Err(OrchestrationError::workflow_execution(
                    ctx.workflow_id.clone(),
                    format!("transient failure {call}"),
                ));
            }
            Ok(json!({"echo": input, "call": call}))
        }
    })
}

/// Executor that sleeps for `delay` and then succeeds
pub fn slow_executor(delay: Duration) -> Arc<dyn StepExecutor> {
    step_fn(move |_input, _ctx| async move {
        tokio::time::sleep(delay).await;
        Ok(json!({"slept_ms": delay.as_millis() as u64}))
    })
}

/// Executor that always fails
pub fn failing_executor(calls: CallCounter) -> Arc<dyn StepExecutor> {
    step_fn(move |_input, ctx| {
        let calls = calls.clone();
        async move {
            calls.hit();
            Err(OrchestrationError::workflow_execution(
                ctx.workflow_id.clone(),
                "downstream unavailable",
            ))
        }
    })
}

pub fn step_with_id(id: &str, executor: Arc<dyn StepExecutor>) -> WorkflowStep {
    StepFactory::new()
        .create_step(
            StepDefinition {
                id: Some(id.to_string()),
                ..StepDefinition::new(id)
            },
            executor,
        )
        .expect("fixture step definition is valid")
}

/// Bus that waits for handlers, so assertions can follow `emit` directly
pub fn awaited_bus(max_history_size: usize) -> EventBus {
    EventBus::new(EventBusConfig {
        enable_history: true,
        max_history_size,
        dispatch_mode: DispatchMode::Awaited,
    })
}

pub async fn count_events(bus: &EventBus, pattern: &str) -> CallCounter {
    let counter = CallCounter::new();
    let handle = counter.clone();
    bus.subscribe(
        pattern,
        move |_event| {
            handle.hit();
            async { Ok::<(), anyhow::Error>(()) }
        },
        SubscribeOptions::default(),
    )
    .await
    .expect("fixture pattern is valid");
    counter
}

pub fn payload(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}
