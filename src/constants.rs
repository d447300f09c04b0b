//! # System Constants
//!
//! Event topics published by orchestration components and the documented defaults of
//! every component configuration.

/// Topics the scheduler emits on the event bus
pub mod events {
    pub const SCHEDULE_REGISTERED: &str = "schedule.registered";
    pub const SCHEDULE_TRIGGERED: &str = "schedule.triggered";
    pub const SCHEDULE_COMPLETED: &str = "schedule.completed";
    pub const SCHEDULE_FAILED: &str = "schedule.failed";
    pub const SCHEDULE_SKIPPED: &str = "schedule.skipped";
    pub const SCHEDULE_PAUSED: &str = "schedule.paused";
    pub const SCHEDULE_RESUMED: &str = "schedule.resumed";
    pub const SCHEDULE_STOPPED: &str = "schedule.stopped";
    pub const SCHEDULE_ALERT: &str = "schedule.alert";

    /// Matches every schedule lifecycle event
    pub const ALL_SCHEDULE_EVENTS: &str = "schedule.*";
}

/// Documented component defaults
pub mod defaults {
    use std::time::Duration;

    pub const STEP_CATEGORY: &str = "general";
    pub const STEP_VERSION: &str = "1.0.0";

    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_DELAY: Duration = Duration::from_millis(1_000);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

    pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
    pub const CIRCUIT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

    pub const EVENT_HISTORY_SIZE: usize = 1_000;

    /// Number of entries returned in `RegistryStats::most_used`
    pub const MOST_USED_LIMIT: usize = 10;
}
