//! # Step Registry
//!
//! In-memory catalog of created steps keyed by step id.
//!
//! ## Concurrency
//!
//! Membership changes (`register`, `unregister`, `clear`, `import`) take the write lock.
//! Lookups, searches and usage recording only take the read lock: usage counters are
//! atomics and each entry guards its own `last_used_at`, so recording usage for one step
//! never blocks reads of another.
//!
//! ## Usage
//!
//! ```rust
//! use orchestration_core::registry::{StepQuery, StepRegistry};
//! use orchestration_core::steps::{step_fn, StepFactory};
//! use serde_json::Value;
//!
//! let registry = StepRegistry::new();
//! let step = StepFactory::new()
//!     .builder("fetch")
//!     .id("fetch")
//!     .category("http")
//!     .build(step_fn(|_, _| async { Ok(Value::Null) }))
//!     .unwrap();
//!
//! registry.register(step, Some("ops")).unwrap();
//! assert_eq!(registry.search(&StepQuery::category("http")).len(), 1);
//! ```

use crate::constants::defaults;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::logging::{self, LogContext, LogLevel, LogSink};
use crate::steps::{StepMetadata, StepResult, WorkflowStep};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot of a registered step with its registration metadata
#[derive(Debug, Clone)]
pub struct StepRegistryEntry {
    pub step: WorkflowStep,
    pub registered_by: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl StepRegistryEntry {
    /// Fresh entry for a step that was never used
    pub fn new(step: WorkflowStep, registered_by: Option<String>) -> Self {
        Self {
            step,
            registered_by,
            registered_at: Utc::now(),
            usage_count: 0,
            last_used_at: None,
        }
    }
}

/// Serializable form of an entry, without the executor
#[derive(Debug, Clone, Serialize)]
pub struct StepManifestEntry {
    pub metadata: StepMetadata,
    pub registered_by: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Search filter. Category is an exact match; tags match when any one is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepQuery {
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl StepQuery {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            tags: Vec::new(),
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            category: None,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, metadata: &StepMetadata) -> bool {
        let category_ok = self
            .category
            .as_ref()
            .map_or(true, |category| &metadata.category == category);
        let tags_ok = self.tags.is_empty() || self.tags.iter().any(|tag| metadata.has_tag(tag));
        category_ok && tags_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub id: String,
    pub name: String,
    pub usage_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_steps: usize,
    pub by_category: BTreeMap<String, usize>,
    /// Most used steps, highest count first, ties in registration order
    pub most_used: Vec<UsageSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportStatus {
    Imported,
    Overwritten,
    /// Id already present and overwrite was not requested
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub id: String,
    #[serde(flatten)]
    pub status: ImportStatus,
}

struct RegisteredStep {
    step: WorkflowStep,
    registered_by: Option<String>,
    registered_at: DateTime<Utc>,
    usage_count: AtomicU64,
    last_used_at: Mutex<Option<DateTime<Utc>>>,
}

impl RegisteredStep {
    fn from_entry(entry: StepRegistryEntry) -> Self {
        Self {
            step: entry.step,
            registered_by: entry.registered_by,
            registered_at: entry.registered_at,
            usage_count: AtomicU64::new(entry.usage_count),
            last_used_at: Mutex::new(entry.last_used_at),
        }
    }

    fn snapshot(&self) -> StepRegistryEntry {
        StepRegistryEntry {
            step: self.step.clone(),
            registered_by: self.registered_by.clone(),
            registered_at: self.registered_at,
            usage_count: self.usage_count.load(Ordering::Acquire),
            last_used_at: *self.last_used_at.lock(),
        }
    }

    fn touch(&self) {
        self.usage_count.fetch_add(1, Ordering::AcqRel);
        *self.last_used_at.lock() = Some(Utc::now());
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegisteredStep>,
    /// Registration order, used for deterministic search results
    order: Vec<String>,
}

impl RegistryState {
    fn insert(&mut self, entry: StepRegistryEntry) {
        let id = entry.step.id().to_string();
        if self.entries.insert(id.clone(), RegisteredStep::from_entry(entry)).is_none() {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<RegisteredStep> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    fn ordered(&self) -> impl Iterator<Item = &RegisteredStep> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }
}

/// Catalog of steps by id
#[derive(Default)]
pub struct StepRegistry {
    state: RwLock<RegistryState>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_sink(log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            state: RwLock::default(),
            log_sink: Some(log_sink),
        }
    }

    /// Register a step. Fails with `DUPLICATE_STEP` when the id is taken.
    pub fn register(&self, step: WorkflowStep, registered_by: Option<&str>) -> OrchestrationResult<()> {
        let id = step.id().to_string();
        if id.trim().is_empty() {
            return Err(OrchestrationError::invalid_step_registration(
                "step id must not be empty",
            ));
        }

        {
            let mut state = self.state.write();
            if state.entries.contains_key(&id) {
                return Err(OrchestrationError::duplicate_step(&id));
            }
            state.insert(StepRegistryEntry::new(step, registered_by.map(str::to_string)));
        }

        info!(step_id = %id, registered_by = ?registered_by, "Step registered");
        self.log(LogLevel::Info, "step registered", &id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<WorkflowStep> {
        self.state.read().entries.get(id).map(|entry| entry.step.clone())
    }

    pub fn get_entry(&self, id: &str) -> Option<StepRegistryEntry> {
        self.state.read().entries.get(id).map(RegisteredStep::snapshot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matching steps in registration order
    pub fn search(&self, query: &StepQuery) -> Vec<WorkflowStep> {
        self.state
            .read()
            .ordered()
            .filter(|entry| query.matches(entry.step.metadata()))
            .map(|entry| entry.step.clone())
            .collect()
    }

    /// Remove a step. Fails with `STEP_NOT_FOUND` when absent.
    pub fn unregister(&self, id: &str) -> OrchestrationResult<WorkflowStep> {
        let removed = self
            .state
            .write()
            .remove(id)
            .ok_or_else(|| OrchestrationError::step_not_found(id))?;

        info!(step_id = %id, "Step unregistered");
        self.log(LogLevel::Info, "step unregistered", id);
        Ok(removed.step)
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        let removed = state.entries.len();
        state.entries.clear();
        state.order.clear();
        debug!(removed = removed, "Step registry cleared");
    }

    /// Increment the usage counter and stamp `last_used_at`
    pub fn record_usage(&self, id: &str) -> OrchestrationResult<()> {
        let state = self.state.read();
        let entry = state
            .entries
            .get(id)
            .ok_or_else(|| OrchestrationError::step_not_found(id))?;
        entry.touch();
        Ok(())
    }

    /// Record usage, then run the step
    pub async fn execute(&self, id: &str, input: Value, workflow_id: &str) -> OrchestrationResult<StepResult> {
        let step = {
            let state = self.state.read();
            let entry = state
                .entries
                .get(id)
                .ok_or_else(|| OrchestrationError::step_not_found(id))?;
            entry.touch();
            entry.step.clone()
        };
        Ok(step.execute(input, workflow_id).await)
    }

    pub fn get_stats(&self) -> RegistryStats {
        let state = self.state.read();

        let mut by_category = BTreeMap::new();
        for entry in state.entries.values() {
            *by_category
                .entry(entry.step.metadata().category.clone())
                .or_insert(0) += 1;
        }

        let mut most_used: Vec<UsageSummary> = state
            .ordered()
            .map(|entry| UsageSummary {
                id: entry.step.id().to_string(),
                name: entry.step.metadata().name.clone(),
                usage_count: entry.usage_count.load(Ordering::Acquire),
            })
            .collect();
        // Stable sort keeps registration order among equal counts
        most_used.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        most_used.truncate(defaults::MOST_USED_LIMIT);

        RegistryStats {
            total_steps: state.entries.len(),
            by_category,
            most_used,
        }
    }

    /// Every entry in registration order
    pub fn export(&self) -> Vec<StepRegistryEntry> {
        self.state.read().ordered().map(RegisteredStep::snapshot).collect()
    }

    /// Serializable manifest of every entry in registration order
    pub fn export_manifest(&self) -> Vec<StepManifestEntry> {
        self.export()
            .into_iter()
            .map(|entry| StepManifestEntry {
                metadata: entry.step.metadata().clone(),
                registered_by: entry.registered_by,
                registered_at: entry.registered_at,
                usage_count: entry.usage_count,
                last_used_at: entry.last_used_at,
            })
            .collect()
    }

    /// Bulk insert. Existing ids are skipped unless `overwrite` is set.
    pub fn import(&self, entries: Vec<StepRegistryEntry>, overwrite: bool) -> Vec<ImportOutcome> {
        let mut state = self.state.write();
        let outcomes: Vec<ImportOutcome> = entries
            .into_iter()
            .map(|entry| {
                let id = entry.step.id().to_string();
                let status = if id.trim().is_empty() {
                    ImportStatus::Failed {
                        reason: "step id must not be empty".to_string(),
                    }
                } else if state.entries.contains_key(&id) {
                    if overwrite {
                        state.insert(entry);
                        ImportStatus::Overwritten
                    } else {
                        ImportStatus::Skipped
                    }
                } else {
                    state.insert(entry);
                    ImportStatus::Imported
                };
                ImportOutcome { id, status }
            })
            .collect();
        drop(state);

        info!(
            total = outcomes.len(),
            skipped = outcomes.iter().filter(|o| o.status == ImportStatus::Skipped).count(),
            "Step import finished"
        );
        outcomes
    }

    fn log(&self, level: LogLevel, message: &str, step_id: &str) {
        let mut context = LogContext::new();
        context.insert("step_id".to_string(), json!(step_id));
        logging::emit(self.log_sink.as_ref(), level, message, context);
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::logging::testing::CapturingSink;
    use crate::steps::{step_fn, StepFactory};

    fn step(id: &str, category: &str, tags: &[&str]) -> WorkflowStep {
        let factory = StepFactory::new();
        let mut builder = factory.builder(id).id(id).category(category);
        for tag in tags {
            builder = builder.tag(*tag);
        }
        builder
            .build(step_fn(|input, _| async move { Ok(input) }))
            .unwrap()
    }

    #[test]
    fn test_duplicate_registration_leaves_count_unchanged() {
        let registry = StepRegistry::new();
        registry.register(step("a", "io", &[]), None).unwrap();

        let error = registry.register(step("a", "io", &[]), None).unwrap_err();

        assert_eq!(error.code(), ErrorCode::DuplicateStep);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_search_by_category_and_any_tag_in_insertion_order() {
        let registry = StepRegistry::new();
        registry.register(step("c", "http", &["get"]), None).unwrap();
        registry.register(step("a", "db", &["read"]), None).unwrap();
        registry.register(step("b", "http", &["post", "write"]), None).unwrap();

        let http: Vec<String> = registry
            .search(&StepQuery::category("http"))
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(http, vec!["c", "b"]);

        let tagged: Vec<String> = registry
            .search(&StepQuery::tags(["write", "read"]))
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(tagged, vec!["a", "b"]);

        let both = StepQuery {
            category: Some("http".to_string()),
            tags: vec!["read".to_string()],
        };
        assert!(registry.search(&both).is_empty());
    }

    #[test]
    fn test_unregister_missing_step() {
        let registry = StepRegistry::new();
        assert_eq!(
            registry.unregister("ghost").unwrap_err().code(),
            ErrorCode::StepNotFound
        );
    }

    #[test]
    fn test_reregister_after_unregister_goes_to_end() {
        let registry = StepRegistry::new();
        registry.register(step("a", "x", &[]), None).unwrap();
        registry.register(step("b", "x", &[]), None).unwrap();
        registry.unregister("a").unwrap();
        registry.register(step("a", "x", &[]), None).unwrap();

        let ids: Vec<String> = registry
            .export()
            .iter()
            .map(|e| e.step.id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_stats_rank_usage() {
        let registry = StepRegistry::new();
        registry.register(step("a", "io", &[]), None).unwrap();
        registry.register(step("b", "io", &[]), None).unwrap();
        registry.register(step("c", "cpu", &[]), None).unwrap();

        registry.record_usage("b").unwrap();
        registry.record_usage("b").unwrap();
        registry.record_usage("c").unwrap();

        let stats = registry.get_stats();
        assert_eq!(stats.total_steps, 3);
        assert_eq!(stats.by_category.get("io"), Some(&2));
        let ranked: Vec<&str> = stats.most_used.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ranked, vec!["b", "c", "a"]);

        let entry = registry.get_entry("b").unwrap();
        assert_eq!(entry.usage_count, 2);
        assert!(entry.last_used_at.is_some());
    }

    #[test]
    fn test_import_skips_existing_without_overwrite() {
        let source = StepRegistry::new();
        source.register(step("a", "io", &[]), Some("alice")).unwrap();
        source.register(step("b", "io", &[]), Some("alice")).unwrap();

        let target = StepRegistry::new();
        target.register(step("a", "other", &[]), Some("bob")).unwrap();

        let outcomes = target.import(source.export(), false);
        assert_eq!(outcomes[0].status, ImportStatus::Skipped);
        assert_eq!(outcomes[1].status, ImportStatus::Imported);
        assert_eq!(target.get("a").unwrap().metadata().category, "other");

        let outcomes = target.import(source.export(), true);
        assert_eq!(outcomes[0].status, ImportStatus::Overwritten);
        assert_eq!(target.get("a").unwrap().metadata().category, "io");
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn test_manifest_serializes_metadata() {
        let registry = StepRegistry::new();
        registry.register(step("a", "io", &["x"]), Some("ops")).unwrap();

        let manifest = serde_json::to_value(registry.export_manifest()).unwrap();
        assert_eq!(manifest[0]["metadata"]["id"], "a");
        assert_eq!(manifest[0]["registered_by"], "ops");
        assert_eq!(manifest[0]["usage_count"], 0);
    }

    #[tokio::test]
    async fn test_execute_records_usage() {
        let registry = StepRegistry::new();
        registry.register(step("echo", "io", &[]), None).unwrap();

        let result = registry.execute("echo", json!({"v": 1}), "wf").await.unwrap();

        assert!(result.success);
        assert_eq!(result.output, Some(json!({"v": 1})));
        assert_eq!(registry.get_entry("echo").unwrap().usage_count, 1);
        assert!(registry.execute("missing", Value::Null, "wf").await.is_err());
    }

    #[test]
    fn test_log_sink_receives_registrations() {
        let capture = Arc::new(CapturingSink::default());
        let registry = StepRegistry::with_log_sink(capture.clone());
        registry.register(step("a", "io", &[]), None).unwrap();
        registry.unregister("a").unwrap();

        assert_eq!(capture.records.lock().len(), 2);
    }
}
