//! # Registry Infrastructure
//!
//! Catalogs for orchestration components.
//!
//! ```text
//! Registry Infrastructure
//! └── StepRegistry    (step lookup, search, usage statistics, bulk import/export)
//! ```

pub mod step_registry;

pub use step_registry::{
    ImportOutcome, ImportStatus, RegistryStats, StepManifestEntry, StepQuery, StepRegistry,
    StepRegistryEntry, UsageSummary,
};
