//! Step definitions: the serializable input shape and the immutable metadata a created
//! step carries for its whole lifetime.

use super::policy::RetryPolicy;
use super::schema::StepSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Raw step definition as supplied by callers. Optional fields fall back to factory
/// defaults when the step is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDefinition {
    /// Generated (uuid v4) when absent
    pub id: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    #[serde(with = "crate::utils::serde::option_duration_ms")]
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Metadata of a created step. Never mutated after creation; enhancers share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, with = "crate::utils::serde::option_duration_ms")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub input_schema: Option<StepSchema>,
    #[serde(default)]
    pub output_schema: Option<StepSchema>,
}

impl StepMetadata {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Convert back into the definition shape, e.g. to re-validate or re-create the step
    pub fn to_definition(&self) -> StepDefinition {
        StepDefinition {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            version: Some(self.version.clone()),
            category: Some(self.category.clone()),
            tags: self.tags.iter().cloned().collect(),
            description: self.description.clone(),
            timeout: self.timeout,
            retry_policy: self.retry_policy.clone(),
            input_schema: self.input_schema.as_ref().map(|s| s.raw().clone()),
            output_schema: self.output_schema.as_ref().map(|s| s.raw().clone()),
        }
    }
}

/// `MAJOR.MINOR.PATCH` with optional `-prerelease` and `+build` suffixes
pub fn is_semver(version: &str) -> bool {
    let (core, build) = match version.split_once('+') {
        Some((core, build)) => (core, Some(build)),
        None => (version, None),
    };
    let (core, prerelease) = match core.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (core, None),
    };

    let numbers: Vec<&str> = core.split('.').collect();
    let core_valid = numbers.len() == 3
        && numbers.iter().all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_digit())
                && (part.len() == 1 || !part.starts_with('0'))
        });

    let identifiers_valid = |suffix: Option<&str>| {
        suffix.map_or(true, |s| {
            s.split('.').all(|id| {
                !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
        })
    };

    core_valid && identifiers_valid(prerelease) && identifiers_valid(build)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semver_accepts_standard_versions() {
        for version in ["0.0.1", "1.0.0", "10.20.30", "1.0.0-alpha.1", "2.1.3+build.5", "1.0.0-rc-1+sha"] {
            assert!(is_semver(version), "{version} should be valid");
        }
    }

    #[test]
    fn test_semver_rejects_malformed_versions() {
        for version in ["", "1", "1.0", "1.0.0.0", "v1.0.0", "01.0.0", "1.0.x", "1.0.0-", "1.0.0+"] {
            assert!(!is_semver(version), "{version} should be invalid");
        }
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let definition: StepDefinition = serde_json::from_value(serde_json::json!({
            "name": "fetch",
            "timeout": 500,
            "tags": ["http"]
        }))
        .unwrap();

        assert_eq!(definition.name, "fetch");
        assert_eq!(definition.timeout, Some(Duration::from_millis(500)));
        assert!(definition.id.is_none());
    }
}
