//! Hierarchical topic patterns.
//!
//! Topics are dot-delimited (`user.profile.updated`). In patterns, `*` matches exactly one
//! segment and `**` matches zero or more segments. Matching is anchored at both ends.

use crate::error::{OrchestrationError, OrchestrationResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

/// A parsed subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> OrchestrationResult<Self> {
        if pattern.is_empty() {
            return Err(invalid(pattern, "pattern must not be empty"));
        }

        let segments = pattern
            .split('.')
            .map(|segment| match segment {
                "" => Err(invalid(pattern, "pattern contains an empty segment")),
                "*" => Ok(Segment::Single),
                "**" => Ok(Segment::Multi),
                s if s.contains('*') => Err(invalid(
                    pattern,
                    "wildcards must occupy a whole segment",
                )),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<OrchestrationResult<Vec<_>>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let topic: Vec<&str> = topic.split('.').collect();
        let (p, t) = (self.segments.len(), topic.len());

        // reachable[j]: first i pattern segments can consume the first j topic segments
        let mut reachable = vec![false; t + 1];
        reachable[0] = true;

        for segment in &self.segments {
            let mut next = vec![false; t + 1];
            match segment {
                Segment::Multi => {
                    let mut seen = false;
                    for j in 0..=t {
                        seen |= reachable[j];
                        next[j] = seen;
                    }
                }
                Segment::Single => {
                    for j in 1..=t {
                        next[j] = reachable[j - 1];
                    }
                }
                Segment::Literal(literal) => {
                    for j in 1..=t {
                        next[j] = reachable[j - 1] && topic[j - 1] == literal;
                    }
                }
            }
            reachable = next;
        }

        p > 0 && reachable[t]
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Concrete event types: non-empty segments, no wildcards
pub fn validate_topic(topic: &str) -> OrchestrationResult<()> {
    if topic.is_empty() || topic.split('.').any(|segment| segment.is_empty()) {
        return Err(OrchestrationError::workflow_validation(
            format!("invalid event type '{topic}'"),
            vec!["event types must be non-empty dot-delimited segments".to_string()],
        ));
    }
    if topic.contains('*') {
        return Err(OrchestrationError::workflow_validation(
            format!("invalid event type '{topic}'"),
            vec!["event types must not contain wildcards".to_string()],
        ));
    }
    Ok(())
}

fn invalid(pattern: &str, reason: &str) -> OrchestrationError {
    OrchestrationError::workflow_validation(
        format!("invalid topic pattern '{pattern}'"),
        vec![reason.to_string()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        TopicPattern::parse(pattern).unwrap().matches(topic)
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("user.created", "user.created"));
        assert!(!matches("user.created", "user.created.v2"));
        assert!(!matches("user.created", "user"));
    }

    #[test]
    fn test_single_wildcard_is_one_segment() {
        assert!(matches("user.*", "user.created"));
        assert!(matches("user.*", "user.updated"));
        assert!(!matches("user.*", "order.placed"));
        assert!(!matches("user.*", "user"));
        assert!(!matches("user.*", "user.profile.updated"));
        assert!(matches("*.created", "order.created"));
    }

    #[test]
    fn test_multi_wildcard_spans_zero_or_more() {
        assert!(matches("system.**", "system.health.check"));
        assert!(matches("system.**", "system.metrics.cpu.high"));
        assert!(matches("system.**", "system"));
        assert!(!matches("system.**", "systems.health"));
        assert!(matches("**", "anything.at.all"));
        assert!(matches("a.**.z", "a.z"));
        assert!(matches("a.**.z", "a.b.c.z"));
        assert!(!matches("a.**.z", "a.b.c"));
        assert!(matches("**.failed", "schedule.failed"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(matches("*.**.done", "job.done"));
        assert!(matches("*.**.done", "job.x.y.done"));
        assert!(!matches("*.**.done", "done"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("user..created").is_err());
        assert!(TopicPattern::parse("user.cre*").is_err());
        assert!(TopicPattern::parse("user.***").is_err());
    }

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic("user.created").is_ok());
        assert!(validate_topic("user.*").is_err());
        assert!(validate_topic(".user").is_err());
        assert!(validate_topic("").is_err());
    }
}
