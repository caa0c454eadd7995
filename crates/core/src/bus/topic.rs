//! # Topics and Patterns
//!
//! Topics are delimiter-separated segments (`user.request`). Patterns use the
//! same shape, where a segment equal to the wildcard token matches exactly one
//! topic segment. There is no multi-segment wildcard: `a.*` matches `a.b` but
//! neither `a` nor `a.b.c`.

use regex::Regex;

use super::config::BusConfig;
use super::event::ERROR_TOPIC;
use crate::error::{Error, Result};

/// One segment of a parsed pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Pattern as written by the subscriber
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern has no wildcard segment
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Segment-wise match against an already split topic
    pub(crate) fn matches_segments(&self, topic: &[&str]) -> bool {
        self.segments.len() == topic.len()
            && self
                .segments
                .iter()
                .zip(topic)
                .all(|(segment, part)| match segment {
                    Segment::Wildcard => true,
                    Segment::Literal(literal) => literal == part,
                })
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Topic grammar for one bus (delimiter, wildcard, segment charset)
#[derive(Debug, Clone)]
pub struct TopicSyntax {
    delimiter: String,
    wildcard: String,
    segment: Regex,
}

impl TopicSyntax {
    /// Build the grammar described by `config`
    pub fn new(config: &BusConfig) -> Result<Self> {
        let segment = Regex::new(r"^[A-Za-z0-9_\-]+$")
            .map_err(|e| Error::Config(format!("segment charset: {e}")))?;
        Ok(Self {
            delimiter: config.topic_delimiter.clone(),
            wildcard: config.wildcard_token.clone(),
            segment,
        })
    }

    /// Split and validate a concrete topic
    pub fn split_topic<'t>(&self, topic: &'t str) -> Result<Vec<&'t str>> {
        let invalid = |reason: &str| Error::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };

        if topic.is_empty() {
            return Err(invalid("topic is empty"));
        }
        let parts: Vec<&str> = topic.split(self.delimiter.as_str()).collect();
        for part in &parts {
            if part.is_empty() {
                return Err(invalid("empty segment"));
            }
            if part.contains(self.wildcard.as_str()) {
                return Err(invalid("wildcards are only allowed in patterns"));
            }
            if !self.segment.is_match(part) {
                return Err(invalid(&format!(
                    "segment '{part}' contains characters outside [A-Za-z0-9_-]"
                )));
            }
        }
        Ok(parts)
    }

    /// Validate a topic for an ordinary publish (the error topic is reserved)
    pub fn validate_publish_topic(&self, topic: &str) -> Result<()> {
        if topic == ERROR_TOPIC {
            return Err(Error::InvalidTopic {
                topic: topic.to_string(),
                reason: "reserved for system failure events".to_string(),
            });
        }
        self.split_topic(topic).map(|_| ())
    }

    /// Parse and validate a subscription pattern
    pub fn parse_pattern(&self, pattern: &str) -> Result<TopicPattern> {
        let invalid = |reason: String| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty".to_string()));
        }
        let mut segments = Vec::new();
        for part in pattern.split(self.delimiter.as_str()) {
            if part.is_empty() {
                return Err(invalid("empty segment".to_string()));
            }
            if part == self.wildcard {
                segments.push(Segment::Wildcard);
                continue;
            }
            if part.contains(self.wildcard.as_str()) {
                return Err(invalid(format!(
                    "wildcard '{}' must be a whole segment",
                    self.wildcard
                )));
            }
            if !self.segment.is_match(part) {
                return Err(invalid(format!(
                    "segment '{part}' contains characters outside [A-Za-z0-9_-]"
                )));
            }
            segments.push(Segment::Literal(part.to_string()));
        }
        Ok(TopicPattern {
            raw: pattern.to_string(),
            segments,
        })
    }
}
