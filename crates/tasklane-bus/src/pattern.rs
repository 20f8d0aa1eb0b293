//! Topic pattern matching.
//!
//! Topics and patterns split on `.`; segments are non-empty. `*` matches
//! exactly one segment. `#` matches zero or more trailing segments and must
//! be a segment of its own. `a.b` matches only `a.b`; `a.*` matches `a.x`
//! but not `a.x.y`; `a.#` matches `a`, `a.x`, and `a.x.y`.

use crate::error::BusError;

/// Check whether `topic` matches `pattern`.
pub fn matches(topic: &str, pattern: &str) -> bool {
    if topic == pattern {
        return true;
    }
    let topic_segments: Vec<&str> = topic.split('.').collect();
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    match_segments(&topic_segments, &pattern_segments)
}

fn match_segments(topic: &[&str], pattern: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", rest)) => {
            // A trailing '#' matches everything remaining, including nothing.
            if rest.is_empty() {
                return true;
            }
            (0..=topic.len()).any(|skip| match_segments(&topic[skip..], rest))
        }
        Some((&"*", rest)) => match topic.split_first() {
            Some((_, remaining)) => match_segments(remaining, rest),
            None => false,
        },
        Some((literal, rest)) => match topic.split_first() {
            Some((segment, remaining)) if segment == literal => match_segments(remaining, rest),
            _ => false,
        },
    }
}

/// Validate a subscription pattern: non-empty, no empty segments, and `#`
/// only as a whole segment.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    if pattern.is_empty() {
        return Err(BusError::InvalidPattern(
            "pattern cannot be empty".to_string(),
        ));
    }
    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err(BusError::InvalidPattern(format!(
                "pattern '{}' contains an empty segment",
                pattern
            )));
        }
        if segment.contains('#') && segment != "#" {
            return Err(BusError::InvalidPattern(format!(
                "'#' must be a whole segment in pattern '{}'",
                pattern
            )));
        }
    }
    Ok(())
}

/// Validate a published topic: non-empty with non-empty segments.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() {
        return Err(BusError::InvalidTopic("topic cannot be empty".to_string()));
    }
    if topic.split('.').any(|segment| segment.is_empty()) {
        return Err(BusError::InvalidTopic(format!(
            "topic '{}' contains an empty segment",
            topic
        )));
    }
    Ok(())
}
