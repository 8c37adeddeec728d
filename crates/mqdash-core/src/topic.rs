//! Topic pattern matching.
//!
//! Patterns use the standard MQTT wildcards: `+` matches exactly one level
//! (including an empty level between two separators) and `#` matches the
//! remainder of the topic, including nothing at all.
//!
//! Unlike a broker, the matcher does not special-case `$`-prefixed topics and
//! does not reject a `#` that is not the last level: such a `#` matches
//! greedily to the end of the topic.

/// Level separator.
pub const SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL: &str = "#";

/// Returns true if `topic` satisfies `pattern`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split(SEPARATOR);

    for level in pattern.split(SEPARATOR) {
        if level == MULTI_LEVEL {
            return true;
        }

        match topic_levels.next() {
            Some(t) if level == SINGLE_LEVEL || level == t => {}
            _ => return false,
        }
    }

    // Pattern exhausted: only a match if the topic is too.
    topic_levels.next().is_none()
}

/// Returns true if the pattern contains a wildcard level.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
}
