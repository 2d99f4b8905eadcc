//! Topic filter matching.
//!
//! Filters use `+` for exactly one level and a trailing `#` for the level
//! itself plus everything nested below it. Matching is case-sensitive and
//! never trims separators; `a/b/` and `a/b` are different topics.

/// Check whether a topic filter matches a published topic.
///
/// - `#` alone matches everything
/// - `a/#` matches `a` and everything below it
/// - `+` matches exactly one level; a bare `+` matches iff the topic
///   contains no `/`
/// - filters with no wildcard require exact equality
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;

    while fi < filter_parts.len() {
        let fp = filter_parts[fi];

        if fp == "#" {
            return true;
        }

        if ti >= topic_parts.len() {
            return false;
        }

        if fp == "+" {
            // A wildcard level must match one non-empty level.
            if topic_parts[ti].is_empty() {
                return false;
            }
            fi += 1;
            ti += 1;
            continue;
        }

        if fp != topic_parts[ti] {
            return false;
        }

        fi += 1;
        ti += 1;
    }

    ti == topic_parts.len()
}

/// Whether a filter contains any wildcard at all. Used to honor the
/// broker-wide wildcard-subscriptions flag: with wildcards disabled, such
/// filters only ever match themselves literally.
pub fn has_wildcard(filter: &str) -> bool {
    filter.split('/').any(|part| part == "+" || part == "#")
}

/// Validate filter syntax: `#` only as the final level, `+`/`#` only as
/// whole levels.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let parts: Vec<&str> = filter.split('/').collect();
    for (index, part) in parts.iter().enumerate() {
        if part.contains('#') && (*part != "#" || index + 1 != parts.len()) {
            return false;
        }
        if part.contains('+') && *part != "+" {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/x"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("sport/#", "sport/tennis/player1"));
    }

    #[test]
    fn multi_level_matches_bare_prefix() {
        assert!(topic_matches("a/#", "a"));
        assert!(!topic_matches("a/#", "ab"));
        assert!(!topic_matches("a/b/#", "a"));
        assert!(topic_matches("a/b/#", "a/b"));
    }

    #[test]
    fn bare_plus_matches_only_single_level_topics() {
        assert!(topic_matches("+", "x"));
        assert!(!topic_matches("+", "a/b"));
    }

    #[test]
    fn matching_is_case_sensitive_and_keeps_trailing_slashes() {
        assert!(!topic_matches("A/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/"));
        // `+` requires a non-empty level; a trailing slash leaves one empty.
        assert!(!topic_matches("a/b/+", "a/b/"));
        assert!(topic_matches("a/b/+", "a/b/c"));
    }

    #[test]
    fn wildcard_detection() {
        assert!(has_wildcard("a/+/c"));
        assert!(has_wildcard("#"));
        assert!(!has_wildcard("a/b/c"));
        // `+` or `#` embedded in a level is not a wildcard.
        assert!(!has_wildcard("a/b+c"));
    }

    #[test]
    fn filter_validation() {
        assert!(valid_filter("a/b/c"));
        assert!(valid_filter("a/+/c"));
        assert!(valid_filter("a/#"));
        assert!(valid_filter("#"));
        assert!(!valid_filter(""));
        assert!(!valid_filter("a/#/b"));
        assert!(!valid_filter("a/b#"));
        assert!(!valid_filter("a/b+"));
    }
}
