//! Topic name and filter validation
//!
//! Topic names (PUBLISH) must not contain wildcards; topic filters
//! (SUBSCRIBE/UNSUBSCRIBE) may. `#` must occupy a whole level and come
//! last, `+` must occupy a whole level. Empty levels are permitted, and the
//! 16-bit length field bounds both.

/// Validate a topic name as used in PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > u16::MAX as usize {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter as used in SUBSCRIBE/UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > u16::MAX as usize {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check whether `filter` matches the concrete `topic`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // Reserved topics are invisible to root-level wildcards
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some("#"), _) => return true,
            (Some(_), None) => return false,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert!(validate_topic_name("sensors/room1/temp").is_ok());
        assert!(validate_topic_name("/leading").is_ok());
        assert!(validate_topic_name("trailing/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a+b").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a/+/b").is_err());
    }

    #[test]
    fn topic_filters() {
        assert!(validate_topic_filter("a/b").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/+/b").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("//").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a+").is_err());
        assert!(validate_topic_filter("a#").is_err());
        assert!(validate_topic_filter("a/#/b").is_err());
        assert!(validate_topic_filter("+a/b").is_err());
    }

    #[test]
    fn matching() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b", "a"));

        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));

        assert!(topic_matches_filter("a", "#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(!topic_matches_filter("b/c", "a/#"));

        assert!(!topic_matches_filter("$SYS/foo", "#"));
        assert!(!topic_matches_filter("$SYS/foo", "+/foo"));
        assert!(topic_matches_filter("$SYS/foo", "$SYS/#"));
        assert!(topic_matches_filter("$SYS/foo", "$SYS/+"));
    }
}
