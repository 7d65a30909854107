//! Topic name and topic filter rules (MQTT 3.1.1 section 4.7)

use thiserror::Error;

const MAX_TOPIC_LEN: usize = 65_535;

/// Validation errors for topics and filters
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic exceeds {MAX_TOPIC_LEN} bytes")]
    TooLong,
    #[error("topic must not contain NUL")]
    NulCharacter,
    #[error("topic names must not contain wildcards")]
    WildcardInName,
    #[error("'#' must be the last level and alone in it")]
    MisplacedMultiLevel,
    #[error("'+' must occupy a whole level")]
    MisplacedSingleLevel,
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// A concrete topic a message is published to
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// A subscription filter, possibly with `+` and `#`
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(TopicError::MisplacedMultiLevel);
        }
        if level.contains('+') && level != "+" {
            return Err(TopicError::MisplacedSingleLevel);
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`
///
/// `+` matches exactly one level, `#` matches the remaining levels including
/// the parent (`a/#` matches `a`). Filters starting with a wildcard do not
/// match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
