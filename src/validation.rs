//! Validation helpers for broker and Telegram settings.
//!
//! These checks run once at startup from [`crate::config::Config::validate`]; a failure
//! there stops the process before any connection is opened.

use std::collections::HashSet;

/// Validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("QoS must be 0, 1 or 2 (got {0})")]
    InvalidQos(u8),

    #[error("topic filter is empty")]
    EmptyTopic,

    #[error("topic filter '{topic}' is invalid: {reason}")]
    InvalidTopicFilter { topic: String, reason: &'static str },

    #[error("topic prefix '{0}' must not contain wildcards or NUL")]
    InvalidTopicPrefix(String),

    #[error("host is empty")]
    EmptyHost,

    #[error("port must be non-zero")]
    InvalidPort,

    #[error("invalid Telegram user id '{0}'")]
    InvalidUserId(String),
}

/// Validate an MQTT QoS level.
pub fn validate_qos(qos: u8) -> Result<u8, ValidationError> {
    match qos {
        0..=2 => Ok(qos),
        other => Err(ValidationError::InvalidQos(other)),
    }
}

/// Validate an MQTT subscription filter such as `msh/2/json/#` or `msh/+/2/json/#`.
///
/// `#` must be the whole last level; `+` must be a whole level.
pub fn validate_topic_filter(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    let invalid = |reason| ValidationError::InvalidTopicFilter {
        topic: topic.to_string(),
        reason,
    };
    if topic.contains('\0') {
        return Err(invalid("contains NUL"));
    }
    let levels: Vec<&str> = topic.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(invalid("'#' must be the last level on its own"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// Validate a proxy topic prefix. Empty means "no rewrite".
pub fn validate_topic_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.contains(['#', '+', '\0']) {
        return Err(ValidationError::InvalidTopicPrefix(prefix.to_string()));
    }
    Ok(())
}

pub fn validate_endpoint(host: &str, port: u16) -> Result<(), ValidationError> {
    if host.trim().is_empty() {
        return Err(ValidationError::EmptyHost);
    }
    if port == 0 {
        return Err(ValidationError::InvalidPort);
    }
    Ok(())
}

/// Parse a comma separated list of Telegram user ids, e.g. `"123, 456,789"`.
///
/// Blank input yields an empty list; duplicates are removed keeping first occurrence.
pub fn parse_user_id_list(raw: &str) -> Result<Vec<i64>, ValidationError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id: i64 = part
            .parse()
            .map_err(|_| ValidationError::InvalidUserId(part.to_string()))?;
        if seen.insert(id) {
            ids.push(id);
        }
    }
    Ok(ids)
}
