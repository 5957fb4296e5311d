//! Policy document parsing and MX pattern matching

use chrono::{DateTime, Duration, Utc};
use mailtrust_storage::{MtaStsMode, MtaStsPolicy};
use regex::RegexBuilder;
use thiserror::Error;

/// RFC 8461 caps max_age at one year
pub const MAX_AGE_LIMIT: u32 = 31_557_600;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyParseError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid mode")]
    InvalidMode,

    #[error("invalid max_age")]
    InvalidMaxAge,

    #[error("unsupported version")]
    UnsupportedVersion,
}

/// Parse a policy body fetched for `domain`.
///
/// Blank lines and `#` comments are skipped. Repeated `mx` lines
/// accumulate in order; other keys overwrite. Unknown keys are ignored.
pub fn parse_policy(
    domain: &str,
    text: &str,
    fetched_at: DateTime<Utc>,
) -> Result<MtaStsPolicy, PolicyParseError> {
    let mut version = None;
    let mut mode = None;
    let mut max_age = None;
    let mut mx_patterns = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "version" => version = Some(value.to_string()),
            "mode" => {
                mode = Some(
                    value
                        .parse::<MtaStsMode>()
                        .map_err(|_| PolicyParseError::InvalidMode)?,
                )
            }
            "max_age" => {
                let secs = value
                    .parse::<u32>()
                    .map_err(|_| PolicyParseError::InvalidMaxAge)?;
                if secs > MAX_AGE_LIMIT {
                    return Err(PolicyParseError::InvalidMaxAge);
                }
                max_age = Some(secs);
            }
            "mx" => mx_patterns.push(value.to_ascii_lowercase()),
            _ => {}
        }
    }

    let version = version.ok_or(PolicyParseError::MissingField("version"))?;
    if version != "STSv1" {
        return Err(PolicyParseError::UnsupportedVersion);
    }
    let mode = mode.ok_or(PolicyParseError::MissingField("mode"))?;
    let max_age = max_age.ok_or(PolicyParseError::MissingField("max_age"))?;
    if mode != MtaStsMode::None && mx_patterns.is_empty() {
        return Err(PolicyParseError::MissingField("mx"));
    }

    Ok(MtaStsPolicy {
        domain: domain.to_string(),
        version,
        mode,
        max_age,
        mx_patterns,
        policy_text: text.to_string(),
        fetched_at,
        expires_at: fetched_at + Duration::seconds(i64::from(max_age)),
    })
}

/// Match an MX hostname against a policy pattern.
///
/// `*` stands for one or more characters, so `*.example.com` covers
/// `mail.example.com` and `a.b.example.com` but not `example.com`.
pub fn mx_pattern_matches(pattern: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    let expr = pattern
        .trim_end_matches('.')
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".+");

    match RegexBuilder::new(&format!("^{}$", expr))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re.is_match(host),
        Err(_) => false,
    }
}
