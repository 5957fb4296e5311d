//! MTA-STS (RFC 8461) policy fetch, parsing and enforcement

pub mod enforcer;
pub mod fetcher;
pub mod policy;

pub use enforcer::{evaluate, MtaStsEnforcer, PolicyDecision};
pub use fetcher::{policy_url, HttpsPolicySource, MtaStsFetcher, PolicySource};
pub use policy::{mx_pattern_matches, parse_policy, PolicyParseError};

use thiserror::Error;

/// MTA-STS errors
#[derive(Error, Debug)]
pub enum MtaStsError {
    #[error("policy fetch failed: {0}")]
    Fetch(String),

    #[error("policy host answered HTTP {0}")]
    Status(u16),

    #[error("refusing non-HTTPS policy URL: {0}")]
    InsecureUrl(String),

    #[error("policy body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("invalid policy: {0}")]
    Parse(#[from] PolicyParseError),
}

impl From<MtaStsError> for mailtrust_common::Error {
    fn from(err: MtaStsError) -> Self {
        match err {
            MtaStsError::Parse(e) => mailtrust_common::Error::Parse(e.to_string()),
            other => mailtrust_common::Error::Http(other.to_string()),
        }
    }
}
