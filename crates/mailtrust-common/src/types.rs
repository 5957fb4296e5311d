//! Common types for MailTrust

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for DKIM key pairs
pub type DkimKeyId = Uuid;

/// Row identifier of a queued TLS report
pub type TlsReportId = i64;

/// DKIM signing algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimAlgorithm {
    Rsa,
    Ed25519,
}

impl DkimAlgorithm {
    /// Key type as published in the `k=` tag of a DKIM key record
    pub fn as_str(&self) -> &'static str {
        match self {
            DkimAlgorithm::Rsa => "rsa",
            DkimAlgorithm::Ed25519 => "ed25519",
        }
    }

    /// Signature algorithm as written in the `a=` tag of a DKIM-Signature
    pub fn signature_algorithm(&self) -> &'static str {
        match self {
            DkimAlgorithm::Rsa => "rsa-sha256",
            DkimAlgorithm::Ed25519 => "ed25519-sha256",
        }
    }
}

impl fmt::Display for DkimAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DkimAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa" => Ok(DkimAlgorithm::Rsa),
            "ed25519" => Ok(DkimAlgorithm::Ed25519),
            other => Err(crate::Error::Validation(format!(
                "Unsupported DKIM key type: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for DkimAlgorithm {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

/// Normalize a domain or host name for use as a lookup key.
///
/// Lowercases and strips a single trailing root dot, so that
/// `Example.COM.` and `example.com` refer to the same cache entry.
pub fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim();
    trimmed
        .strip_suffix('.')
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

/// Current time truncated to whole seconds.
///
/// Every persisted timestamp goes through this so that stored values
/// compare chronologically as text.
pub fn now_utc_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.COM."), "example.com");
        assert_eq!(normalize_domain(" mx1.example.org "), "mx1.example.org");
        assert_eq!(normalize_domain("example.net"), "example.net");
    }

    #[test]
    fn test_dkim_algorithm_parse() {
        assert_eq!("RSA".parse::<DkimAlgorithm>().unwrap(), DkimAlgorithm::Rsa);
        assert_eq!(
            DkimAlgorithm::try_from("ed25519".to_string()).unwrap(),
            DkimAlgorithm::Ed25519
        );
        assert!("dsa".parse::<DkimAlgorithm>().is_err());
    }

    #[test]
    fn test_signature_algorithm_names() {
        assert_eq!(DkimAlgorithm::Rsa.signature_algorithm(), "rsa-sha256");
        assert_eq!(DkimAlgorithm::Ed25519.signature_algorithm(), "ed25519-sha256");
    }

    #[test]
    fn test_now_has_no_subseconds() {
        assert_eq!(now_utc_seconds().timestamp_subsec_nanos(), 0);
    }
}
