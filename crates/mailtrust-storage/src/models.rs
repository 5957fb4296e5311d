//! Database models

use chrono::{DateTime, Duration, Utc};
use mailtrust_common::types::{DkimKeyId, TlsReportId};
use mailtrust_common::{normalize_domain, DkimAlgorithm, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// DKIM key pair.
///
/// Rows are never updated; rotation inserts a new pair and the newest
/// one for a domain becomes active.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DkimKeyPair {
    pub id: DkimKeyId,
    pub domain: String,
    pub selector: String,
    #[sqlx(try_from = "String")]
    pub algorithm: DkimAlgorithm,
    /// PKCS#8 PEM
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    /// DER SubjectPublicKeyInfo
    pub public_key_der: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl DkimKeyPair {
    /// Owner name of the key's TXT record
    pub fn dns_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }
}

/// TLSA certificate usage (RFC 6698 section 2.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TlsaUsage {
    /// PKIX-TA: CA constraint
    PkixTa,
    /// PKIX-EE: service certificate constraint
    PkixEe,
    /// DANE-TA: trust anchor assertion
    DaneTa,
    /// DANE-EE: domain-issued certificate
    DaneEe,
}

impl TlsaUsage {
    /// Trust-anchor usages are matched against the last certificate of the
    /// presented chain, end-entity usages against the first.
    pub fn matches_trust_anchor(&self) -> bool {
        matches!(self, TlsaUsage::PkixTa | TlsaUsage::DaneTa)
    }
}

impl From<TlsaUsage> for u8 {
    fn from(value: TlsaUsage) -> Self {
        match value {
            TlsaUsage::PkixTa => 0,
            TlsaUsage::PkixEe => 1,
            TlsaUsage::DaneTa => 2,
            TlsaUsage::DaneEe => 3,
        }
    }
}

impl TryFrom<u8> for TlsaUsage {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TlsaUsage::PkixTa),
            1 => Ok(TlsaUsage::PkixEe),
            2 => Ok(TlsaUsage::DaneTa),
            3 => Ok(TlsaUsage::DaneEe),
            other => Err(Error::Validation(format!(
                "Unsupported TLSA certificate usage: {}",
                other
            ))),
        }
    }
}

/// TLSA selector (RFC 6698 section 2.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TlsaSelector {
    FullCertificate,
    SubjectPublicKeyInfo,
}

impl From<TlsaSelector> for u8 {
    fn from(value: TlsaSelector) -> Self {
        match value {
            TlsaSelector::FullCertificate => 0,
            TlsaSelector::SubjectPublicKeyInfo => 1,
        }
    }
}

impl TryFrom<u8> for TlsaSelector {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TlsaSelector::FullCertificate),
            1 => Ok(TlsaSelector::SubjectPublicKeyInfo),
            other => Err(Error::Validation(format!(
                "Unsupported TLSA selector: {}",
                other
            ))),
        }
    }
}

/// TLSA matching type (RFC 6698 section 2.1.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TlsaMatchingType {
    Full,
    Sha256,
    Sha512,
}

impl From<TlsaMatchingType> for u8 {
    fn from(value: TlsaMatchingType) -> Self {
        match value {
            TlsaMatchingType::Full => 0,
            TlsaMatchingType::Sha256 => 1,
            TlsaMatchingType::Sha512 => 2,
        }
    }
}

impl TryFrom<u8> for TlsaMatchingType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TlsaMatchingType::Full),
            1 => Ok(TlsaMatchingType::Sha256),
            2 => Ok(TlsaMatchingType::Sha512),
            other => Err(Error::Validation(format!(
                "Unsupported TLSA matching type: {}",
                other
            ))),
        }
    }
}

/// Cache key for TLSA records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsaKey {
    pub domain: String,
    pub port: u16,
}

impl TlsaKey {
    pub fn new(domain: &str, port: u16) -> Self {
        Self {
            domain: normalize_domain(domain),
            port,
        }
    }

    /// Owner name queried for this key, e.g. `_25._tcp.mx.example.com.`
    pub fn query_name(&self) -> String {
        format!("_{}._tcp.{}.", self.port, self.domain)
    }
}

impl fmt::Display for TlsaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

/// One cached TLSA record
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DaneRecord {
    pub domain: String,
    pub port: u16,
    #[sqlx(try_from = "u8")]
    pub usage: TlsaUsage,
    #[sqlx(try_from = "u8")]
    pub selector: TlsaSelector,
    #[sqlx(try_from = "u8")]
    pub matching_type: TlsaMatchingType,
    /// Lowercase hex of the certificate association data
    pub certificate_data: String,
    pub fetched_at: DateTime<Utc>,
    /// Seconds
    pub ttl: u32,
    /// The resolver set the AD flag on the answer
    pub dnssec_verified: bool,
}

impl DaneRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.fetched_at + Duration::seconds(i64::from(self.ttl))
    }

    /// Fresh until `fetched_at + ttl`; expired at that instant
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// MTA-STS policy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtaStsMode {
    Enforce,
    Testing,
    None,
}

impl MtaStsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MtaStsMode::Enforce => "enforce",
            MtaStsMode::Testing => "testing",
            MtaStsMode::None => "none",
        }
    }
}

impl fmt::Display for MtaStsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MtaStsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enforce" => Ok(MtaStsMode::Enforce),
            "testing" => Ok(MtaStsMode::Testing),
            "none" => Ok(MtaStsMode::None),
            other => Err(Error::Validation(format!("Invalid MTA-STS mode: {}", other))),
        }
    }
}

impl TryFrom<String> for MtaStsMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Cached MTA-STS policy, one per domain
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MtaStsPolicy {
    pub domain: String,
    pub version: String,
    #[sqlx(try_from = "String")]
    pub mode: MtaStsMode,
    /// Seconds
    pub max_age: u32,
    #[sqlx(json)]
    pub mx_patterns: Vec<String>,
    /// Policy body as fetched
    pub policy_text: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MtaStsPolicy {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Queued TLS report
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TlsReport {
    pub id: TlsReportId,
    pub report_id: String,
    pub domain: String,
    pub date_range_start: DateTime<Utc>,
    pub date_range_end: DateTime<Utc>,
    pub contact_info: Option<String>,
    /// RFC 8460 JSON document
    pub report_payload: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl TlsReport {
    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }
}

/// Input for queueing a TLS report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTlsReport {
    pub report_id: String,
    pub domain: String,
    pub date_range_start: DateTime<Utc>,
    pub date_range_end: DateTime<Utc>,
    pub contact_info: Option<String>,
    pub report_payload: String,
}
