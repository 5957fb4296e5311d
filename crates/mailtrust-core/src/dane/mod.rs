//! DANE (RFC 6698 / RFC 7672) TLSA lookup and certificate matching

pub mod matcher;
pub mod resolver;

pub use matcher::{record_matches, DaneMatcher};
pub use resolver::{DaneResolver, DnsTlsaSource, TlsaAnswer, TlsaData, TlsaSource};

use thiserror::Error;

/// DANE errors
#[derive(Error, Debug)]
pub enum DaneError {
    /// Resolver unreachable, timed out, or answered with a failure code.
    /// DANE status is unknown, which is not the same as "no records".
    #[error("TLSA lookup failed: {0}")]
    Lookup(String),

    #[error("peer presented no certificates")]
    NoPeerCertificates,

    #[error("no TLSA record for {domain}:{port} matches the presented chain")]
    NoMatch { domain: String, port: u16 },

    #[error("TLSA records for {domain}:{port} are not DNSSEC-authenticated")]
    Unauthenticated { domain: String, port: u16 },

    #[error("certificate error: {0}")]
    Certificate(String),
}

impl DaneError {
    /// Errors that forbid delivery to this host, as opposed to leaving
    /// its DANE status undetermined
    pub fn is_fail_closed(&self) -> bool {
        matches!(self, DaneError::NoMatch { .. } | DaneError::NoPeerCertificates)
    }
}

impl From<DaneError> for mailtrust_common::Error {
    fn from(err: DaneError) -> Self {
        match err {
            DaneError::Lookup(msg) => mailtrust_common::Error::Dns(msg),
            DaneError::Certificate(msg) => mailtrust_common::Error::Crypto(msg),
            other => mailtrust_common::Error::Validation(other.to_string()),
        }
    }
}
