//! DKIM (DomainKeys Identified Mail) key management, signing and verification
//!
//! Implements RFC 6376 with the `rsa-sha256` algorithm and RFC 8463
//! `ed25519-sha256`. Outbound signatures always use relaxed/relaxed
//! canonicalization; inbound verification accepts all four combinations.

pub mod canon;
pub mod keys;
pub mod signer;
pub mod tags;
pub mod verifier;

pub use canon::{Canonicalization, HeaderField, ParsedMessage};
pub use keys::{
    encode_dns_record, generate_key_pair, generate_selector, parse_dns_record, DkimKeyManager,
    DkimPrivateKey, DkimPublicKey,
};
pub use signer::{sign_message, DkimSigner};
pub use tags::DkimSignature;
pub use verifier::{DkimKeyLookup, DkimVerifier, DnsKeyLookup, VerificationResult};

use thiserror::Error;

/// DKIM errors
#[derive(Error, Debug)]
pub enum DkimError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key has been revoked")]
    KeyRevoked,

    #[error("key lookup failed: {0}")]
    KeyLookup(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid DKIM-Signature: {0}")]
    InvalidSignature(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature expired")]
    SignatureExpired,

    #[error("body hash mismatch")]
    BodyHashMismatch,

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Storage(#[from] mailtrust_common::Error),
}

impl From<DkimError> for mailtrust_common::Error {
    fn from(err: DkimError) -> Self {
        match err {
            DkimError::Storage(inner) => inner,
            DkimError::KeyLookup(msg) => mailtrust_common::Error::Dns(msg),
            DkimError::MalformedMessage(_) | DkimError::InvalidSignature(_) => {
                mailtrust_common::Error::Parse(err.to_string())
            }
            other => mailtrust_common::Error::Crypto(other.to_string()),
        }
    }
}
