//! MailTrust Common - Shared types and utilities
//!
//! This crate provides configuration, error types and small shared
//! types used by every MailTrust component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{normalize_domain, now_utc_seconds, DkimAlgorithm};
