//! MailTrust Storage - Persistence for the trust engine
//!
//! This crate stores DKIM key pairs, the DANE and MTA-STS trust record
//! caches and the TLS report outbox. Every repository has a SQLite
//! implementation and an in-memory one.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
