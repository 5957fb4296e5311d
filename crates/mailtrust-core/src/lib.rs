//! Mailtrust Core - mail transport trust engine
//!
//! DKIM key management, signing and verification; DANE TLSA lookup and
//! certificate matching; MTA-STS policy fetch and enforcement; TLS
//! reporting. DANE and MTA-STS lookups go through a persistent
//! [`TrustRecordCache`].

pub mod dane;
pub mod dkim;
pub mod mta_sts;
pub mod sweeper;
pub mod tlsrpt;
pub mod transport;
pub mod trust_cache;

pub use dane::{DaneError, DaneMatcher, DaneResolver, DnsTlsaSource};
pub use dkim::{DkimError, DkimKeyManager, DkimSigner, DkimVerifier, DnsKeyLookup, VerificationResult};
pub use mta_sts::{HttpsPolicySource, MtaStsEnforcer, MtaStsError, MtaStsFetcher, PolicyDecision};
pub use sweeper::{spawn_cache_sweeper, CacheSweeper};
pub use tlsrpt::{TlsReportQueue, TlsRptCollector, TlsRptReport};
pub use transport::{TransportGuard, TransportVerdict};
pub use trust_cache::{Freshness, TrustRecordCache};
