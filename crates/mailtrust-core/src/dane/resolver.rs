//! TLSA record retrieval through a DNSSEC-validating resolver
//!
//! Queries are sent with EDNS(0) and the DO bit; the resolver's AD flag
//! on the answer is recorded per record as `dnssec_verified`. Truncated
//! UDP answers are retried over TCP.

use super::DaneError;
use crate::trust_cache::TrustRecordCache;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtrust_common::config::DaneConfig;
use mailtrust_common::now_utc_seconds;
use mailtrust_storage::{
    DaneRecord, TlsaKey, TlsaMatchingType, TlsaSelector, TlsaUsage, TrustRecordStore,
};
use rsa::rand_core::{OsRng, RngCore};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};
use trust_dns_resolver::proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_resolver::proto::rr::{Name, RData, RecordType};

/// One TLSA record as it came off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsaData {
    pub usage: TlsaUsage,
    pub selector: TlsaSelector,
    pub matching_type: TlsaMatchingType,
    pub certificate_data: Vec<u8>,
    pub ttl: u32,
}

/// TLSA answer for one `(domain, port)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsaAnswer {
    pub records: Vec<TlsaData>,
    /// The resolver vouched for the answer (AD flag)
    pub authenticated: bool,
}

impl TlsaAnswer {
    pub fn into_records(self, key: &TlsaKey, fetched_at: DateTime<Utc>) -> Vec<DaneRecord> {
        self.records
            .into_iter()
            .map(|data| DaneRecord {
                domain: key.domain.clone(),
                port: key.port,
                usage: data.usage,
                selector: data.selector,
                matching_type: data.matching_type,
                certificate_data: hex::encode(&data.certificate_data),
                fetched_at,
                ttl: data.ttl,
                dnssec_verified: self.authenticated,
            })
            .collect()
    }
}

/// Where TLSA answers come from
#[async_trait]
pub trait TlsaSource: Send + Sync {
    async fn query_tlsa(&self, key: &TlsaKey) -> Result<TlsaAnswer, DaneError>;
}

/// Append the DNS port to a resolver address that lacks one
pub fn normalize_resolver_address(addr: &str) -> String {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return SocketAddr::new(ip, 53).to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:53", addr),
    }
}

/// Build a TLSA query with EDNS(0), DO and AD set
pub fn build_query(key: &TlsaKey, edns_payload: u16) -> Result<Message, DaneError> {
    let name = Name::from_ascii(key.query_name())
        .map_err(|e| DaneError::Lookup(format!("invalid query name {}: {}", key.query_name(), e)))?;

    let mut edns = Edns::new();
    edns.set_max_payload(edns_payload);
    edns.set_dnssec_ok(true);
    edns.set_version(0);

    let mut message = Message::new();
    message
        .set_id(OsRng.next_u32() as u16)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_authentic_data(true)
        .add_query(Query::query(name, RecordType::TLSA));
    message.set_edns(edns);

    Ok(message)
}

/// Extract TLSA records from a response.
///
/// A non-success response code is an error. Records with usage, selector
/// or matching values outside RFC 6698 are skipped.
pub fn parse_answer(response: &Message) -> Result<TlsaAnswer, DaneError> {
    if response.response_code() != ResponseCode::NoError {
        return Err(DaneError::Lookup(format!(
            "resolver answered {}",
            response.response_code()
        )));
    }

    let mut records = Vec::new();
    for record in response.answers() {
        let Some(RData::TLSA(tlsa)) = record.data() else {
            continue;
        };

        let fields = (
            TlsaUsage::try_from(u8::from(tlsa.cert_usage())),
            TlsaSelector::try_from(u8::from(tlsa.selector())),
            TlsaMatchingType::try_from(u8::from(tlsa.matching())),
        );
        match fields {
            (Ok(usage), Ok(selector), Ok(matching_type)) => records.push(TlsaData {
                usage,
                selector,
                matching_type,
                certificate_data: tlsa.cert_data().to_vec(),
                ttl: record.ttl(),
            }),
            _ => debug!(name = %record.name(), "Skipping TLSA record with unsupported parameters"),
        }
    }

    Ok(TlsaAnswer {
        records,
        authenticated: response.authentic_data(),
    })
}

/// TLSA source speaking DNS to one configured resolver
pub struct DnsTlsaSource {
    resolver: String,
    timeout: Duration,
    edns_payload: u16,
}

impl DnsTlsaSource {
    pub fn new(config: &DaneConfig) -> Self {
        Self {
            resolver: normalize_resolver_address(&config.resolver),
            timeout: config.timeout(),
            edns_payload: config.edns_payload,
        }
    }

    /// Point queries at another resolver; `:53` is appended when no port
    /// is given
    pub fn set_resolver(&mut self, addr: &str) {
        self.resolver = normalize_resolver_address(addr);
    }

    pub fn resolver(&self) -> &str {
        &self.resolver
    }

    async fn exchange(&self, query: &Message) -> Result<Message, DaneError> {
        let payload = query
            .to_vec()
            .map_err(|e| DaneError::Lookup(format!("failed to encode query: {}", e)))?;

        let server = lookup_host(&self.resolver)
            .await
            .map_err(|e| DaneError::Lookup(format!("invalid resolver {}: {}", self.resolver, e)))?
            .next()
            .ok_or_else(|| DaneError::Lookup(format!("resolver {} has no address", self.resolver)))?;

        let response = timeout(self.timeout, self.exchange_udp(server, query.id(), &payload))
            .await
            .map_err(|_| DaneError::Lookup(format!("query to {} timed out", server)))??;

        if !response.truncated() {
            return Ok(response);
        }

        debug!(resolver = %server, "Truncated TLSA answer, retrying over TCP");
        timeout(self.timeout, self.exchange_tcp(server, query.id(), &payload))
            .await
            .map_err(|_| DaneError::Lookup(format!("TCP query to {} timed out", server)))?
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        id: u16,
        payload: &[u8],
    ) -> Result<Message, DaneError> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await.map_err(io_error)?;
        socket.connect(server).await.map_err(io_error)?;
        socket.send(payload).await.map_err(io_error)?;

        let mut buf = vec![0u8; usize::from(self.edns_payload)];
        loop {
            let len = socket.recv(&mut buf).await.map_err(io_error)?;
            match Message::from_vec(&buf[..len]) {
                Ok(message) if message.id() == id => return Ok(message),
                _ => debug!(resolver = %server, "Ignoring unrelated datagram"),
            }
        }
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        id: u16,
        payload: &[u8],
    ) -> Result<Message, DaneError> {
        let length = u16::try_from(payload.len())
            .map_err(|_| DaneError::Lookup("query too large for TCP".to_string()))?;

        let mut stream = TcpStream::connect(server).await.map_err(io_error)?;
        stream.write_all(&length.to_be_bytes()).await.map_err(io_error)?;
        stream.write_all(payload).await.map_err(io_error)?;

        let length = stream.read_u16().await.map_err(io_error)?;
        let mut buf = vec![0u8; usize::from(length)];
        stream.read_exact(&mut buf).await.map_err(io_error)?;

        let message = Message::from_vec(&buf)
            .map_err(|e| DaneError::Lookup(format!("malformed TCP answer: {}", e)))?;
        if message.id() != id {
            return Err(DaneError::Lookup("TCP answer id mismatch".to_string()));
        }
        Ok(message)
    }
}

fn io_error(e: std::io::Error) -> DaneError {
    DaneError::Lookup(e.to_string())
}

#[async_trait]
impl TlsaSource for DnsTlsaSource {
    async fn query_tlsa(&self, key: &TlsaKey) -> Result<TlsaAnswer, DaneError> {
        let query = build_query(key, self.edns_payload)?;
        let response = self.exchange(&query).await?;
        parse_answer(&response)
    }
}

/// Cached TLSA lookups
pub struct DaneResolver {
    cache: TrustRecordCache<TlsaKey, Vec<DaneRecord>>,
    source: Arc<dyn TlsaSource>,
}

impl DaneResolver {
    pub fn new(
        store: Arc<dyn TrustRecordStore<TlsaKey, Vec<DaneRecord>>>,
        source: Arc<dyn TlsaSource>,
    ) -> Self {
        Self {
            cache: TrustRecordCache::new("dane", store),
            source,
        }
    }

    /// TLSA records for `_port._tcp.domain`, from cache while fresh.
    ///
    /// An empty list means the name has no TLSA records. Resolver
    /// failures are errors and are never cached.
    pub async fn lookup_tlsa(&self, domain: &str, port: u16) -> Result<Vec<DaneRecord>, DaneError> {
        let key = TlsaKey::new(domain, port);

        self.cache
            .get_or_fetch(&key, || async {
                let answer = self.source.query_tlsa(&key).await?;
                let authenticated = answer.authenticated;
                let records = answer.into_records(&key, now_utc_seconds());

                info!(
                    domain = %key.domain,
                    port,
                    count = records.len(),
                    dnssec_verified = authenticated,
                    "Fetched TLSA records"
                );
                Ok(records)
            })
            .await
    }

    /// Evict expired TLSA records
    pub async fn clear_cache(&self) -> mailtrust_common::Result<u64> {
        self.cache.evict_expired().await
    }
}
