//! Mailtrust - trust engine service and maintenance commands

use anyhow::Result;
use mailtrust_common::config::{Config, LogFormat, LoggingConfig};
use mailtrust_common::DkimAlgorithm;
use mailtrust_core::dkim::encode_dns_record;
use mailtrust_core::{
    CacheSweeper, DaneResolver, DkimKeyManager, DnsTlsaSource, HttpsPolicySource, MtaStsFetcher,
    TlsReportQueue,
};
use mailtrust_storage::{
    DatabasePool, DbDaneCacheRepository, DbDkimKeyRepository, DbMtaStsCacheRepository,
    DbTlsReportRepository,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(clap::Parser)]
#[cfg_attr(test, derive(Debug, PartialEq))]
#[clap(about, version)]
struct Args {
    /// Path of the configuration file (toml format)
    #[clap(short, long)]
    config: Option<String>,

    /// Run a maintenance command instead of the service
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
#[cfg_attr(test, derive(Debug, PartialEq))]
enum Command {
    /// Generate a new DKIM key for a domain and print its DNS record
    Keygen {
        /// Signing domain
        domain: String,
        /// Use Ed25519 instead of the configured key type
        #[clap(long)]
        ed25519: bool,
    },
    /// Evict expired DANE and MTA-STS cache entries once
    Sweep,
}

/// Cache-backed lookups shared by the service and the `sweep` command
struct TrustLookups {
    dane: Arc<DaneResolver>,
    mta_sts: Arc<MtaStsFetcher>,
}

impl TrustLookups {
    fn new(config: &Config, db_pool: &DatabasePool) -> Result<Self> {
        let dane = DaneResolver::new(
            Arc::new(DbDaneCacheRepository::new(db_pool.clone())),
            Arc::new(DnsTlsaSource::new(&config.dane)),
        );
        let mta_sts = MtaStsFetcher::new(
            Arc::new(DbMtaStsCacheRepository::new(db_pool.clone())),
            Arc::new(HttpsPolicySource::new(&config.mta_sts)?),
        );

        Ok(Self {
            dane: Arc::new(dane),
            mta_sts: Arc::new(mta_sts),
        })
    }

    fn sweeper(&self, config: &Config) -> CacheSweeper {
        CacheSweeper::new(
            self.dane.clone(),
            self.mta_sts.clone(),
            config.cache.sweep_interval(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = <Args as clap::Parser>::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(Path::new(path))?,
        None => Config::load()?,
    };

    init_logging(&config.logging);

    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;
    info!("Database ready");

    match args.command {
        Some(Command::Keygen { domain, ed25519 }) => keygen(&config, &db_pool, &domain, ed25519).await,
        Some(Command::Sweep) => sweep(&config, &db_pool).await,
        None => run(config, db_pool).await,
    }
}

async fn keygen(config: &Config, db_pool: &DatabasePool, domain: &str, ed25519: bool) -> Result<()> {
    let manager = DkimKeyManager::new(
        Arc::new(DbDkimKeyRepository::new(db_pool.clone())),
        config.dkim.clone(),
    );

    let algorithm = if ed25519 {
        DkimAlgorithm::Ed25519
    } else {
        config.dkim.key_type
    };
    let key = manager.rotate_with(domain, algorithm).await?;

    println!("{}. IN TXT {}", key.dns_name(), quote_txt(&encode_dns_record(&key)));
    Ok(())
}

/// Split a TXT value into quoted character-strings of at most 255 bytes
fn quote_txt(value: &str) -> String {
    value
        .as_bytes()
        .chunks(255)
        .map(|chunk| format!("\"{}\"", String::from_utf8_lossy(chunk)))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn sweep(config: &Config, db_pool: &DatabasePool) -> Result<()> {
    let lookups = TrustLookups::new(config, db_pool)?;
    let (dane, mta_sts) = lookups.sweeper(config).sweep_once().await;
    println!("Evicted {} TLSA records and {} MTA-STS policies", dane, mta_sts);
    Ok(())
}

async fn run(config: Config, db_pool: DatabasePool) -> Result<()> {
    info!(hostname = %config.server.hostname, "Starting Mailtrust trust engine...");

    db_pool.health_check().await?;

    let lookups = TrustLookups::new(&config, &db_pool)?;
    info!(
        resolver = %config.dane.resolver,
        require_dnssec = config.dane.require_dnssec,
        "Trust record caches ready"
    );

    // Reports are drained by an external sender; surface the backlog it faces
    let reports = TlsReportQueue::new(Arc::new(DbTlsReportRepository::new(db_pool.clone())));
    let pending = reports.pending_reports().await?;
    info!(pending = pending.len(), "TLS report outbox checked");

    let sweeper_handle = mailtrust_core::spawn_cache_sweeper(lookups.sweeper(&config));

    info!("Mailtrust started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    sweeper_handle.abort();

    info!("Mailtrust shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailtrust=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Args {
        <Args as clap::Parser>::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_no_subcommand_runs_service() {
        assert_eq!(
            parse(&["mailtrust"]),
            Args {
                config: None,
                command: None
            }
        );
    }

    #[test]
    fn test_keygen_args() {
        assert_eq!(
            parse(&["mailtrust", "-c", "/etc/mailtrust.toml", "keygen", "example.com", "--ed25519"]),
            Args {
                config: Some("/etc/mailtrust.toml".to_string()),
                command: Some(Command::Keygen {
                    domain: "example.com".to_string(),
                    ed25519: true
                })
            }
        );
        assert_eq!(
            parse(&["mailtrust", "sweep"]).command,
            Some(Command::Sweep)
        );
    }

    #[test]
    fn test_quote_txt_splits_long_values() {
        let value = "p=".to_string() + &"A".repeat(300);
        let quoted = quote_txt(&value);
        assert!(quoted.starts_with("\"p=AAA"));
        assert_eq!(quoted.matches('"').count(), 4);
        assert_eq!(quote_txt("v=DKIM1"), "\"v=DKIM1\"");
    }

    #[tokio::test]
    async fn test_service_sweeper_evicts_database_caches() {
        use mailtrust_storage::{
            DaneRecord, TlsaKey, TlsaMatchingType, TlsaSelector, TlsaUsage, TrustRecordStore,
        };

        let db_pool = DatabasePool::in_memory().await.unwrap();
        db_pool.migrate().await.unwrap();
        let old = mailtrust_common::now_utc_seconds() - chrono::Duration::days(1);

        let key = TlsaKey::new("mx.example.com", 25);
        DbDaneCacheRepository::new(db_pool.clone())
            .save(
                &key,
                &vec![DaneRecord {
                    domain: key.domain.clone(),
                    port: key.port,
                    usage: TlsaUsage::DaneEe,
                    selector: TlsaSelector::SubjectPublicKeyInfo,
                    matching_type: TlsaMatchingType::Sha256,
                    certificate_data: "00".repeat(32),
                    fetched_at: old,
                    ttl: 60,
                    dnssec_verified: true,
                }],
            )
            .await
            .unwrap();
        let policy = mailtrust_core::mta_sts::parse_policy(
            "example.com",
            "version: STSv1\nmode: none\nmax_age: 60\n",
            old,
        )
        .unwrap();
        DbMtaStsCacheRepository::new(db_pool.clone())
            .save(&"example.com".to_string(), &policy)
            .await
            .unwrap();

        let config = Config::default();
        let lookups = TrustLookups::new(&config, &db_pool).unwrap();
        let sweeper = lookups.sweeper(&config);

        assert_eq!(sweeper.sweep_once().await, (1, 1));
        assert_eq!(sweeper.sweep_once().await, (0, 0));
    }
}
