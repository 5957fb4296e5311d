//! Policy retrieval over HTTPS with a persistent cache in front

use super::policy::parse_policy;
use super::MtaStsError;
use crate::trust_cache::TrustRecordCache;
use async_trait::async_trait;
use mailtrust_common::config::MtaStsConfig;
use mailtrust_common::{normalize_domain, now_utc_seconds};
use mailtrust_storage::{MtaStsPolicy, TrustRecordStore};
use reqwest::{redirect, Client, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Well-known policy location for `domain`
pub fn policy_url(domain: &str) -> String {
    format!("https://mta-sts.{}/.well-known/mta-sts.txt", domain)
}

/// Where policy documents come from
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_policy_text(&self, domain: &str) -> Result<String, MtaStsError>;
}

/// Fetches policies from `https://mta-sts.{domain}`
pub struct HttpsPolicySource {
    client: Client,
    max_bytes: usize,
}

impl HttpsPolicySource {
    pub fn new(config: &MtaStsConfig) -> Result<Self, MtaStsError> {
        // RFC 8461 section 3.3: redirects must not be followed
        let client = Client::builder()
            .https_only(true)
            .redirect(redirect::Policy::none())
            .timeout(config.timeout())
            .user_agent(concat!("mailtrust/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MtaStsError::Fetch(e.to_string()))?;

        Ok(Self {
            client,
            max_bytes: config.max_policy_bytes,
        })
    }

    /// GET a policy document. Anything but an `https://` URL is refused
    /// before a connection is made.
    pub async fn fetch_url(&self, url: &str) -> Result<String, MtaStsError> {
        if !url.starts_with("https://") {
            return Err(MtaStsError::InsecureUrl(url.to_string()));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MtaStsError::Fetch(e.to_string()))?;

        read_policy_body(response, self.max_bytes).await
    }
}

#[async_trait]
impl PolicySource for HttpsPolicySource {
    async fn fetch_policy_text(&self, domain: &str) -> Result<String, MtaStsError> {
        self.fetch_url(&policy_url(domain)).await
    }
}

async fn read_policy_body(mut response: Response, max_bytes: usize) -> Result<String, MtaStsError> {
    if response.status() != StatusCode::OK {
        return Err(MtaStsError::Status(response.status().as_u16()));
    }
    if matches!(response.content_length(), Some(len) if len > max_bytes as u64) {
        return Err(MtaStsError::TooLarge(max_bytes));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| MtaStsError::Fetch(e.to_string()))?
    {
        if body.len() + chunk.len() > max_bytes {
            return Err(MtaStsError::TooLarge(max_bytes));
        }
        body.extend_from_slice(&chunk);
    }

    String::from_utf8(body).map_err(|_| MtaStsError::Fetch("policy body is not UTF-8".to_string()))
}

/// Cache-first MTA-STS policy fetcher
pub struct MtaStsFetcher {
    cache: TrustRecordCache<String, MtaStsPolicy>,
    source: Arc<dyn PolicySource>,
}

impl MtaStsFetcher {
    pub fn new(
        store: Arc<dyn TrustRecordStore<String, MtaStsPolicy>>,
        source: Arc<dyn PolicySource>,
    ) -> Self {
        Self {
            cache: TrustRecordCache::new("mta-sts", store),
            source,
        }
    }

    /// Current policy for `domain`.
    ///
    /// A fresh cached policy is returned as-is. When refreshing fails
    /// (unreachable host, bad status, malformed body) a previously cached
    /// policy stays authoritative even past its expiry; without one the
    /// error is returned.
    pub async fn fetch_policy(&self, domain: &str) -> Result<MtaStsPolicy, MtaStsError> {
        let domain = normalize_domain(domain);

        let result = self
            .cache
            .get_or_fetch(&domain, || async {
                let text = self.source.fetch_policy_text(&domain).await?;
                let policy = parse_policy(&domain, &text, now_utc_seconds())?;
                info!(
                    domain = %domain,
                    mode = %policy.mode,
                    max_age = policy.max_age,
                    "Fetched MTA-STS policy"
                );
                Ok(policy)
            })
            .await;

        match result {
            Ok(policy) => Ok(policy),
            Err(e) => match self.cache.peek(&domain).await {
                Some(stale) => {
                    warn!(domain = %domain, error = %e, "MTA-STS refresh failed, keeping cached policy");
                    Ok(stale)
                }
                None => {
                    debug!(domain = %domain, error = %e, "No MTA-STS policy");
                    Err(e)
                }
            },
        }
    }

    /// Evict expired policies
    pub async fn clear_cache(&self) -> mailtrust_common::Result<u64> {
        self.cache.evict_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mailtrust_storage::{MemoryStore, MtaStsMode};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const POLICY: &str = "version: STSv1\nmode: enforce\nmx: *.example.com\nmax_age: 86400\n";

    struct ScriptedSource {
        replies: Mutex<Vec<Result<String, MtaStsError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<String, MtaStsError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PolicySource for ScriptedSource {
        async fn fetch_policy_text(&self, _domain: &str) -> Result<String, MtaStsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().await.remove(0)
        }
    }

    #[test]
    fn test_policy_url() {
        assert_eq!(
            policy_url("example.com"),
            "https://mta-sts.example.com/.well-known/mta-sts.txt"
        );
    }

    #[tokio::test]
    async fn test_fetch_caches_policy() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(POLICY.to_string())]));
        let fetcher = MtaStsFetcher::new(Arc::new(MemoryStore::new()), source.clone());

        let first = fetcher.fetch_policy("Example.COM").await.unwrap();
        let second = fetcher.fetch_policy("example.com").await.unwrap();

        assert_eq!(first.domain, "example.com");
        assert_eq!(first.mode, MtaStsMode::Enforce);
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_policy_survives_failed_refresh() {
        let store = Arc::new(MemoryStore::new());
        let fetched_at = now_utc_seconds() - Duration::days(2);
        let stale = parse_policy("example.com", POLICY, fetched_at).unwrap();
        store.save(&"example.com".to_string(), &stale).await.unwrap();

        let source = Arc::new(ScriptedSource::new(vec![
            Ok("version: STSv1\nmode: bogus\n".to_string()),
            Err(MtaStsError::Status(404)),
        ]));
        let fetcher = MtaStsFetcher::new(store, source);

        // Malformed body
        assert_eq!(fetcher.fetch_policy("example.com").await.unwrap(), stale);
        // Unreachable
        assert_eq!(fetcher.fetch_policy("example.com").await.unwrap(), stale);
    }

    #[tokio::test]
    async fn test_no_policy_without_cache() {
        let source = Arc::new(ScriptedSource::new(vec![Err(MtaStsError::Status(404))]));
        let fetcher = MtaStsFetcher::new(Arc::new(MemoryStore::new()), source);

        assert!(matches!(
            fetcher.fetch_policy("example.com").await,
            Err(MtaStsError::Status(404))
        ));
    }

    #[tokio::test]
    async fn test_plaintext_url_is_never_contacted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/mta-sts.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(POLICY))
            .mount(&server)
            .await;

        let source = HttpsPolicySource::new(&MtaStsConfig::default()).unwrap();
        let url = format!("{}/.well-known/mta-sts.txt", server.uri());
        let result = source.fetch_url(&url).await;

        assert!(matches!(result, Err(MtaStsError::InsecureUrl(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    async fn served(template: ResponseTemplate) -> (MockServer, Response) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(template)
            .mount(&server)
            .await;
        let response = Client::new().get(server.uri()).send().await.unwrap();
        (server, response)
    }

    #[tokio::test]
    async fn test_body_limits() {
        let (_server, ok) = served(ResponseTemplate::new(200).set_body_string(POLICY)).await;
        assert_eq!(read_policy_body(ok, 1024).await.unwrap(), POLICY);

        let (_server, large) = served(ResponseTemplate::new(200).set_body_string("x".repeat(2048))).await;
        assert!(matches!(
            read_policy_body(large, 1024).await,
            Err(MtaStsError::TooLarge(1024))
        ));

        let (_server, missing) = served(ResponseTemplate::new(404)).await;
        assert!(matches!(
            read_policy_body(missing, 1024).await,
            Err(MtaStsError::Status(404))
        ));
    }
}
