//! Fetcher module for downloading pages through the disk cache

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::cache::DiskCache;
use super::types::{CacheError, FetchedPage, FetcherConfig, OpenUrlOptions, Result};

/// Rate limiter shared by every request made through one fetcher
type RequestRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::QuantaClock,
>;

/// Builds the HTTP client on first use.
pub type ClientFactory = Box<dyn Fn() -> Result<Arc<dyn HttpClient>> + Send + Sync>;

/// Transport used to retrieve a page on a cache miss.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url`, returning the body and what the server reported about the request.
    async fn get(&self, url: &str) -> Result<FetchedPage>;
}

/// Default transport over `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        Self::with_config(&FetcherConfig::default())
    }

    pub fn with_config(config: &FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .gzip(config.gzip)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<FetchedPage> {
        let parsed = Url::parse(url).map_err(|source| CacheError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let response = self.client.get(parsed).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        Ok(FetchedPage {
            body,
            status: status.as_u16(),
            final_url,
        })
    }
}

/// Fetch-or-compute front end for HTTP pages.
///
/// Without a cache every call goes to the network.
pub struct UrlFetcher {
    cache: Option<Arc<DiskCache>>,
    client: OnceCell<Arc<dyn HttpClient>>,
    client_factory: ClientFactory,
    rate_limiter: Option<RequestRateLimiter>,
}

impl fmt::Debug for UrlFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlFetcher")
            .field("cache", &self.cache.as_ref().map(|c| c.root().to_path_buf()))
            .field("client_initialized", &self.client.initialized())
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

impl UrlFetcher {
    /// Fetcher using the default `reqwest` transport.
    pub fn new(cache: Option<Arc<DiskCache>>) -> Self {
        Self::with_config(cache, FetcherConfig::default())
    }

    /// Fetcher whose default transport and rate limit come from `config`.
    pub fn with_config(cache: Option<Arc<DiskCache>>, config: FetcherConfig) -> Self {
        let rate_limiter = config
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));
        let client_factory: ClientFactory = Box::new(move || {
            let client: Arc<dyn HttpClient> = Arc::new(ReqwestClient::with_config(&config)?);
            Ok(client)
        });
        Self {
            cache,
            client: OnceCell::new(),
            client_factory,
            rate_limiter,
        }
    }

    /// Fetcher with an already constructed transport.
    pub fn with_client(cache: Option<Arc<DiskCache>>, client: Arc<dyn HttpClient>) -> Self {
        let shared = Arc::clone(&client);
        Self {
            cache,
            client: OnceCell::new_with(Some(client)),
            client_factory: Box::new(move || Ok(Arc::clone(&shared))),
            rate_limiter: None,
        }
    }

    /// Fetcher whose transport is built lazily by `factory` on the first miss.
    pub fn with_client_factory<F>(cache: Option<Arc<DiskCache>>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn HttpClient>> + Send + Sync + 'static,
    {
        Self {
            cache,
            client: OnceCell::new(),
            client_factory: Box::new(factory),
            rate_limiter: None,
        }
    }

    /// Cap outgoing requests at `per_second`.
    pub fn with_rate_limit(mut self, per_second: NonZeroU32) -> Self {
        self.rate_limiter = Some(RateLimiter::direct(Quota::per_second(per_second)));
        self
    }

    pub fn cache(&self) -> Option<&Arc<DiskCache>> {
        self.cache.as_ref()
    }

    /// Cache key for `url`: the URL followed by the optional suffix.
    pub fn cache_key(url: &str, options: &OpenUrlOptions) -> String {
        match &options.key_suffix {
            Some(suffix) => format!("{url}{suffix}"),
            None => url.to_string(),
        }
    }

    async fn client(&self) -> Result<&Arc<dyn HttpClient>> {
        self.client
            .get_or_try_init(|| async { (self.client_factory)() })
            .await
    }

    /// Return the cached body for `url`, or download, check and store it.
    ///
    /// A body containing `options.rejection_marker` fails with
    /// [`CacheError::Rejected`] and is not stored. Transport errors propagate
    /// and nothing is stored. Cache I/O runs on the blocking pool and its
    /// failures only cost a refetch.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn open_url(&self, url: &str, options: &OpenUrlOptions) -> Result<String> {
        let key = Self::cache_key(url, options);

        if let Some(cache) = &self.cache {
            if let Some(body) = cached_body(cache, &key).await {
                return Ok(body);
            }
        }

        let body = self.fetch(url, options).await?;

        if let Some(marker) = &options.rejection_marker {
            if body.contains(marker.as_str()) {
                warn!("Rejecting response for {}: found marker {:?}", url, marker);
                return Err(CacheError::Rejected {
                    url: url.to_string(),
                    marker: marker.clone(),
                });
            }
        }

        if let Some(cache) = &self.cache {
            store_body(cache, key, body.clone()).await;
        }
        Ok(body)
    }

    async fn fetch(&self, url: &str, options: &OpenUrlOptions) -> Result<String> {
        if let Some(delay) = options.throttle {
            debug!("Throttling {:?} before {}", delay, url);
            tokio::time::sleep(delay).await;
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let client = self.client().await?;
        let page = client.get(url).await?;
        info!(
            "Fetched {} (HTTP {}, {} bytes, final url {})",
            url,
            page.status,
            page.body.len(),
            page.final_url
        );
        Ok(page.body)
    }
}

/// Cache lookup on the blocking pool. Any failure counts as a miss.
async fn cached_body(cache: &Arc<DiskCache>, key: &str) -> Option<String> {
    let cache = Arc::clone(cache);
    let owned_key = key.to_string();
    let lookup = tokio::task::spawn_blocking(move || cache.lookup(&owned_key)).await;
    match lookup {
        Ok(Ok(Some(body))) => {
            debug!("Cache hit for: {}", key);
            Some(body)
        }
        Ok(Ok(None)) => {
            debug!("Cache miss for: {}", key);
            None
        }
        Ok(Err(e)) => {
            warn!("Cache lookup failed for {}, fetching: {}", key, e);
            None
        }
        Err(e) => {
            warn!("Cache lookup task for {} failed, fetching: {}", key, e);
            None
        }
    }
}

/// Store on the blocking pool; an insert may run a full rebalance sweep.
/// Failures are logged and otherwise ignored.
async fn store_body(cache: &Arc<DiskCache>, key: String, body: String) {
    let cache = Arc::clone(cache);
    let task_key = key.clone();
    let stored = tokio::task::spawn_blocking(move || cache.add_to_cache(&task_key, &body)).await;
    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to store {} in cache: {}", key, e),
        Err(e) => warn!("Cache store task for {} failed: {}", key, e),
    }
}
