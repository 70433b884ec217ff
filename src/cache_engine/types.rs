//! Type definitions for the cache engine

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for an on-disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// A leaf holding more data files than this is split in two.
    pub max_node_files: usize,
    /// A full rebalance sweep runs whenever the index line count reaches a multiple of this.
    pub rebalancing_limit: usize,
    /// Entries whose newest index record is older than this many days are expired on open.
    pub expiry_days: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_node_files: 256,
            rebalancing_limit: 512,
            expiry_days: 10,
        }
    }
}

impl CacheOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_node_files == 0 {
            return Err(CacheError::InvalidOptions(
                "max_node_files must be at least 1".to_string(),
            ));
        }
        if self.rebalancing_limit == 0 {
            return Err(CacheError::InvalidOptions(
                "rebalancing_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One parsed line of the index log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub date: NaiveDate,
    pub digest: String,
    pub key: String,
}

/// Per-call options for [`UrlFetcher::open_url`](super::fetcher::UrlFetcher::open_url).
#[derive(Debug, Clone, Default)]
pub struct OpenUrlOptions {
    /// Responses containing this substring are rejected and never cached.
    pub rejection_marker: Option<String>,
    /// Delay applied before the network request on a cache miss.
    pub throttle: Option<Duration>,
    /// Appended to the URL to build the cache key.
    pub key_suffix: Option<String>,
}

/// A response returned by an [`HttpClient`](super::fetcher::HttpClient).
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: String,
    pub status: u16,
    pub final_url: String,
}

/// Configuration for the default HTTP transport
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub gzip: bool,
    /// Upper bound on outgoing requests per second, shared by every call on a fetcher.
    pub requests_per_second: Option<u32>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("urlcache/", env!("CARGO_PKG_VERSION")).to_string(),
            gzip: true,
            requests_per_second: None,
        }
    }
}

/// Shape and size of the cache tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub leaf_nodes: usize,
    pub internal_nodes: usize,
    pub max_depth: usize,
    pub largest_leaf_entries: usize,
    pub index_records: usize,
    pub disk_size_bytes: u64,
}

/// Cache operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheOperation {
    Delete,
    Clear,
    Cleanup,
    Rebalance,
}

/// Cache management result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOperationResult {
    pub operation: CacheOperation,
    pub message: String,
    pub items_affected: usize,
    pub size_freed_bytes: u64,
}

/// Error types for the cache engine
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Key is not cached: {key}")]
    NotCached { key: String },

    #[error("Response for {url} contains rejection marker {marker:?}")]
    Rejected { url: String, marker: String },

    #[error("HTTP {status} while fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Cache tree is corrupt at {path}: no child covers the digest")]
    CorruptTree { path: PathBuf },

    #[error("Invalid cache options: {0}")]
    InvalidOptions(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
