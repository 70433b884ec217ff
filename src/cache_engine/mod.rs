//! Cache Engine - content-addressed disk cache for fetched pages
//!
//! Payloads are stored as text files named by the SHA-256 of their key inside
//! a directory tree that splits a leaf in two whenever it grows past a
//! threshold. An append-only index at the cache root maps dates and digests
//! back to keys so entries can be expired or invalidated by key.

pub mod cache;
pub mod fetcher;
pub mod hasher;
pub mod index;
pub mod tree;
pub mod types;

pub use cache::{read_cached, DiskCache};
pub use fetcher::{ClientFactory, HttpClient, ReqwestClient, UrlFetcher};
pub use hasher::{digest_key, KeyHash, DIGEST_HEX_LEN};
pub use types::*;
