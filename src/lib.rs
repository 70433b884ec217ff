//! URL Cache Library
//!
//! An on-disk cache for HTTP responses and other computed text, keyed by
//! arbitrary strings, with a self-balancing directory tree, an append-only
//! index, expiry on open, and a fetch-or-compute front end.

pub use crate::cache_engine::{
    read_cached, CacheError, CacheOptions, DiskCache, HttpClient, OpenUrlOptions, UrlFetcher,
};

pub mod cache_engine;
