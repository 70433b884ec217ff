//! URL Cache Binary
//!
//! Command line front end for the on-disk URL cache. Cache directory selection
//! precedence:
//!   1. --cache-dir flag
//!   2. URLCACHE_DIR env var
//!   3. XDG / platform cache dir via dirs crate
//!   4. Fallback: ./.urlcache

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use urlcache::cache_engine::{CacheOptions, DiskCache, FetcherConfig, OpenUrlOptions, UrlFetcher};

/// Command line interface for the URL cache.
#[derive(Debug, Parser)]
#[command(
    name = "urlcache",
    version,
    about = "Content-addressed on-disk cache for fetched web pages"
)]
struct Cli {
    /// Explicit cache directory (overrides env + platform default)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Split a tree leaf once it holds more than this many entries
    #[arg(long, global = true, default_value_t = CacheOptions::default().max_node_files)]
    max_node_files: usize,

    /// Run a rebalance sweep every time the index reaches a multiple of this many lines
    #[arg(long, global = true, default_value_t = CacheOptions::default().rebalancing_limit)]
    rebalancing_limit: usize,

    /// Expire entries older than this many days when the cache is opened
    #[arg(long, global = true, default_value_t = CacheOptions::default().expiry_days)]
    expiry_days: u32,

    /// Suppress info logs (only warnings+)
    #[arg(long, global = true)]
    quiet: bool,

    /// Force ANSI color output in logs
    #[arg(long, global = true)]
    color: bool,

    /// Disable ANSI color output
    #[arg(long, global = true)]
    no_color: bool,

    /// Print the resolved cache directory and exit
    #[arg(long)]
    print_cache_dir: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the body of URL, from the cache when present
    Get {
        url: String,
        /// Fail instead of caching when the body contains this text
        #[arg(long)]
        rejection_marker: Option<String>,
        /// Wait this many milliseconds before hitting the network
        #[arg(long, value_name = "MS")]
        throttle_ms: Option<u64>,
        /// Appended to the URL to form the cache key
        #[arg(long)]
        key_suffix: Option<String>,
        /// Bypass the cache entirely
        #[arg(long)]
        no_cache: bool,
        /// Cap outgoing requests per second
        #[arg(long, value_name = "PER_SECOND")]
        rate_limit: Option<NonZeroU32>,
    },
    /// Exit successfully when KEY is cached
    IsCached { key: String },
    /// Print the file that holds (or would hold) KEY
    Path { key: String },
    /// Remove keys from the cache
    Invalidate {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Remove entries older than the expiry window
    Expire {
        /// Reference date (YYYY-MM-DD), defaults to today
        #[arg(long, value_name = "DATE")]
        as_of: Option<NaiveDate>,
    },
    /// Split every oversized tree leaf now
    Rebalance,
    /// Delete every cached entry and the index
    Empty,
    /// Show tree and index statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List index records
    Index {
        #[arg(long)]
        json: bool,
    },
}

fn resolve_cache_dir(cli: &Cli) -> PathBuf {
    if let Some(dir) = &cli.cache_dir {
        return dir.clone();
    }
    if let Ok(env_dir) = std::env::var("URLCACHE_DIR") {
        return PathBuf::from(env_dir);
    }
    if let Some(base) = dirs::cache_dir() {
        return base.join("urlcache");
    }
    // Fallback: local hidden directory
    PathBuf::from(".").join(".urlcache")
}

fn open_cache(cli: &Cli, cache_dir: &Path) -> Result<DiskCache> {
    let options = CacheOptions {
        max_node_files: cli.max_node_files,
        rebalancing_limit: cli.rebalancing_limit,
        expiry_days: cli.expiry_days,
    };
    DiskCache::open(cache_dir, options)
        .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging / tracing setup
    let mut fmt = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(if cli.quiet { "warn" } else { "urlcache=info" }.parse()?),
        )
        .with_writer(std::io::stderr)
        .with_target(false);

    // Color handling precedence: --no-color > inherited tty auto > --color
    if cli.no_color {
        fmt = fmt.with_ansi(false);
    } else if cli.color {
        fmt = fmt.with_ansi(true);
    }
    fmt.init();

    let cache_dir = resolve_cache_dir(&cli);
    if cli.print_cache_dir {
        println!("{}", cache_dir.display());
        return Ok(());
    }

    let Some(command) = &cli.command else {
        anyhow::bail!("No command given; run with --help for usage");
    };

    match command {
        Command::Get {
            url,
            rejection_marker,
            throttle_ms,
            key_suffix,
            no_cache,
            rate_limit,
        } => {
            let cache = if *no_cache {
                None
            } else {
                Some(Arc::new(open_cache(&cli, &cache_dir)?))
            };
            let config = FetcherConfig {
                requests_per_second: rate_limit.map(NonZeroU32::get),
                ..Default::default()
            };
            let fetcher = UrlFetcher::with_config(cache, config);
            let options = OpenUrlOptions {
                rejection_marker: rejection_marker.clone(),
                throttle: throttle_ms.map(Duration::from_millis),
                key_suffix: key_suffix.clone(),
            };
            let body = fetcher
                .open_url(url, &options)
                .await
                .with_context(|| format!("Failed to open {url}"))?;
            print!("{body}");
        }
        Command::IsCached { key } => {
            let cache = open_cache(&cli, &cache_dir)?;
            if cache.is_cached(key) {
                println!("cached");
            } else {
                println!("not cached");
                std::process::exit(1);
            }
        }
        Command::Path { key } => {
            let cache = open_cache(&cli, &cache_dir)?;
            println!("{}", cache.cache_filename(key)?.display());
        }
        Command::Invalidate { keys } => {
            let cache = open_cache(&cli, &cache_dir)?;
            let result = cache.remove_from_cache_multiple(keys.as_slice())?;
            println!("{}", result.message);
        }
        Command::Expire { as_of } => {
            let cache = open_cache(&cli, &cache_dir)?;
            let result = cache.invalidate_expired_entries(*as_of)?;
            println!("{}", result.message);
        }
        Command::Rebalance => {
            let cache = open_cache(&cli, &cache_dir)?;
            let result = cache.rebalance_cache_tree()?;
            println!("{}", result.message);
        }
        Command::Empty => {
            let cache = open_cache(&cli, &cache_dir)?;
            let result = cache.empty_cache()?;
            println!("{}", result.message);
        }
        Command::Stats { json } => {
            let cache = open_cache(&cli, &cache_dir)?;
            let stats = cache.stats()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("entries:        {}", stats.total_entries);
                println!("leaf nodes:     {}", stats.leaf_nodes);
                println!("internal nodes: {}", stats.internal_nodes);
                println!("max depth:      {}", stats.max_depth);
                println!("largest leaf:   {}", stats.largest_leaf_entries);
                println!("index records:  {}", stats.index_records);
                println!("disk bytes:     {}", stats.disk_size_bytes);
            }
        }
        Command::Index { json } => {
            let cache = open_cache(&cli, &cache_dir)?;
            let records = cache.index_records()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in records {
                    println!(
                        "{} {} {}",
                        record.date.format("%Y-%m-%d"),
                        record.digest,
                        record.key
                    );
                }
            }
        }
    }

    Ok(())
}
