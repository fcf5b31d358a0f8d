//  Copyright 2025 bucketcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Load generator for bucketcache: concurrent clients against one cache while a simulated rebalancer moves buckets.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context;
use bucketcache::{
    CacheConfig, Entry, ErrorKind, EvictionMode, LogMode, PartitionedCache, PartitionedCacheBuilder, PolicyConfig,
    Priority,
};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Policy {
    Priority,
    Lru,
    Lfu,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// JSON cache config file. Overrides the cache flags below.
    #[arg(long)]
    config: Option<String>,

    /// Cache capacity. (MiB)
    #[arg(long, default_value_t = 64)]
    capacity: usize,

    /// Bucket count.
    #[arg(long, default_value_t = 1000)]
    buckets: u32,

    /// Store shards.
    #[arg(long, default_value_t = 16)]
    shards: usize,

    /// Eviction policy.
    #[arg(long, value_enum, default_value_t = Policy::Priority)]
    policy: Policy,

    /// Run eviction passes on writer threads.
    #[arg(long, default_value_t = false)]
    sync_eviction: bool,

    /// Benchmark duration, e.g. `30s`.
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "10s")]
    time: Duration,

    /// Report interval, e.g. `2s`.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    report_interval: Duration,

    /// Writer count.
    #[arg(long, default_value_t = 4)]
    writers: usize,

    /// Reader count.
    #[arg(long, default_value_t = 4)]
    readers: usize,

    /// Min entry size. (B)
    #[arg(long, default_value_t = 1024)]
    entry_size_min: usize,

    /// Max entry size. (B)
    #[arg(long, default_value_t = 16 * 1024)]
    entry_size_max: usize,

    /// Key range.
    #[arg(long, default_value_t = 100_000)]
    key_range: u64,

    /// Interval between simulated bucket moves, e.g. `100ms`. `0s` disables the rebalancer.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    rebalance_interval: Duration,

    /// Print prometheus metrics at exit.
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

#[derive(Debug, Default)]
struct Counters {
    inserts: AtomicU64,
    insert_bytes: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    removes: AtomicU64,
    not_owned: AtomicU64,
    full: AtomicU64,
    other_errors: AtomicU64,
    moves: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    inserts: u64,
    insert_bytes: u64,
    gets: u64,
    hits: u64,
    removes: u64,
    not_owned: u64,
    full: u64,
    other_errors: u64,
    moves: u64,
}

impl Counters {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            insert_bytes: self.insert_bytes.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            not_owned: self.not_owned.load(Ordering::Relaxed),
            full: self.full.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
        }
    }

    fn error(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::BucketNotOwned => &self.not_owned,
            ErrorKind::NotEnoughSpace => &self.full,
            _ => &self.other_errors,
        }
        .fetch_add(1, Ordering::Relaxed);
    }
}

struct Bench {
    args: Args,
    cache: PartitionedCache<u64>,
    counters: Counters,
    stop: AtomicBool,
}

fn cache_config(args: &Args) -> anyhow::Result<CacheConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
        return serde_json::from_str(&raw).with_context(|| format!("parse config {path}"));
    }
    let mut config = CacheConfig {
        name: "bench".to_string(),
        capacity: args.capacity * 1024 * 1024,
        shards: args.shards,
        bucket_count: args.buckets,
        ..Default::default()
    };
    config.eviction.mode = match args.sync_eviction {
        true => EvictionMode::Sync,
        false => EvictionMode::Async,
    };
    config.eviction.policy = match args.policy {
        Policy::Priority => PolicyConfig::Priority {
            default_priority: Priority::Normal,
        },
        Policy::Lru => PolicyConfig::Lru,
        Policy::Lfu => PolicyConfig::Lfu,
    };
    Ok(config)
}

fn writer(ctx: Arc<Bench>, id: usize) {
    let mut rng = SmallRng::seed_from_u64(id as u64);
    let (min, max) = (ctx.args.entry_size_min, ctx.args.entry_size_max.max(ctx.args.entry_size_min));
    let payload = Bytes::from(vec![b'x'; max]);
    while !ctx.stop.load(Ordering::Relaxed) {
        let key = rng.random_range(0..ctx.args.key_range);
        if rng.random_bool(0.1) {
            match ctx.cache.remove(&key) {
                Ok(_) => {
                    ctx.counters.removes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => ctx.counters.error(e.kind()),
            }
            continue;
        }
        let size = rng.random_range(min..=max);
        let priority = match rng.random_range(0..10) {
            0 => Priority::High,
            1..3 => Priority::Low,
            _ => Priority::Normal,
        };
        let entry = Entry::new(payload.slice(..size)).with_priority(priority);
        match ctx.cache.insert(key, entry) {
            Ok(_) => {
                ctx.counters.inserts.fetch_add(1, Ordering::Relaxed);
                ctx.counters.insert_bytes.fetch_add(size as u64, Ordering::Relaxed);
            }
            Err(e) => ctx.counters.error(e.kind()),
        }
    }
}

fn reader(ctx: Arc<Bench>, id: usize) {
    let mut rng = SmallRng::seed_from_u64(u64::MAX - id as u64);
    while !ctx.stop.load(Ordering::Relaxed) {
        let key = rng.random_range(0..ctx.args.key_range);
        ctx.counters.gets.fetch_add(1, Ordering::Relaxed);
        match ctx.cache.get(&key) {
            Ok(Some(_)) => {
                ctx.counters.hits.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => ctx.counters.error(e.kind()),
        }
    }
}

/// Moves buckets the way a cluster would: mirrored hand-off to a peer, or a deferred receive from a peer.
fn rebalancer(ctx: Arc<Bench>) -> anyhow::Result<()> {
    let mut rng = SmallRng::seed_from_u64(0);
    let buckets = ctx.cache.bucket_count();
    while !ctx.stop.load(Ordering::Relaxed) {
        std::thread::sleep(ctx.args.rebalance_interval);
        let bucket = rng.random_range(0..buckets);
        if rng.random_bool(0.5) {
            let keys = ctx.cache.get_key_list(bucket, true)?;
            let mut drained = 0;
            loop {
                let table = ctx.cache.get_log_table(&[bucket])?;
                drained += table.change_set.len();
                if table.logging_stopped {
                    break;
                }
            }
            let removed = ctx.cache.remove_bucket(bucket)?;
            tracing::debug!(
                "[bench]: handed over bucket {bucket}: {} keys listed, {drained} changes drained, {removed} removed",
                keys.len()
            );
            ctx.cache.update_owned_buckets(&[bucket])?;
        } else {
            ctx.cache.start_bucket_transfer(bucket, LogMode::Deferred)?;
            std::thread::sleep(ctx.args.rebalance_interval / 2);
            let stats = ctx.cache.add_logged_data(&[bucket])?;
            tracing::debug!("[bench]: received bucket {bucket}: {stats:?}");
        }
        ctx.counters.moves.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn report(ctx: &Bench, last: &Mutex<(Instant, Snapshot)>) {
    let now = Instant::now();
    let current = ctx.counters.snapshot();
    let mut last = last.lock();
    let secs = now.duration_since(last.0).as_secs_f64().max(f64::EPSILON);
    let prev = last.1;
    let rate = |cur: u64, prev: u64| (cur - prev) as f64 / secs;
    let gets = current.gets - prev.gets;
    let hit_ratio = match gets {
        0 => 0.0,
        gets => (current.hits - prev.hits) as f64 / gets as f64,
    };
    tracing::info!(
        "[bench]: insert {:.0}/s ({:.2} MiB/s), get {:.0}/s, hit {:.2}%, remove {:.0}/s, not owned {:.0}/s, full {:.0}/s, errors {}, moves {}, usage {:.2} MiB, entries {}",
        rate(current.inserts, prev.inserts),
        rate(current.insert_bytes, prev.insert_bytes) / 1024.0 / 1024.0,
        rate(current.gets, prev.gets),
        hit_ratio * 100.0,
        rate(current.removes, prev.removes),
        rate(current.not_owned, prev.not_owned),
        rate(current.full, prev.full),
        current.other_errors,
        current.moves,
        ctx.cache.usage() as f64 / 1024.0 / 1024.0,
        ctx.cache.count(),
    );
    *last = (now, current);
}

fn spawn<F>(name: String, f: F) -> anyhow::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .with_context(|| format!("spawn {name}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    #[cfg(feature = "deadlock")]
    {
        // Create a background thread which checks for deadlocks every 10s.
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(10));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }
            tracing::error!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                tracing::error!("Deadlock #{}", i);
                for t in threads {
                    tracing::error!("Thread Id {:#?}", t.thread_id());
                    tracing::error!("{:#?}", t.backtrace());
                }
            }
        });
    }

    let args = Args::parse();
    tracing::info!("[bench]: args: {args:#?}");

    let config = cache_config(&args)?;
    let builder = PartitionedCacheBuilder::from_config(config);

    #[cfg(feature = "prometheus")]
    let registry = prometheus::Registry::new();
    #[cfg(feature = "prometheus")]
    let builder = match args.metrics {
        true => builder.with_metrics_registry(Box::new(bucketcache::PrometheusMetricsRegistry::new(registry.clone()))),
        false => builder,
    };
    #[cfg(not(feature = "prometheus"))]
    if args.metrics {
        tracing::warn!("[bench]: built without the prometheus feature, metrics are not exported");
    }

    let cache = builder.build()?;
    cache.update_owned_buckets(&(0..cache.bucket_count()).collect_vec())?;

    let ctx = Arc::new(Bench {
        args: args.clone(),
        cache,
        counters: Counters::default(),
        stop: AtomicBool::new(false),
    });

    let mut handles = vec![];
    for id in 0..args.writers {
        let ctx = ctx.clone();
        handles.push(spawn(format!("writer-{id}"), move || writer(ctx, id))?);
    }
    for id in 0..args.readers {
        let ctx = ctx.clone();
        handles.push(spawn(format!("reader-{id}"), move || reader(ctx, id))?);
    }
    if !args.rebalance_interval.is_zero() {
        let ctx = ctx.clone();
        handles.push(spawn("rebalancer".to_string(), move || {
            if let Err(e) = rebalancer(ctx) {
                tracing::error!("[bench]: rebalancer failed: {e:?}");
            }
        })?);
    }

    let start = Instant::now();
    let last = Mutex::new((start, Snapshot::default()));
    while start.elapsed() < args.time {
        std::thread::sleep(args.report_interval.min(args.time.saturating_sub(start.elapsed())));
        report(&ctx, &last);
    }
    ctx.stop.store(true, Ordering::Relaxed);
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("[bench]: a worker panicked");
        }
    }

    let total = ctx.counters.snapshot();
    let secs = start.elapsed().as_secs_f64();
    tracing::info!(
        "[bench]: total {:.2}s, inserts {}, gets {}, hits {}, not owned {}, full {}, errors {}, moves {}",
        secs,
        total.inserts,
        total.gets,
        total.hits,
        total.not_owned,
        total.full,
        total.other_errors,
        total.moves,
    );

    #[cfg(feature = "prometheus")]
    if args.metrics {
        use prometheus::Encoder;

        let mut buf = vec![];
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .context("encode metrics")?;
        println!("{}", String::from_utf8_lossy(&buf));
    }

    ctx.cache.dispose();
    Ok(())
}
