//! Block cache bench
//!
//! Drives a mixed read/write workload through several cache clients that
//! share one runtime, then writes everything back, drops the cache
//! contents and re-reads every written block to verify its checksum.

use anyhow::{Context, Result, bail};
use blockcache::{
    AllocatorStats, BlockNumber, BufferHooks, CacheRuntime, Client, ClientOptions, ClientSnapshot,
    FileDevice, PrometheusExporter, ThreadedTransport,
};
use blockcache_common::CacheConfig;
use clap::Parser;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blockcache-bench")]
#[command(about = "Block buffer cache workload driver")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backing file or block device; a temporary file is used if omitted
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Size of the temporary backing file
    #[arg(long, default_value = "67108864")]
    device_size: u64,

    /// Cache block size in bytes
    #[arg(short, long, default_value = "4096")]
    block_size: usize,

    /// Cache clients sharing the runtime
    #[arg(long, default_value = "2")]
    clients: usize,

    /// Worker threads issuing operations
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Operations per worker thread
    #[arg(long, default_value = "20000")]
    ops: u64,

    /// Blocks touched per client
    #[arg(long, default_value = "2048")]
    working_set: u64,

    /// Fraction of operations that modify a block
    #[arg(long, default_value = "0.3")]
    write_ratio: f64,

    /// I/O worker threads in the transport
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Seed for the workload generator
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the report as JSON instead of Prometheus text
    #[arg(long)]
    json: bool,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.cache.validate()?;
    Ok(config)
}

/// Checksums of the last data written for each block
#[derive(Default)]
struct ChecksumLedger {
    written: Mutex<HashMap<BlockNumber, u32>>,
}

impl ChecksumLedger {
    fn entries(&self) -> Vec<(BlockNumber, u32)> {
        self.written
            .lock()
            .iter()
            .map(|(&block, &crc)| (block, crc))
            .collect()
    }
}

/// Stamps every outgoing block with its CRC32C in the aux record
struct ChecksumHooks(Arc<ChecksumLedger>);

impl BufferHooks for ChecksumHooks {
    fn before_write(&self, block: BlockNumber, data: &mut [u8], aux: &mut [u8]) {
        let crc = crc32c::crc32c(data);
        aux[..4].copy_from_slice(&crc.to_le_bytes());
        self.0.written.lock().insert(block, crc);
    }
}

struct BenchClient {
    client: Client,
    first_block: BlockNumber,
    ledger: Arc<ChecksumLedger>,
}

#[derive(Serialize)]
struct Report {
    elapsed_secs: f64,
    operations: u64,
    ops_per_sec: f64,
    verified_blocks: usize,
    clients: Vec<ClientSnapshot>,
    allocator: AllocatorStats,
}

fn run_worker(clients: &[BenchClient], args: &Args, seed: u64) -> Result<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ops = 0;
    for _ in 0..args.ops {
        let bench = &clients[rng.gen_range(0..clients.len())];
        let block = bench.first_block + rng.gen_range(0..args.working_set);

        if rng.gen_ratio(1, 100) {
            bench.client.prefetch(block, 8);
        } else if rng.gen_bool(args.write_ratio) {
            let handle = bench.client.read(block)?;
            rng.fill(&mut handle.data_mut()[..]);
            bench.client.mark_dirty(&handle);
        } else {
            let handle = bench.client.read(block)?;
            let _ = crc32c::crc32c(&handle.data());
        }
        ops += 1;
    }
    Ok(ops)
}

fn verify(bench: &BenchClient) -> Result<usize> {
    let mut mismatches = 0;
    let entries = bench.ledger.entries();
    for &(block, expected) in &entries {
        let handle = bench.client.read(block)?;
        let actual = crc32c::crc32c(&handle.data());
        if actual != expected {
            error!(client = %bench.client.id(), block, expected, actual, "checksum mismatch");
            mismatches += 1;
        }
    }
    if mismatches > 0 {
        bail!("{mismatches} of {} blocks failed verification", entries.len());
    }
    Ok(entries.len())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.clients == 0 || args.threads == 0 || args.working_set == 0 {
        bail!("--clients, --threads and --working-set must be positive");
    }
    if !(0.0..=1.0).contains(&args.write_ratio) {
        bail!("--write-ratio must be within 0..=1");
    }

    // Keep the temporary file alive for the whole run.
    let (device, _temp) = match &args.device {
        Some(path) => (FileDevice::open(path, false)?, None),
        None => {
            let temp = tempfile::NamedTempFile::new().context("failed to create backing file")?;
            (FileDevice::create(temp.path(), args.device_size)?, Some(temp))
        }
    };
    info!(path = device.path(), "backing device");

    let needed = args.clients as u64 * args.working_set * args.block_size as u64;
    let device_size = blockcache::BlockDevice::device_size(&device);
    if needed > device_size {
        bail!("working set needs {needed} bytes but the device has {device_size}");
    }

    let runtime = CacheRuntime::init(config.cache)?;
    let transport = Arc::new(ThreadedTransport::new(device, args.workers)?);

    let mut clients = Vec::with_capacity(args.clients);
    for n in 0..args.clients as u64 {
        let ledger = Arc::new(ChecksumLedger::default());
        let mut options = ClientOptions::new(args.block_size)
            .with_reserved_buffers(4)
            .with_aux_size(4);
        options.hooks = Arc::new(ChecksumHooks(Arc::clone(&ledger)));
        let client = Client::create(&runtime, transport.clone(), options)?;
        clients.push(BenchClient {
            client,
            first_block: n * args.working_set,
            ledger,
        });
    }
    info!(
        clients = args.clients,
        threads = args.threads,
        ops = args.ops,
        working_set = args.working_set,
        "starting workload"
    );

    let started = Instant::now();
    let operations = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.threads as u64)
            .map(|t| {
                let clients = &clients;
                let args = &args;
                scope.spawn(move || run_worker(clients, args, args.seed.wrapping_add(t)))
            })
            .collect();
        workers.into_iter().try_fold(0u64, |total, worker| {
            let ops = worker
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
            Ok::<_, anyhow::Error>(total + ops)
        })
    })?;
    let elapsed = started.elapsed();

    for bench in &clients {
        if let Err(e) = bench.client.write_dirty_buffers() {
            warn!(client = %bench.client.id(), "write-back failed: {e}");
            return Err(e.into());
        }
        bench.client.issue_flush()?;
    }
    let snapshots = runtime.snapshots();
    let allocator = runtime.allocator_stats();

    let dropped = runtime.external_reclaim(usize::MAX, true);
    info!(dropped, "cache emptied for verification");
    let mut verified_blocks = 0;
    for bench in &clients {
        verified_blocks += verify(bench)?;
    }
    info!(verified_blocks, "verification passed");

    for bench in clients {
        bench.client.destroy()?;
    }
    runtime.shutdown();

    let elapsed_secs = elapsed.as_secs_f64();
    let report = Report {
        elapsed_secs,
        operations,
        ops_per_sec: if elapsed_secs > 0.0 {
            operations as f64 / elapsed_secs
        } else {
            0.0
        },
        verified_blocks,
        clients: snapshots,
        allocator,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!(
            "{}",
            PrometheusExporter::default().render(&report.clients, &report.allocator)
        );
        println!(
            "# {} operations in {:.2}s ({:.0} ops/s), {} blocks verified",
            report.operations, report.elapsed_secs, report.ops_per_sec, report.verified_blocks
        );
    }
    Ok(())
}
