//! emberkv-soak - Concurrency Soak Driver
//!
//! Runs the storage core under a mixed, overlapping workload and checks that
//! it stays consistent:
//!
//! - a ledger database where workers move amounts between accounts with
//!   multi-key transactions (the total must never change),
//! - a scratch database with `WATCH`-style increments, short TTLs and
//!   periodic `FLUSHDB`.
//!
//! An auditor reads every account under read locks on each tick. Any drift in
//! the ledger total fails the run.

use anyhow::{bail, Context};
use bytes::Bytes;
use emberkv::storage::{cmd_line, Database, Databases};
use emberkv::ServerConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Database holding the account balances
const LEDGER_DB: usize = 0;

/// Database for watched counters and volatile keys
const SCRATCH_DB: usize = 1;

/// Starting balance of every account
const INITIAL_BALANCE: i64 = 1_000;

/// Counters touched by watched increments
const COUNTERS: usize = 16;

/// Keys written with short TTLs
const VOLATILE_KEYS: usize = 256;

/// How often the auditor runs and the scratch database is flushed
const AUDIT_EVERY: Duration = Duration::from_millis(250);

/// Command-line options
#[derive(Debug)]
struct Args {
    /// Optional redis.conf-style file
    config: Option<PathBuf>,
    /// Blocking worker threads
    workers: usize,
    /// Number of ledger accounts
    accounts: usize,
    /// How long to run
    duration: Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            workers: 8,
            accounts: 64,
            duration: Duration::from_secs(10),
        }
    }
}

impl Args {
    /// Parse options from command-line arguments
    fn from_args() -> Self {
        let mut args = Args::default();
        let argv: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < argv.len() {
            let value = argv.get(i + 1);
            match (argv[i].as_str(), value) {
                ("--config" | "-c", Some(path)) => args.config = Some(PathBuf::from(path)),
                ("--workers" | "-w", Some(n)) => args.workers = parse_or_exit(n, "--workers"),
                ("--accounts" | "-a", Some(n)) => args.accounts = parse_or_exit(n, "--accounts"),
                ("--seconds" | "-s", Some(n)) => {
                    args.duration = Duration::from_secs(parse_or_exit(n, "--seconds"))
                }
                ("--help", _) => {
                    print_help();
                    std::process::exit(0);
                }
                ("--version" | "-v", _) => {
                    println!("emberkv-soak version {}", emberkv::VERSION);
                    std::process::exit(0);
                }
                (flag @ ("--config" | "-c" | "--workers" | "-w" | "--accounts" | "-a"
                | "--seconds" | "-s"), None) => {
                    eprintln!("Error: {} requires a value", flag);
                    std::process::exit(1);
                }
                (other, _) => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 2;
        }

        if args.accounts < 2 || args.workers == 0 {
            eprintln!("Error: need at least 2 accounts and 1 worker");
            std::process::exit(1);
        }
        args
    }
}

fn parse_or_exit<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value '{}' for {}", value, flag);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
emberkv-soak - Concurrency soak driver for the emberkv storage core

USAGE:
    emberkv-soak [OPTIONS]

OPTIONS:
    -c, --config <FILE>      redis.conf-style settings (default: built-in)
    -w, --workers <N>        Worker threads (default: 8)
    -a, --accounts <N>       Ledger accounts (default: 64)
    -s, --seconds <N>        Run time in seconds (default: 10)
    -v, --version            Print version information
        --help               Print this help message

Log verbosity follows RUST_LOG (default: info).
"#
    );
}

/// What one worker got done
#[derive(Debug, Default)]
struct WorkerReport {
    transfers: u64,
    watch_commits: u64,
    watch_aborts: u64,
    volatile_writes: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.transfers += other.transfers;
        self.watch_commits += other.watch_commits;
        self.watch_aborts += other.watch_aborts;
        self.volatile_writes += other.volatile_writes;
    }
}

/// Sum of all balances, read under read locks on every account
fn audit(ledger: &Database<i64>, accounts: &[Bytes]) -> i64 {
    ledger.execute(&[] as &[&[u8]], accounts, |guard| {
        accounts.iter().filter_map(|account| guard.get(account)).sum()
    })
}

/// Moves a random amount between two accounts in one transaction
fn transfer(ledger: &Database<i64>, accounts: &[Bytes], rng: &mut StdRng) -> bool {
    let from = &accounts[rng.gen_range(0..accounts.len())];
    let to = &accounts[rng.gen_range(0..accounts.len())];
    let amount = rng.gen_range(1..=50);

    ledger.execute(&[from, to], &[] as &[&[u8]], |guard| {
        if from == to || guard.get(from).unwrap_or(0) < amount {
            return false;
        }
        guard.update(from, |balance| *balance -= amount);
        guard.update(to, |balance| *balance += amount);

        let amount = Bytes::from(amount.to_string());
        ledger.append_mutation(cmd_line(&[b"DECRBY", from, &amount]));
        ledger.append_mutation(cmd_line(&[b"INCRBY", to, &amount]));
        true
    })
}

/// Read, then write only if nobody touched the counter in between
fn watched_increment(scratch: &Database<i64>, counters: &[Bytes], rng: &mut StdRng) -> bool {
    let key = &counters[rng.gen_range(0..counters.len())];
    let watched = scratch.watch(&[key]);
    let seen = scratch.get(key).unwrap_or(0);

    scratch.execute(&[key], &[] as &[&[u8]], |guard| {
        if !guard.unchanged_since(&watched) {
            return false;
        }
        guard.put(key.clone(), seen + 1);
        true
    })
}

/// Writes a key with a TTL short enough to expire during the run
fn volatile_write(scratch: &Database<i64>, volatile: &[Bytes], rng: &mut StdRng) {
    let key = &volatile[rng.gen_range(0..volatile.len())];
    let ttl = Duration::from_millis(rng.gen_range(5..300));
    let persist = rng.gen_bool(0.1);

    scratch.execute(&[key], &[] as &[&[u8]], |guard| {
        guard.put(key.clone(), 1);
        guard.expire(key, SystemTime::now() + ttl);
        if persist {
            guard.persist(key);
        }
    });
}

fn run_worker(
    id: u64,
    dbs: Arc<Databases<i64>>,
    accounts: Arc<Vec<Bytes>>,
    stop: Arc<AtomicBool>,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    let (Some(ledger), Some(scratch)) = (dbs.get(LEDGER_DB), dbs.get(SCRATCH_DB)) else {
        return report;
    };

    let counters: Vec<Bytes> = (0..COUNTERS)
        .map(|i| Bytes::from(format!("counter:{}", i)))
        .collect();
    let volatile: Vec<Bytes> = (0..VOLATILE_KEYS)
        .map(|i| Bytes::from(format!("session:{}", i)))
        .collect();
    let mut rng = StdRng::seed_from_u64(id);

    while !stop.load(Ordering::Relaxed) {
        match rng.gen_range(0..10) {
            0..=5 => {
                if transfer(ledger, &accounts, &mut rng) {
                    report.transfers += 1;
                }
            }
            6..=7 => {
                if watched_increment(scratch, &counters, &mut rng) {
                    report.watch_commits += 1;
                } else {
                    report.watch_aborts += 1;
                }
            }
            _ => {
                volatile_write(scratch, &volatile, &mut rng);
                report.volatile_writes += 1;
            }
        }
    }

    debug!(worker = id, ?report, "Worker finished");
    report
}

/// Audits the ledger and flushes the scratch database until stopped.
///
/// Returns the number of audits that saw a wrong total.
async fn maintenance_loop(
    dbs: Arc<Databases<i64>>,
    accounts: Arc<Vec<Bytes>>,
    expected: i64,
    stop: Arc<AtomicBool>,
) -> u64 {
    let mut ticker = tokio::time::interval(AUDIT_EVERY);
    let mut mismatches = 0;

    // first tick completes immediately
    ticker.tick().await;

    while !stop.load(Ordering::Relaxed) {
        ticker.tick().await;

        let dbs = Arc::clone(&dbs);
        let accounts = Arc::clone(&accounts);
        let round = tokio::task::spawn_blocking(move || {
            let total = dbs.get(LEDGER_DB).map(|ledger| audit(ledger, &accounts));
            let flushed = dbs.get(SCRATCH_DB).map(Database::flush).unwrap_or(0);
            (total, flushed)
        })
        .await;

        match round {
            Ok((Some(total), flushed)) if total == expected => {
                debug!(total, flushed, "Audit passed");
            }
            Ok((total, _)) => {
                error!(?total, expected, "Ledger total drifted");
                mismatches += 1;
            }
            Err(e) => {
                error!("Audit task failed: {}", e);
                mismatches += 1;
            }
        }
    }

    mismatches
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if config.databases <= SCRATCH_DB {
        bail!(
            "soak needs at least {} databases, config has {}",
            SCRATCH_DB + 1,
            config.databases
        );
    }

    info!(
        version = emberkv::VERSION,
        workers = args.workers,
        accounts = args.accounts,
        seconds = args.duration.as_secs(),
        "Starting soak run"
    );

    // Create the databases on a shared time wheel
    let dbs: Arc<Databases<i64>> = Arc::new(Databases::start(&config));

    let logged = Arc::new(AtomicU64::new(0));
    {
        let logged = Arc::clone(&logged);
        dbs.set_mutation_hook(move |_, _| {
            logged.fetch_add(1, Ordering::Relaxed);
        });
    }

    // Seed the ledger
    let accounts: Arc<Vec<Bytes>> = Arc::new(
        (0..args.accounts)
            .map(|i| Bytes::from(format!("account:{}", i)))
            .collect(),
    );
    if let Some(ledger) = dbs.get(LEDGER_DB) {
        for account in accounts.iter() {
            ledger.put(account.clone(), INITIAL_BALANCE);
        }
    }
    let expected = INITIAL_BALANCE * args.accounts as i64;

    let stop = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..args.workers as u64)
        .map(|id| {
            let dbs = Arc::clone(&dbs);
            let accounts = Arc::clone(&accounts);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || run_worker(id, dbs, accounts, stop))
        })
        .collect();

    let maintenance = tokio::spawn(maintenance_loop(
        Arc::clone(&dbs),
        Arc::clone(&accounts),
        expected,
        Arc::clone(&stop),
    ));

    // Run until the time is up or Ctrl+C
    tokio::select! {
        _ = tokio::time::sleep(args.duration) => {
            info!("Run time elapsed, stopping workers...");
        }
        result = signal::ctrl_c() => {
            result.context("failed to install Ctrl+C handler")?;
            info!("Shutdown signal received, stopping workers...");
        }
    }
    stop.store(true, Ordering::Relaxed);

    let mut report = WorkerReport::default();
    for worker in workers {
        report.merge(worker.await?);
    }
    let mismatches = maintenance.await?;

    let total = {
        let dbs = Arc::clone(&dbs);
        let accounts = Arc::clone(&accounts);
        tokio::task::spawn_blocking(move || {
            dbs.get(LEDGER_DB)
                .map(|ledger| audit(ledger, &accounts))
                .unwrap_or(0)
        })
        .await?
    };

    info!(
        transfers = report.transfers,
        watch_commits = report.watch_commits,
        watch_aborts = report.watch_aborts,
        volatile_writes = report.volatile_writes,
        mutations_logged = logged.load(Ordering::Relaxed),
        "Workload finished"
    );
    for (index, stats) in dbs.stats().iter().enumerate().take(SCRATCH_DB + 1) {
        info!(
            db = index,
            keys = stats.keys,
            volatile_keys = stats.volatile_keys,
            expired_keys = stats.expired_keys,
            "Database stats"
        );
    }

    if mismatches > 0 || total != expected {
        bail!(
            "ledger inconsistent: total {} (expected {}), {} failed audits",
            total,
            expected,
            mismatches
        );
    }

    info!(total, "Soak run complete, ledger consistent");
    Ok(())
}
