use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::Serialize;
use size_format::SizeFormatterBinary as SF;
use swarm_picker::{
    Clock, Lengths, ManualClock, PeerHandle, PeerHaves, Scheduler, SchedulerConfig,
    SchedulerOptions, SchedulerStats, StaticDisk, TokenDispenser,
};
use tracing::{info, info_span, warn};

mod swarm;
mod token_bucket;

use swarm::{Playback, SimPeer, Swarm};
use token_bucket::TokenBucket;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The loglevel
    #[arg(value_enum, short = 'v')]
    log_level: Option<LogLevel>,

    /// Scheduler configuration as JSON. Missing fields use the defaults.
    #[arg(short = 'c', long = "config")]
    config_path: Option<PathBuf>,

    #[arg(long, default_value_t = 256)]
    pieces: u32,

    /// Piece length in bytes.
    #[arg(long, default_value_t = 256 * 1024)]
    piece_length: u32,

    /// Split the content into this many equally sized files.
    #[arg(long, default_value_t = 1)]
    files: u32,

    #[arg(long, default_value_t = 20)]
    peers: u32,

    /// Fraction of peers that have every piece.
    #[arg(long, default_value_t = 0.3)]
    seed_ratio: f64,

    /// Fraction of pieces each non-seed peer starts with.
    #[arg(long, default_value_t = 0.5)]
    have_ratio: f64,

    /// Fraction of completed pieces that fail verification.
    #[arg(long, default_value_t = 0.0)]
    corrupt_ratio: f64,

    /// Seed for the swarm and the scheduler. Random if not set.
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many ticks even if the download didn't finish.
    #[arg(long, default_value_t = 10_000)]
    max_ticks: u64,

    /// Simulated time between scheduling passes, e.g. 1s, 250ms.
    #[arg(long, value_parser = parse_duration::parse, default_value = "1s")]
    tick_interval: Duration,

    /// Download limit in bytes per second.
    #[arg(long)]
    download_limit: Option<u64>,

    /// Download pieces in order.
    #[arg(long)]
    sequential: bool,

    /// Force these pieces to the front.
    #[arg(long = "force", value_delimiter = ',')]
    forced: Vec<u32>,

    /// Simulate a player streaming at this many bytes per second.
    #[arg(long)]
    stream_rate: Option<u64>,

    /// How many pieces ahead of the playback position get deadlines.
    #[arg(long, default_value_t = 8)]
    stream_lookahead: u32,
}

fn init_logging(opts: &Opts) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default_rust_log = match opts.log_level.as_ref() {
        Some(level) => match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        },
        None => "info",
    };
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(rust_log) => EnvFilter::builder()
            .parse(&rust_log)
            .context("can't parse RUST_LOG")?,
        None => EnvFilter::builder()
            .parse(default_rust_log)
            .context("can't parse default_rust_log")?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

fn load_config(opts: &Opts) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &opts.config_path {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("error reading {path:?}"))?;
            serde_json::from_str(&data)
                .with_context(|| format!("error parsing config from {path:?}"))?
        }
        None => SchedulerConfig::default(),
    };
    if opts.seed.is_some() {
        config.rng_seed = opts.seed;
    }
    Ok(config)
}

#[derive(Serialize)]
struct Report {
    finished: bool,
    ticks: u64,
    simulated_secs: f64,
    downloaded_bytes: u64,
    average_bps: u64,
    pieces_failed: u64,
    scheduler: SchedulerStats,
}

fn build_swarm(
    opts: &Opts,
    lengths: &Lengths,
    clock: &Arc<ManualClock>,
    rng: &mut SmallRng,
) -> Swarm {
    let total = lengths.total_pieces();
    let mut peers = Vec::with_capacity(opts.peers as usize);
    let mut connect_at = Vec::with_capacity(opts.peers as usize);
    for i in 0..opts.peers {
        let handle = PeerHandle::new([10, 0, (i / 250) as u8, (i % 250 + 1) as u8].into(), 6881);
        let haves = if rng.random_bool(opts.seed_ratio) {
            PeerHaves::full(total)
        } else {
            PeerHaves::from_indices(total, (0..total).filter(|_| rng.random_bool(opts.have_ratio)))
        };
        // A few unresponsive peers so snubbing and end-game get exercised.
        let upload_bps = if rng.random_bool(0.1) {
            0
        } else {
            rng.random_range(16 * 1024..2 * 1024 * 1024)
        };
        let lan_local = rng.random_bool(0.05);
        let choked = rng.random_bool(0.5);
        let clock: Arc<dyn Clock> = clock.clone();
        peers.push((SimPeer::new(handle, clock, upload_bps, lan_local, choked), haves));
        connect_at.push(rng.random_range(0..10));
    }
    Swarm {
        peers,
        connect_at,
        corrupt_ratio: opts.corrupt_ratio,
        have_ratio: opts.have_ratio / 10.,
        pieces_failed: 0,
    }
}

fn validate(opts: &Opts) -> anyhow::Result<()> {
    for (name, v) in [
        ("seed-ratio", opts.seed_ratio),
        ("have-ratio", opts.have_ratio),
        ("corrupt-ratio", opts.corrupt_ratio),
    ] {
        if !(0.0..=1.0).contains(&v) {
            bail!("{name} must be between 0 and 1, got {v}");
        }
    }
    if opts.files == 0 || opts.pieces == 0 {
        bail!("need at least one file and one piece");
    }
    if opts.tick_interval.is_zero() {
        bail!("tick interval must be positive");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(&opts)?;
    validate(&opts)?;
    let config = load_config(&opts)?;

    let mut rng = match opts.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };

    let total_length = opts.pieces as u64 * opts.piece_length as u64;
    let lengths = Lengths::new(total_length, opts.piece_length, None)?;
    let file_length = total_length / opts.files as u64;
    let mut file_lengths = vec![file_length; opts.files as usize];
    if let Some(last) = file_lengths.last_mut() {
        *last += total_length - file_length * opts.files as u64;
    }
    let disk = StaticDisk::new(lengths, &file_lengths);

    let clock = Arc::new(ManualClock::new(std::time::Instant::now()));
    let started = clock.now();
    let bucket = Arc::new(TokenBucket::new(0));
    let tokens: Option<Arc<dyn TokenDispenser>> = match opts.download_limit {
        Some(_) => Some(bucket.clone()),
        None => None,
    };
    let scheduler = Scheduler::new(
        &disk,
        SchedulerOptions {
            config,
            clock: Some(clock.clone()),
            tokens,
        },
    )
    .context("error creating scheduler")?;

    if opts.sequential {
        scheduler.set_sequential_ascending_from(0)?;
    }
    for piece in &opts.forced {
        scheduler.set_force_piece(*piece, true)?;
    }
    if let Some(rate) = opts.stream_rate {
        scheduler.register_real_time_provider(Arc::new(Playback {
            clock: clock.clone(),
            started,
            lengths,
            bytes_per_second: rate,
            lookahead: opts.stream_lookahead,
        }));
    }

    let mut swarm = build_swarm(&opts, &lengths, &clock, &mut rng);
    info!(
        pieces = opts.pieces,
        peers = opts.peers,
        size = %SF::new(total_length),
        "starting simulation"
    );

    let mut tick = 0;
    while tick < opts.max_ticks && !scheduler.is_complete() {
        let span = info_span!("tick", tick);
        let _entered = span.enter();
        if let Some(limit) = opts.download_limit {
            bucket.set((limit as f64 * opts.tick_interval.as_secs_f64()) as u64);
        }
        scheduler.schedule();
        let now = clock.advance(opts.tick_interval);
        swarm.step(tick, opts.tick_interval, now, &scheduler, &mut rng)?;
        tick += 1;

        if tick % 60 == 0 {
            let stats = scheduler.stats();
            info!(
                done = stats.done_pieces,
                total = stats.total_pieces,
                active = stats.active_pieces,
                end_game = ?stats.end_game,
                "progress"
            );
        }
    }

    let finished = scheduler.is_complete();
    if !finished {
        warn!(ticks = tick, "simulation stopped before the download finished");
    }
    let elapsed = clock.now().saturating_duration_since(started);
    let downloaded: u64 = swarm.peers.iter().map(|(p, _)| p.received_bytes()).sum();
    let average_bps = (downloaded as f64 / elapsed.as_secs_f64().max(1e-9)) as u64;
    info!(
        downloaded = %SF::new(downloaded),
        per_second = %SF::new(average_bps),
        elapsed = ?elapsed,
        "simulation finished"
    );

    let report = Report {
        finished,
        ticks: tick,
        simulated_secs: elapsed.as_secs_f64(),
        downloaded_bytes: downloaded,
        average_bps,
        pieces_failed: swarm.pieces_failed,
        scheduler: scheduler.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
