// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! nerve-echo - marker protocol server
//!
//! Echoes every int frame and answers every long frame with its successor.
//! Prints engine counters periodically and on exit.

use clap::Parser;
use nerve::protocol::marker::MarkerProtocol;
use nerve::{Engine, EngineConfig, MetricsSnapshot};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Marker protocol echo server
#[derive(Parser, Debug)]
#[command(name = "nerve-echo")]
#[command(version = "0.1.0")]
#[command(about = "Serve the nerve marker protocol (echo ints, increment longs)")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    listen: SocketAddr,

    /// Reactor threads (0 = one per core)
    #[arg(short, long, default_value = "0")]
    reactors: usize,

    /// I/O worker threads (0 = two per core)
    #[arg(long, default_value = "0")]
    io_workers: usize,

    /// Dispatcher threads (0 = one per core)
    #[arg(long, default_value = "0")]
    dispatch_workers: usize,

    /// Drain deadline in milliseconds on shutdown and peer close
    #[arg(long, default_value = "2000")]
    linger_ms: u64,

    /// Seconds between stats lines (0 = only on exit)
    #[arg(short, long, default_value = "10")]
    stats_interval: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = build_config(args);
    let linger = config.linger;
    let engine = Engine::start(MarkerProtocol::new(), config)?;
    let addr = engine.listen(args.listen)?;
    log::info!("nerve-echo listening on {}", addr);

    let interval = Duration::from_secs(args.stats_interval);
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if !interval.is_zero() && last_report.elapsed() >= interval {
            print_stats(&engine.metrics_snapshot());
            last_report = Instant::now();
        }
    }

    log::info!("shutting down");
    engine.shutdown(linger);
    print_stats(&engine.metrics_snapshot());
    let pool = engine.pool_stats();
    println!(
        "buffer pool: {} hits, {} misses, {} discards",
        pool.hits, pool.misses, pool.discards
    );
    Ok(())
}

fn build_config(args: &Args) -> EngineConfig {
    let mut config = EngineConfig::default().with_linger(Duration::from_millis(args.linger_ms));
    if args.reactors > 0 {
        config = config.with_reactors(args.reactors);
    }
    if args.io_workers > 0 {
        config = config.with_io_workers(args.io_workers);
    }
    if args.dispatch_workers > 0 {
        config = config.with_dispatch_workers(args.dispatch_workers);
    }
    config
}

fn print_stats(s: &MetricsSnapshot) {
    println!(
        "conns: {} active / {} opened | frames: {} in, {} out | dispatched: {} ({:.1}/s) | errors: {} framing, {} transport, {} handler, {} lookup | resync: {} B",
        s.active_connections,
        s.connections_opened,
        s.frames_decoded,
        s.frames_encoded,
        s.messages_dispatched,
        s.dispatch_rate(),
        s.framing_errors,
        s.transport_errors,
        s.handler_failures,
        s.protocol_lookup_errors,
        s.resync_bytes
    );
}
