//! Coherence Engine CLI.
//!
//! Replays a timestamped event trace through one cache and prints every
//! message the cache sends, in delivery order, followed by the statistics.
//!
//! # Usage
//!
//! ```text
//! memhier-coherence --config configs/default.toml --trace traces/fanout.json
//! ```
//!
//! The trace is a JSON array of events, each with a `time` field next to the
//! event fields (`cmd`, `addr`, `src`, optional `payload`, `flags`, ...).
//! Events from below (responses, invalidations) are part of the same trace.

use clap::Parser;
use serde::Deserialize;
use std::{fs, process};

use memhier_coherence::cache::{Cache, Outbound};
use memhier_coherence::coherence::MemEvent;
use memhier_coherence::config::Config;

/// Command-line arguments for the trace driver.
#[derive(Parser, Debug)]
#[command(author, version, about = "Cache coherence protocol engine")]
struct Args {
    #[arg(short, long, default_value = "configs/default.toml")]
    config: String,

    #[arg(short, long)]
    trace: String,

    /// Print the statistics as JSON instead of the text report.
    #[arg(long)]
    json: bool,
}

/// One trace record: an event and the cycle it arrives at.
#[derive(Deserialize, Debug)]
struct TraceEntry {
    time: u64,
    #[serde(flatten)]
    event: MemEvent,
}

fn main() {
    let default_level = if cfg!(feature = "always-trace") {
        "trace"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let args = Args::parse();
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    let mut trace = match load_trace(&args.trace) {
        Ok(trace) => trace,
        Err(e) => {
            eprintln!("Error: failed to load trace '{}': {}", args.trace, e);
            process::exit(1);
        }
    };
    trace.sort_by_key(|entry| entry.time);

    let mut cache = match Cache::new(&config) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    println!("Cache Configuration");
    println!("--------------------");
    println!("  Name:               {}", config.cache.name);
    println!("  Protocol:           {}", config.cache.protocol);
    println!(
        "  Geometry:           {} lines x {} B, {} ways",
        config.cache.lines, config.cache.line_bytes, config.cache.ways
    );
    println!("  MSHR entries:       {}", config.cache.mshr_entries);
    println!("  Upstream:           {}", config.cache.upstream.join(", "));
    println!("  Lower level:        {}", config.cache.lower_level.join(", "));
    println!(
        "  Latency (acc/tag/mshr): {}/{}/{}",
        config.timing.access_latency, config.timing.tag_latency, config.timing.mshr_latency
    );
    println!("--------------------");

    for entry in trace {
        print_outbound(cache.drain_outgoing(entry.time));
        if let Err(e) = cache.handle_event(entry.event, entry.time) {
            eprintln!("\n[!] FATAL: {}", e);
            cache.stats().print(cache.name());
            process::exit(1);
        }
    }
    print_outbound(cache.drain_outgoing(u64::MAX));

    if args.json {
        match serde_json::to_string_pretty(cache.stats()) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: failed to serialise statistics: {}", e);
                process::exit(1);
            }
        }
    } else {
        cache.stats().print(cache.name());
    }
}

fn load_trace(path: &str) -> Result<Vec<TraceEntry>, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn print_outbound(out: Outbound) {
    for msg in out.merged() {
        println!("{}", msg);
    }
}
