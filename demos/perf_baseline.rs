//! chanmux loopback performance smoke benchmark.
//!
//! Run with `cargo run --example perf_baseline --release` (optionally set
//! `CHANMUX_BENCH_ITERS` to control the iteration count).

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use chanmux::{ChannelCallbacks, LoopbackPair, TransportConfig};
use crossbeam_channel::unbounded;
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 20_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let iterations = iterations_from_env();
    println!("chanmux perf baseline - iterations: {iterations}");
    println!("-----------------------------------------------------------------");

    let pair = LoopbackPair::new(
        4096,
        TransportConfig {
            name: "perf-a".into(),
            ..TransportConfig::default()
        },
        TransportConfig {
            name: "perf-b".into(),
            ..TransportConfig::default()
        },
    )?;
    pair.link_up();
    while !(pair.a.is_negotiated() && pair.b.is_negotiated()) {
        thread::sleep(Duration::from_millis(1));
    }

    let (tx, delivered) = unbounded();
    let a = pair.a.clone();
    let opener = thread::spawn(move || a.open("perf", ChannelCallbacks::new()));
    let _receiver = pair.b.open(
        "perf",
        ChannelCallbacks::new().on_receive(move |msg| {
            let _ = tx.send(msg.len());
        }),
    )?;
    let sender = opener.join().map_err(|_| "opener thread panicked")??;

    for size in [8usize, 64, 512, 1024, 4096] {
        let payload = vec![0xa5; size];
        let start = Instant::now();
        for _ in 0..iterations {
            sender.send(&payload)?;
        }
        for _ in 0..iterations {
            delivered.recv_timeout(Duration::from_secs(5))?;
        }
        report(&format!("send {size}B"), iterations, size, start.elapsed());
    }

    let stats = pair.a.stats();
    println!(
        "credit stalls {} (avg {:?} us), read notifies {}, intent requests {}",
        stats.credit_stalls,
        stats.avg_credit_wait_us(),
        stats.read_notifies,
        stats.intent_requests_sent
    );
    Ok(())
}

fn iterations_from_env() -> usize {
    env::var("CHANMUX_BENCH_ITERS")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|iters| *iters > 0)
        .unwrap_or(DEFAULT_ITERATIONS)
}

fn report(label: &str, iterations: usize, size: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let ns_per_op = elapsed.as_nanos() as f64 / iterations as f64;
    let mib_per_sec = (iterations * size) as f64 / secs / (1024.0 * 1024.0);
    println!("{label:<32} total={elapsed:?} | {ns_per_op:>8.1} ns/op | {mib_per_sec:>8.2} MiB/s");
}
