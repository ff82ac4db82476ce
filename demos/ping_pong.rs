//! Ping-pong over an in-process loopback link
//!
//! Run with `RUST_LOG=chanmux=debug cargo run --example ping_pong` to watch
//! the handshakes.

use std::thread;
use std::time::Duration;

use chanmux::{ChannelCallbacks, LoopbackPair, TransportConfig};
use crossbeam_channel::unbounded;
use tracing_subscriber::EnvFilter;

const ROUNDS: usize = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    println!("chanmux ping-pong");
    println!("=================\n");

    let pair = LoopbackPair::new(
        1024,
        TransportConfig {
            name: "apps".into(),
            ..TransportConfig::default()
        },
        TransportConfig {
            name: "modem".into(),
            ..TransportConfig::default()
        },
    )?;
    pair.link_up();
    while !(pair.a.is_negotiated() && pair.b.is_negotiated()) {
        thread::sleep(Duration::from_millis(1));
    }
    println!("link up, features {:?}", pair.a.features());

    // Callbacks run on the receive worker, so replies are sent from here.
    let (pings_tx, pings) = unbounded();
    let (pongs_tx, pongs) = unbounded();

    let modem = pair.b.clone();
    let responder = thread::spawn(move || {
        let endpoint = modem.open(
            "ping",
            ChannelCallbacks::new().on_receive(move |msg| {
                let _ = pings_tx.send(msg);
            }),
        )?;
        for _ in 0..ROUNDS {
            let ping = pings.recv_timeout(Duration::from_secs(5))?;
            let mut reply = b"pong ".to_vec();
            reply.extend_from_slice(&ping[5..]);
            endpoint.send(&reply)?;
        }
        endpoint.close()?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    });

    let endpoint = pair.a.open(
        "ping",
        ChannelCallbacks::new().on_receive(move |msg| {
            let _ = pongs_tx.send(msg);
        }),
    )?;
    println!(
        "channel open: local id {:?}, remote id {:?}",
        endpoint.local_id(),
        endpoint.remote_id()
    );

    for round in 0..ROUNDS {
        endpoint.send(format!("ping {round}").as_bytes())?;
        let pong = pongs.recv_timeout(Duration::from_secs(5))?;
        println!("round {round}: {}", String::from_utf8_lossy(&pong));
    }

    responder
        .join()
        .map_err(|_| "responder thread panicked")?
        .map_err(|err| err.to_string())?;
    let stats = pair.a.stats();
    println!(
        "\nframes sent {} / received {}, messages sent {}",
        stats.frames_sent, stats.frames_received, stats.messages_sent
    );
    Ok(())
}
