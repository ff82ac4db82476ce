#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chanmux::{ChannelCallbacks, Endpoint, LoopbackPair, TransportConfig};
use crossbeam_channel::{Receiver, unbounded};

pub const FIFO_WORDS: u16 = 1024;

pub fn config(name: &str) -> TransportConfig {
    TransportConfig {
        name: name.to_owned(),
        open_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_secs(1),
        intent_request_timeout: Duration::from_secs(2),
        credit_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or two seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Pair with both links up and version negotiation finished.
pub fn connected_with(fifo_words: u16, a: TransportConfig, b: TransportConfig) -> LoopbackPair {
    init_tracing();
    let pair = LoopbackPair::new(fifo_words, a, b).expect("loopback pair");
    pair.link_up();
    assert!(
        wait_until(|| pair.a.is_negotiated() && pair.b.is_negotiated()),
        "version negotiation did not finish"
    );
    pair
}

pub fn connected() -> LoopbackPair {
    connected_with(FIFO_WORDS, config("a"), config("b"))
}

pub struct OpenPair {
    pub a: Endpoint,
    pub b: Endpoint,
    pub a_rx: Receiver<Bytes>,
    pub b_rx: Receiver<Bytes>,
}

fn collecting() -> (ChannelCallbacks, Receiver<Bytes>) {
    let (tx, rx) = unbounded();
    let callbacks = ChannelCallbacks::new().on_receive(move |msg| {
        let _ = tx.send(msg);
    });
    (callbacks, rx)
}

/// Open `name` from both sides at once.
pub fn open_both(pair: &LoopbackPair, name: &str) -> OpenPair {
    let (a_callbacks, a_rx) = collecting();
    let (b_callbacks, b_rx) = collecting();
    let a = pair.a.clone();
    let owned = name.to_owned();
    let opener = thread::spawn(move || a.open(&owned, a_callbacks));
    let b = pair.b.open(name, b_callbacks).expect("b side open");
    let a = opener.join().expect("opener thread").expect("a side open");
    OpenPair { a, b, a_rx, b_rx }
}

pub fn recv(rx: &Receiver<Bytes>) -> Bytes {
    rx.recv_timeout(Duration::from_secs(2))
        .expect("message delivered")
}
