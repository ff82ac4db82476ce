mod common;

use std::thread;
use std::time::Duration;

use chanmux::transport::Operation;
use chanmux::{ChannelCallbacks, Error, Frame};
use common::{config, connected, connected_with, open_both, recv, wait_until, FIFO_WORDS};
use proptest::prelude::*;
use proptest::test_runner::{TestCaseError, TestRunner};

fn data_frames(frames: Vec<Frame>) -> Vec<Frame> {
    frames
        .into_iter()
        .filter(|frame| matches!(frame, Frame::TxData { .. } | Frame::TxShortData { .. }))
        .collect()
}

#[test]
fn short_message_travels_in_one_short_frame() {
    let pair = connected();
    let opened = open_both(&pair, "short");
    pair.a_link.set_recording(true);

    opened.a.send(b"sixteen byte msg").unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], b"sixteen byte msg");

    let frames = data_frames(pair.a_link.take_frames());
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::TxShortData {
            left_size, payload, ..
        } => {
            assert_eq!(*left_size, 0);
            assert_eq!(payload.len(), 16);
        }
        other => panic!("expected short data, got {other:?}"),
    }
}

#[test]
fn aligned_message_goes_out_as_a_single_chunk() {
    let pair = connected();
    let opened = open_both(&pair, "twenty");
    pair.a_link.set_recording(true);

    let message = [7u8; 20];
    opened.a.send(&message).unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], &message);

    let frames = data_frames(pair.a_link.take_frames());
    assert_eq!(frames.len(), 1);
    assert!(matches!(
        &frames[0],
        Frame::TxData { cont: false, chunk, .. } if chunk.payload.len() == 20 && chunk.left_size == 0
    ));
}

#[test]
fn unaligned_message_splits_into_chunk_and_tail() {
    let pair = connected();
    let opened = open_both(&pair, "tail");
    pair.a_link.set_recording(true);

    let message: Vec<u8> = (0..21).collect();
    opened.a.send(&message).unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], &message[..]);

    let frames = data_frames(pair.a_link.take_frames());
    assert_eq!(frames.len(), 2);
    assert!(matches!(&frames[0], Frame::TxData { chunk, .. } if chunk.payload.len() == 8 && chunk.left_size == 13));
    assert!(matches!(&frames[1], Frame::TxShortData { payload, left_size: 0, .. } if payload.len() == 13));
}

#[test]
fn oversized_message_requests_a_bigger_intent() {
    let pair = connected();
    let opened = open_both(&pair, "big");
    pair.a_link.set_recording(true);

    let message: Vec<u8> = (0..1536u32).map(|i| (i % 251) as u8).collect();
    opened.a.send(&message).unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], &message[..]);

    let frames = pair.a_link.take_frames();
    let requested: Vec<u32> = frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::IntentRequest { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(requested.len(), 1);
    assert!(requested[0] >= 512);

    let pieces = data_frames(frames);
    assert_eq!(pieces.len(), 2);
    assert!(matches!(&pieces[0], Frame::TxData { cont: false, chunk, .. } if chunk.payload.len() == 1024));
    assert!(matches!(&pieces[1], Frame::TxData { cont: true, chunk, .. } if chunk.left_size == 0));

    assert_eq!(pair.a.stats().intent_requests_sent, 1);
    assert!(wait_until(|| pair.b.stats().intent_requests_granted == 1));
}

#[test]
fn messages_arrive_in_order_in_both_directions() {
    let pair = connected();
    let opened = open_both(&pair, "order");

    for i in 0..200u32 {
        let len = 1 + (i as usize * 37) % 900;
        let message = vec![(i % 256) as u8; len];
        opened.a.send(&message).unwrap();
        opened.b.send(&message).unwrap();
    }
    for i in 0..200u32 {
        let len = 1 + (i as usize * 37) % 900;
        for rx in [&opened.b_rx, &opened.a_rx] {
            let got = recv(rx);
            assert_eq!(got.len(), len);
            assert!(got.iter().all(|b| *b == (i % 256) as u8));
        }
    }
    assert!(wait_until(|| pair.b.stats().messages_delivered == 200));
}

#[test]
fn try_send_without_intents_would_block() {
    let mut bare = config("b");
    bare.default_intents.clear();
    let pair = connected_with(FIFO_WORDS, config("a"), bare);
    let opened = open_both(&pair, "bare");

    assert!(matches!(opened.a.try_send(b"now"), Err(Error::WouldBlock)));
    opened.a.send(b"later").unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], b"later");
}

#[test]
fn intent_request_beyond_peer_limit_is_rejected() {
    let mut stingy = config("b");
    stingy.default_intents.clear();
    stingy.max_intent_size = 512;
    let pair = connected_with(FIFO_WORDS, config("a"), stingy);
    let opened = open_both(&pair, "stingy");

    assert!(matches!(
        opened.a.send(&[0u8; 1000]),
        Err(Error::IntentRejected { size: 1000 })
    ));
    assert!(wait_until(|| pair.b.stats().intent_requests_denied == 1));

    opened.a.send(&[1u8; 500]).unwrap();
    assert_eq!(recv(&opened.b_rx).len(), 500);
}

#[test]
fn message_size_limits_are_enforced() {
    let pair = connected();
    let opened = open_both(&pair, "limits");
    assert!(matches!(opened.a.send(&[]), Err(Error::MessageSize { len: 0, .. })));
    let too_big = vec![0u8; config("a").max_message_size + 1];
    assert!(matches!(opened.a.send(&too_big), Err(Error::MessageSize { .. })));
}

#[test]
fn starved_sender_waits_for_space_and_resumes() {
    let pair = connected_with(64, config("a"), config("b"));
    let opened = open_both(&pair, "tight");
    assert!(wait_until(|| pair.a_link.used_words() == 0));
    pair.a_link.pause();

    let a = opened.a;
    let sender = thread::spawn(move || {
        let result = (0..10u8).try_for_each(|seq| a.send(&[seq; 100]));
        (a, result)
    });

    assert!(wait_until(|| pair.a.stats().read_notifies >= 1));
    thread::sleep(Duration::from_millis(50));
    assert!(!sender.is_finished());

    pair.a_link.resume();
    let (_a, result) = sender.join().unwrap();
    result.unwrap();
    for seq in 0..10u8 {
        assert_eq!(&recv(&opened.b_rx)[..], &[seq; 100]);
    }
    assert!(pair.a.stats().credit_stalls >= 1);
}

#[test]
fn message_cut_short_does_not_leak_into_the_next_one() {
    let mut sender = config("a");
    sender.max_chunk_size = 64;
    sender.credit_timeout = Duration::from_millis(300);
    let pair = connected_with(128, sender, config("b"));
    let opened = open_both(&pair, "cut");
    assert!(wait_until(|| pair.a_link.used_words() == 0));
    pair.a_link.set_recording(true);
    pair.a_link.pause();

    assert!(matches!(
        opened.a.send(&[0xee; 1000]),
        Err(Error::Timeout {
            operation: Operation::Credit
        })
    ));
    let written = data_frames(pair.a_link.take_frames()).len();
    assert!(written > 1, "only {written} chunk(s) made it out");
    pair.a_link.resume();

    opened.a.send(b"hello").unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], b"hello");
    assert!(wait_until(|| pair.b.stats().messages_delivered == 1));
    assert!(opened.b_rx.try_recv().is_err());

    opened.a.send(&[0x11; 300]).unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], &[0x11; 300]);
}

#[test]
fn busy_link_is_retried() {
    let pair = connected();
    let opened = open_both(&pair, "busy");
    pair.a_link.inject_busy(3);
    opened.a.send(b"eventually").unwrap();
    assert_eq!(&recv(&opened.b_rx)[..], b"eventually");
}

#[test]
fn message_without_receive_callback_is_counted_as_dropped() {
    let pair = connected();
    let a = pair.a.clone();
    let opener = thread::spawn(move || a.open("mute", ChannelCallbacks::new()));
    let _b = pair.b.open("mute", ChannelCallbacks::new()).unwrap();
    let a = opener.join().unwrap().unwrap();

    a.send(b"nobody listens").unwrap();
    assert!(wait_until(|| pair.b.stats().messages_dropped == 1));
}

#[test]
fn channels_multiplex_concurrent_senders() {
    let pair = connected();
    let names = ["left", "middle", "right"];
    let opened: Vec<_> = names.iter().map(|name| open_both(&pair, name)).collect();

    thread::scope(|scope| {
        for (idx, channel) in opened.iter().enumerate() {
            scope.spawn(move || {
                for seq in 0..50u8 {
                    channel.a.send(&[idx as u8, seq, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
                }
            });
        }
    });

    for (idx, channel) in opened.iter().enumerate() {
        for seq in 0..50u8 {
            let got = recv(&channel.b_rx);
            assert_eq!((got[0], got[1]), (idx as u8, seq));
        }
    }
}

fn roundtrip_lengths(max_chunk_size: usize) {
    let mut sender = config("a");
    sender.max_chunk_size = max_chunk_size;
    let pair = connected_with(FIFO_WORDS, sender, config("b"));
    let opened = open_both(&pair, "prop");

    let mut runner = TestRunner::new(ProptestConfig::with_cases(64));
    runner
        .run(&proptest::collection::vec(any::<u8>(), 1..=1024), |payload| {
            opened
                .a
                .send(&payload)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let got = opened
                .b_rx
                .recv_timeout(Duration::from_secs(2))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(&got[..], &payload[..]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn arbitrary_lengths_reassemble() {
    roundtrip_lengths(1024);
}

#[test]
fn arbitrary_lengths_reassemble_across_many_chunks() {
    roundtrip_lengths(64);
}
