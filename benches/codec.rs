use bytes::{Bytes, BytesMut};
use chanmux::protocol::{DataChunk, Frame, FrameIter, IntentDescriptor, split_message};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

fn data_frame(len: usize) -> Frame {
    Frame::TxData {
        cid: 1,
        iid: 7,
        cont: false,
        chunk: DataChunk {
            left_size: 0,
            addr: 0,
            payload: Bytes::from(vec![0u8; len]),
        },
    }
}

fn encoded(frames: &[Frame]) -> Bytes {
    let mut buf = BytesMut::new();
    for frame in frames {
        frame.encode(&mut buf);
    }
    buf.freeze()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    // Short inline payload
    let short = Frame::TxShortData {
        cid: 1,
        iid: 7,
        left_size: 0,
        payload: Bytes::from_static(b"0123456789abcdef"),
    };
    group.throughput(Throughput::Bytes(16));
    group.bench_function("encode_short", |b| {
        b.iter(|| black_box(short.to_bytes()));
    });

    // One full chunk
    let chunk = data_frame(1024);
    group.throughput(Throughput::Bytes(1024));
    group.bench_function("encode_chunk_1kb", |b| {
        b.iter(|| black_box(chunk.to_bytes()));
    });

    // Intent advertisement with a full batch
    let intents = Frame::Intent {
        cid: 1,
        intents: (0..4)
            .map(|id| IntentDescriptor {
                size: 1024,
                id,
                addr: 0,
            })
            .collect(),
    };
    group.bench_function("encode_intent_batch", |b| {
        b.iter(|| black_box(intents.to_bytes()));
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    // Control-heavy buffer
    let control = encoded(&[
        Frame::OpenAck { cid: 3 },
        Frame::RxDone {
            cid: 3,
            iid: 1,
            reuse: true,
        },
        Frame::IntentRequestAck {
            cid: 3,
            granted: true,
        },
        Frame::ReadNotify,
    ]);
    group.throughput(Throughput::Bytes(control.len() as u64));
    group.bench_function("decode_control", |b| {
        b.iter(|| {
            for frame in FrameIter::new(control.clone()) {
                black_box(frame.unwrap());
            }
        });
    });

    // Data-heavy buffer
    let data = encoded(&[data_frame(1024), data_frame(1024), data_frame(512)]);
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("decode_chunks_2_5kb", |b| {
        b.iter(|| {
            for frame in FrameIter::new(data.clone()) {
                black_box(frame.unwrap());
            }
        });
    });

    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.bench_function("split_message", |b| {
        b.iter(|| {
            for len in [1usize, 16, 20, 21, 1023, 4096] {
                black_box(split_message(black_box(len)));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_split);
criterion_main!(benches);
