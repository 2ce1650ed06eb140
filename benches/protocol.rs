use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lan_intercom::audio::level_from_samples;
use lan_intercom::network::SendQueue;
use lan_intercom::protocol::{decode_frame, encode_frame_into, PacketType};

/// One 256-frame stereo f32 period
const PERIOD_BYTES: usize = 256 * 2 * 4;

fn bench_encode_frame(c: &mut Criterion) {
    let payload = vec![0x5Au8; PERIOD_BYTES];
    let mut out = Vec::with_capacity(PERIOD_BYTES + 5);

    c.bench_function("encode_frame_into", |b| {
        b.iter(|| {
            out.clear();
            encode_frame_into(PacketType::Audio, black_box(&payload), &mut out)
        })
    });
}

fn bench_decode_stream(c: &mut Criterion) {
    let mut stream = Vec::new();
    for _ in 0..16 {
        encode_frame_into(PacketType::Audio, &[0x11u8; PERIOD_BYTES], &mut stream).ok();
    }

    c.bench_function("decode_16_frames", |b| {
        b.iter(|| {
            let mut rest = black_box(&stream[..]);
            let mut count = 0;
            while let Ok(frame) = decode_frame(rest) {
                rest = &rest[frame.consumed..];
                count += 1;
            }
            count
        })
    });
}

fn bench_send_queue(c: &mut Criterion) {
    let queue = SendQueue::new(32);
    queue.open();
    let payload = vec![0u8; PERIOD_BYTES];
    let mut batch = Vec::with_capacity(10);

    c.bench_function("enqueue_and_drain", |b| {
        b.iter(|| {
            for _ in 0..10 {
                queue.enqueue(PacketType::Audio, black_box(&payload));
            }
            queue.pop_batch(10, &mut batch);
            for packet in batch.drain(..) {
                queue.recycle(packet);
            }
        })
    });
}

fn bench_level_meter(c: &mut Criterion) {
    let samples: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();

    c.bench_function("level_from_samples", |b| {
        b.iter(|| level_from_samples(black_box(&samples)))
    });
}

criterion_group!(
    benches,
    bench_encode_frame,
    bench_decode_stream,
    bench_send_queue,
    bench_level_meter
);
criterion_main!(benches);
