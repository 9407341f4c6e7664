use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use millstream::FramingBuffer;

fn lines(count: usize, line_len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(count * (line_len + 2));
    for i in 0..count {
        data.extend((0..line_len).map(|j| b'a' + ((i + j) % 26) as u8));
        data.extend_from_slice(b"\r\n");
    }
    data
}

fn bench_delimiter_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("delimiter_fragmented");
    let data = lines(256, 120);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for fragment in [1usize, 7, 64, 1500] {
        group.bench_with_input(
            BenchmarkId::from_parameter(fragment),
            &fragment,
            |b, &fragment| {
                b.iter(|| {
                    let mut buffer = FramingBuffer::new(1 << 20);
                    let mut frames = 0;
                    for chunk in data.chunks(fragment) {
                        buffer.append(chunk);
                        while let Ok(line) = buffer.read_by_delimiter(b"\r\n") {
                            black_box(&line);
                            frames += 1;
                        }
                    }
                    assert_eq!(frames, 256);
                });
            },
        );
    }
    group.finish();
}

fn bench_length_prefixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("length_prefixed");
    let mut data = Vec::new();
    for i in 0..512u32 {
        let payload = vec![(i % 251) as u8; 64 + (i as usize % 64)];
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(&payload);
    }
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("mark_and_reset", |b| {
        b.iter(|| {
            let mut buffer = FramingBuffer::new(1 << 20);
            let mut frames: Vec<Bytes> = Vec::with_capacity(512);
            for chunk in data.chunks(97) {
                buffer.append(chunk);
                loop {
                    buffer.mark_read_position();
                    let Ok(len) = buffer.read_u32() else {
                        buffer.reset_to_read_mark();
                        break;
                    };
                    match buffer.read_by_length(len as usize) {
                        Ok(frame) => frames.push(frame),
                        Err(_) => {
                            buffer.reset_to_read_mark();
                            break;
                        }
                    }
                }
            }
            assert_eq!(frames.len(), 512);
            black_box(frames)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_delimiter_fragmented, bench_length_prefixed);
criterion_main!(benches);
