use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardtun::fec::{ErasureCoder, FecDecoder, FecEncoder, ReedSolomon};
use shardtun::{Decoded, Method, SecureFramer};
use std::sync::Arc;

const PAYLOAD_LEN: usize = 1200;

/// Seal and open one MTU-sized datagram per method
fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));

    let payload = vec![0x42u8; PAYLOAD_LEN];
    let cases = [
        (Method::ChaCha20, false),
        (Method::ChaCha20, true),
        (Method::Aes128Ctr, false),
        (Method::Aes256Cfb, true),
        (Method::Rc4Md5, false),
        (Method::Aes128Gcm, false),
        (Method::ChaCha20Poly1305, false),
    ];

    for (method, auth) in cases {
        let framer = SecureFramer::new(method, "bench", 1400, auth).unwrap();
        let label = if auth {
            format!("{}+auth", method)
        } else {
            method.to_string()
        };

        group.bench_with_input(BenchmarkId::new("seal", &label), &payload, |b, payload| {
            b.iter(|| framer.seal(black_box(payload)).unwrap())
        });

        let packet = framer.seal(&payload).unwrap();
        group.bench_with_input(BenchmarkId::new("open", &label), &packet, |b, packet| {
            b.iter(|| match framer.open(black_box(packet)) {
                Decoded::Accepted(p) => p,
                other => panic!("unexpected {:?}", other),
            })
        });
    }

    group.finish();
}

/// Encode full groups, and decode groups missing M data shards
fn bench_fec(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec");

    for (k, m) in [(3, 1), (10, 3), (20, 10)] {
        let coder: Arc<dyn ErasureCoder> = Arc::new(ReedSolomon::new(k, m).unwrap());
        let datagrams: Vec<Vec<u8>> = (0..k).map(|i| vec![i as u8; PAYLOAD_LEN]).collect();
        group.throughput(Throughput::Bytes((k * PAYLOAD_LEN) as u64));

        group.bench_function(BenchmarkId::new("encode", format!("{}+{}", k, m)), |b| {
            let mut encoder = FecEncoder::new(coder.clone());
            b.iter(|| {
                for d in &datagrams {
                    black_box(encoder.encode(d).unwrap());
                }
            })
        });

        let mut encoder = FecEncoder::new(coder.clone());
        let shards: Vec<_> = datagrams
            .iter()
            .flat_map(|d| encoder.encode(d).unwrap())
            .skip(m)
            .collect();
        group.bench_function(BenchmarkId::new("reconstruct", format!("{}+{}", k, m)), |b| {
            b.iter(|| {
                let mut decoder = FecDecoder::new(coder.clone(), 16);
                let mut recovered = 0;
                for shard in &shards {
                    recovered += decoder.decode(black_box(shard)).unwrap().len();
                }
                assert_eq!(recovered, k);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_framer, bench_fec);
criterion_main!(benches);
