//! Performance benchmarks for tether-crypto.
//!
//! Run with: `cargo bench -p tether-crypto`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand_core::OsRng;
use tether_crypto::Keypair;
use tether_crypto::noise::{NoiseHandshake, NoiseKeypair, NoiseReceiver, NoiseSender};
use tether_crypto::pnet::{Keystream, NetworkSecret};

// ============================================================================
// Handshake Benchmarks
// ============================================================================

fn run_handshake() -> (NoiseHandshake, NoiseHandshake) {
    let mut initiator = NoiseHandshake::new_initiator(&NoiseKeypair::generate()).unwrap();
    let mut responder = NoiseHandshake::new_responder(&NoiseKeypair::generate()).unwrap();

    let msg1 = initiator.write_message(&[]).unwrap();
    responder.read_message(&msg1).unwrap();
    let msg2 = responder.write_message(&[0u8; 96]).unwrap();
    initiator.read_message(&msg2).unwrap();
    let msg3 = initiator.write_message(&[0u8; 96]).unwrap();
    responder.read_message(&msg3).unwrap();

    (initiator, responder)
}

fn bench_noise_handshake(c: &mut Criterion) {
    c.bench_function("noise_xx_handshake", |b| b.iter(run_handshake));
}

fn bench_identity_sign_verify(c: &mut Criterion) {
    let keypair = Keypair::generate(&mut OsRng);
    let public = keypair.public();
    let static_key = NoiseKeypair::generate().public_key();
    let signature = keypair.sign(&static_key);

    c.bench_function("identity_sign", |b| {
        b.iter(|| keypair.sign(black_box(&static_key)))
    });
    c.bench_function("identity_verify", |b| {
        b.iter(|| public.verify(black_box(&static_key), black_box(&signature)))
    });
}

// ============================================================================
// Transport Benchmarks
// ============================================================================

fn session_pair() -> (NoiseSender, NoiseReceiver) {
    let (initiator, responder) = run_handshake();
    let (sender, _) = initiator.into_transport().unwrap().split();
    let (_, receiver) = responder.into_transport().unwrap().split();
    (sender, receiver)
}

fn bench_transport_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("noise_encrypt");

    for size in [64, 1024, 16384, 65519] {
        let plaintext = vec![0xAA; size];
        let (mut sender, _) = session_pair();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| sender.encrypt(black_box(&plaintext)).unwrap())
        });
    }

    group.finish();
}

fn bench_transport_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("noise_roundtrip");

    for size in [1024, 65519] {
        let plaintext = vec![0x55; size];
        let (mut sender, mut receiver) = session_pair();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let ct = sender.encrypt(black_box(&plaintext)).unwrap();
                receiver.decrypt(&ct).unwrap()
            })
        });
    }

    group.finish();
}

// ============================================================================
// Private Network Benchmarks
// ============================================================================

fn bench_pnet_keystream(c: &mut Criterion) {
    let mut group = c.benchmark_group("pnet_keystream");
    let secret = NetworkSecret::from_bytes([0x42; 32]);

    for size in [64, 1024, 16384, 65536] {
        let mut buf = vec![0u8; size];
        let mut keystream = Keystream::new(&secret, &[7u8; 24]);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| keystream.apply(black_box(&mut buf)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_noise_handshake,
    bench_identity_sign_verify,
    bench_transport_encrypt,
    bench_transport_roundtrip,
    bench_pnet_keystream,
);
criterion_main!(benches);
