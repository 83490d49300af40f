// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast Buffer Latency Benchmark
//!
//! Measures single-writer `transmit` cost at a range of payload sizes, and the cost of
//! `CopyBroadcastReceiver::receive` for a reader kept current with the writer (no lap).

use agrona::broadcast::{layout, BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver};
use agrona::buffer::{ByteOrder, ByteRegion};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box as bb;

fn make_pair(capacity: usize) -> (BroadcastTransmitter, BroadcastReceiver) {
    let region = ByteRegion::new_heap(capacity + layout::TRAILER_LENGTH, ByteOrder::Native)
        .expect("region allocation");
    let tx = BroadcastTransmitter::new(region.clone(), capacity).expect("transmitter");
    let rx = BroadcastReceiver::new(region, capacity).expect("receiver");
    (tx, rx)
}

fn bench_transmit_by_payload_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_transmit_by_size");

    for size in [16, 64, 256, 1024] {
        let (tx, _rx) = make_pair(1 << 16);
        let payload = vec![0xCDu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                tx.transmit(1, bb(&payload)).expect("transmit should succeed");
            });
        });
    }

    group.finish();
}

fn bench_copy_receiver_kept_current(c: &mut Criterion) {
    c.bench_function("broadcast_copy_receiver_kept_current", |b| {
        let (tx, rx) = make_pair(1 << 16);
        let mut copy_rx = CopyBroadcastReceiver::new(rx);
        let payload = [0xEFu8; 64];

        b.iter(|| {
            tx.transmit(1, &payload).expect("transmit should succeed");
            copy_rx
                .receive(|_type_id, _buf| {})
                .expect("receive should succeed");
        });
    });
}

criterion_group!(
    broadcast_benches,
    bench_transmit_by_payload_size,
    bench_copy_receiver_kept_current
);
criterion_main!(broadcast_benches);
