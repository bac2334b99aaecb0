//! Fan-out benchmarks for the space router.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spacecast_core::{ClientSession, SpaceRouter};
use spacecast_transport::ConnectionId;
use tokio::sync::mpsc;

fn populated(space_size: usize) -> (SpaceRouter, Vec<mpsc::Receiver<Bytes>>) {
    let mut router = SpaceRouter::new();
    let mut queues = Vec::with_capacity(space_size);
    for i in 0..space_size {
        let (session, rx) = ClientSession::new(
            ConnectionId::generate(),
            i.to_string(),
            format!("user{i}"),
            "42",
            1024,
        );
        router.insert(session);
        queues.push(rx);
    }
    (router, queues)
}

fn bench_deliver_to_space(c: &mut Criterion) {
    let frame = Bytes::from(vec![b'x'; 256]);
    let mut group = c.benchmark_group("deliver_to_space");

    for space_size in [10usize, 100, 1000] {
        let (mut router, mut queues) = populated(space_size);
        group.throughput(Throughput::Elements(space_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(space_size),
            &space_size,
            |b, _| {
                b.iter(|| {
                    let delivery = router.deliver_to_space("42", black_box(&frame));
                    // Drain so no queue fills up and gets evicted
                    for rx in &mut queues {
                        while rx.try_recv().is_ok() {}
                    }
                    delivery.delivered
                })
            },
        );
    }

    group.finish();
}

fn bench_insert_remove(c: &mut Criterion) {
    c.bench_function("insert_remove", |b| {
        let mut router = SpaceRouter::new();
        b.iter(|| {
            let (session, _rx) =
                ClientSession::new(ConnectionId::generate(), "7", "alice", "42", 16);
            let id = session.id.clone();
            router.insert(session);
            router.remove(black_box(&id))
        })
    });
}

criterion_group!(benches, bench_deliver_to_space, bench_insert_remove);
criterion_main!(benches);
