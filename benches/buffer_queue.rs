//! Buffer queue and request pool benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mediabufs::bufs::{BufQueue, QueueEntry};
use mediabufs::media::MediaPool;
use mediabufs::memory::round_up_size;
use mediabufs::poll::PollFlags;
use mediabufs::testing::{ManualPollQueue, MockMediaDevice};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

struct Slot {
    fd: RawFd,
    uses: u64,
}

impl QueueEntry for Slot {
    fn primary_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn on_put_free(&mut self) {}

    fn on_put_inuse(&mut self) {
        self.uses += 1;
    }
}

fn filled(n: usize) -> BufQueue<Slot> {
    let queue = BufQueue::new();
    for fd in 0..n {
        queue.put_free(Slot {
            fd: fd as RawFd,
            uses: 0,
        });
    }
    queue
}

fn bench_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_free_cycle");

    for n in [4, 16, 64] {
        let queue = filled(n);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(n), &queue, |b, queue| {
            b.iter(|| {
                let slot = queue.get_free();
                queue.put_free(slot);
            });
        });
    }

    group.finish();
}

fn bench_inuse_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_inuse_cycle");

    // Completion out of order by one, as with B-frame reordering
    for n in [4, 16, 64] {
        let queue = filled(n);
        group.throughput(Throughput::Elements(2));
        group.bench_with_input(BenchmarkId::from_parameter(n), &queue, |b, queue| {
            b.iter(|| {
                let a = queue.get_free();
                let b2 = queue.get_free();
                let (fa, fb) = (a.fd, b2.fd);
                queue.put_inuse(a);
                queue.put_inuse(b2);
                for fd in [fb, fa] {
                    if let Some(slot) = queue.extract_inuse(fd) {
                        queue.put_free(slot);
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_queue_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_concurrent");
    let queue = Arc::new(filled(8));

    group.throughput(Throughput::Elements(400));
    group.bench_function("4_threads_100_ops_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            let slot = queue.get_free();
                            std::hint::black_box(slot.fd);
                            queue.put_free(slot);
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_request_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_cycle");
    let poll = ManualPollQueue::new();
    let pool = MediaPool::with_device(
        Box::new(MockMediaDevice::new()),
        &poll.shared(),
        6,
        Duration::from_secs(2),
    )
    .unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("acquire_submit_complete", |b| {
        b.iter(|| {
            let req = pool.acquire();
            let fd = req.raw_fd();
            req.submit().unwrap();
            poll.fire(fd, PollFlags::PRI);
        });
    });

    group.finish();
}

fn bench_round_up_size(c: &mut Criterion) {
    c.bench_function("round_up_size", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for x in (0..1 << 20).step_by(4093) {
                acc = acc.wrapping_add(round_up_size(std::hint::black_box(x)));
            }
            acc
        });
    });
}

criterion_group!(
    benches,
    bench_free_cycle,
    bench_inuse_cycle,
    bench_queue_concurrent,
    bench_request_cycle,
    bench_round_up_size
);
criterion_main!(benches);
