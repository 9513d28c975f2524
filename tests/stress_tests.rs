use std::sync::Barrier;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rusty_jitpool::admission::NoFuzz;
use rusty_jitpool::pages::MmapPages;
use rusty_jitpool::{
    AdmissionConfig, AdmissionController, Effort, ExecutableAllocator, ExecutableMemoryHandle, MemoryPool, OwnerTag,
};

const POOL_SIZE: usize = 1 << 20;

fn allocator(reservation_fraction: f64) -> ExecutableAllocator {
    let pool = MemoryPool::create(POOL_SIZE, MmapPages::native(), true).unwrap();
    let config = AdmissionConfig {
        reservation_fraction,
        report_must_succeed: false,
    };
    ExecutableAllocator::new(pool, AdmissionController::new(config, Box::new(NoFuzz)))
}

#[test]
fn stress_test_1() {
    // Threads jointly fill the pool exactly, then nothing more fits.
    let thread_count = 16;
    let per_thread = 64;
    let size = POOL_SIZE / (thread_count * per_thread);
    let allocator = allocator(0.0);
    let barrier = Barrier::new(thread_count);

    let mut handles: Vec<ExecutableMemoryHandle> = thread::scope(|s| {
        let workers: Vec<_> = (0..thread_count)
            .map(|i| {
                let allocator = &allocator;
                let barrier = &barrier;
                s.spawn(move || {
                    let owner = OwnerTag::new(if i % 2 == 0 { "baseline" } else { "optimizing" });
                    barrier.wait();
                    (0..per_thread)
                        .map(|_| allocator.allocate(size, owner, Effort::CanFail).expect("Pool should fit every request."))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().expect("Thread panicked."))
            .collect()
    });

    assert_eq!(handles.len(), thread_count * per_thread);
    handles.sort_by_key(|h| h.offset());
    for pair in handles.windows(2) {
        assert_eq!(pair[0].end(), pair[1].as_ptr() as usize, "Spans should tile the pool.");
    }

    let stats = allocator.statistics();
    assert_eq!(stats.bytes_allocated, stats.bytes_reserved);
    assert_eq!(stats.live_allocations, thread_count * per_thread);
    assert!(allocator.allocate(1, OwnerTag::new("late"), Effort::CanFail).is_err());

    drop(handles);
    assert_eq!(allocator.statistics().bytes_allocated, 0);
    assert_eq!(allocator.largest_free_span(), POOL_SIZE);
}

#[test]
fn stress_test_2() {
    // Allocate/release churn, the ledger must come back to empty.
    let thread_count = 8;
    let allocator = allocator(0.25);

    thread::scope(|s| {
        for seed in 0..thread_count {
            let allocator = &allocator;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let owner = OwnerTag::new("churn");
                let mut live = vec![];
                for _ in 0..2_000 {
                    if live.is_empty() || rng.gen_bool(0.55) {
                        if let Ok(handle) = allocator.allocate(rng.gen_range(1..2_048), owner, Effort::CanFail) {
                            // The memory is ours to write.
                            unsafe { handle.as_ptr().write_bytes(0xC3, handle.size()) };
                            live.push(handle);
                        }
                    } else {
                        let idx = rng.gen_range(0..live.len());
                        live.swap_remove(idx).release();
                    }
                }
            });
        }
    });

    let stats = allocator.statistics();
    assert_eq!(stats.bytes_allocated, 0);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.bytes_committed, 0);
    assert_eq!(allocator.free_bytes(), POOL_SIZE);
}

#[test]
fn stress_test_3() {
    // Concurrent can-fail requests never jointly overshoot the ceiling.
    let thread_count = 16;
    let allocator = allocator(0.25);
    let ceiling = allocator.statistics().ceiling(0.25);
    let barrier = Barrier::new(thread_count);

    let handles: Vec<ExecutableMemoryHandle> = thread::scope(|s| {
        let workers: Vec<_> = (0..thread_count)
            .map(|_| {
                let allocator = &allocator;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut mine = vec![];
                    while let Ok(handle) = allocator.allocate(4_000, OwnerTag::new("tier-up"), Effort::CanFail) {
                        mine.push(handle);
                    }
                    mine
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    let stats = allocator.statistics();
    assert!(stats.bytes_allocated <= ceiling);
    assert!(stats.bytes_allocated + 4_000 > ceiling);
    assert_eq!(stats.live_allocations, handles.len());
}
