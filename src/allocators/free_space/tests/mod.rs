use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::PageOp;
use crate::pages::heap_pages::{HeapPages, PageEvent, Recorder, FAKE_PAGE_SIZE};
use crate::pages::PageCapabilities;

use super::*;


const OWNER: OwnerTag = OwnerTag::new("test");

fn allocator(pages: usize, capabilities: PageCapabilities) -> (FreeSpaceAllocator<HeapPages>, Arc<Recorder>) {
    format::init();
    let provider = HeapPages::new(capabilities);
    let recorder = provider.recorder();
    let pool = MemoryPool::create(pages * FAKE_PAGE_SIZE, provider, true).unwrap();
    recorder.clear();
    (FreeSpaceAllocator::new(pool), recorder)
}

#[test]
fn test_1() {
    let (mut allocator, _) = allocator(16, PageCapabilities::EXPLICIT);

    for size in (0..=300).chain([4095, 4096, 4097, 10_000]) {
        let span = allocator.allocate(size, OWNER).unwrap();
        assert!(span.size >= size);
        assert!(span.size > 0);
        assert_eq!(span.size % ALLOCATION_GRANULE, 0);
        assert_eq!(span.offset % ALLOCATION_GRANULE, 0);
        allocator.release(span);
    }
    assert_eq!(allocator.statistics().bytes_allocated, 0);
}

#[test]
fn test_2() {
    // Random allocate/release sequence, counters should never drift.
    let (mut allocator, _) = allocator(64, PageCapabilities::EXPLICIT);
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut live: Vec<Span> = vec![];

    for _ in 0..5_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            if let Ok(span) = allocator.allocate(rng.gen_range(1..3_000), OWNER) {
                assert!(live.iter().all(|other| !other.overlaps(&span)), "{span:?} overlaps a live span.");
                live.push(span);
            }
        } else {
            let span = live.swap_remove(rng.gen_range(0..live.len()));
            allocator.release(span);
        }

        let stats = allocator.statistics();
        assert_eq!(stats.bytes_allocated, live.iter().map(|s| s.size).sum::<usize>());
        assert_eq!(stats.bytes_allocated + allocator.free_bytes(), stats.bytes_reserved);
        assert_eq!(stats.live_allocations, live.len());
        assert!(stats.bytes_committed >= stats.bytes_allocated);
    }

    for span in live.drain(..) {
        allocator.release(span);
    }
    let stats = allocator.statistics();
    assert_eq!(stats.bytes_allocated, 0);
    assert_eq!(stats.bytes_committed, 0);
    assert_eq!(allocator.largest_free_span(), stats.bytes_reserved);
}

#[test]
fn test_3() {
    let (mut allocator, _) = allocator(8, PageCapabilities::EXPLICIT);
    let reserved = allocator.statistics().bytes_reserved;

    let a = allocator.allocate(5_000, OWNER).unwrap();
    allocator.release(a);
    let b = allocator.allocate(5_000, OWNER).unwrap();

    assert_eq!(a, b);
    assert_eq!(allocator.statistics().bytes_reserved, reserved);
}

#[test]
fn test_4() {
    let (mut allocator, _) = allocator(4, PageCapabilities::EXPLICIT);
    let quarter = allocator.statistics().bytes_reserved / 4;

    let spans: Vec<Span> = (0..4).map(|_| allocator.allocate(quarter, OWNER).unwrap()).collect();
    assert!(matches!(allocator.allocate(1, OWNER), Err(AllocError::OutOfSpace { rounded: 32 })));

    for &i in &[1, 3, 0, 2] {
        allocator.release(spans[i]);
    }
    // Everything coalesced back into a single span.
    let whole = allocator.allocate(4 * quarter, OWNER).unwrap();
    assert_eq!(whole, Span { offset: 0, size: 4 * quarter });
}

#[test]
fn test_5() {
    let (mut allocator, _) = allocator(2, PageCapabilities::EXPLICIT);
    assert!(matches!(
        allocator.allocate(2 * FAKE_PAGE_SIZE + 1, OWNER),
        Err(AllocError::OutOfSpace { .. })
    ));
    assert!(matches!(
        allocator.allocate(usize::MAX - 3, OWNER),
        Err(AllocError::TooLarge { .. })
    ));
    assert_eq!(allocator.statistics(), Statistics { bytes_reserved: 2 * FAKE_PAGE_SIZE, ..Default::default() });
}

#[test]
fn test_6() {
    let (mut allocator, rec) = allocator(4, PageCapabilities::EXPLICIT);

    let a = allocator.allocate(100, OWNER).unwrap();
    let b = allocator.allocate(FAKE_PAGE_SIZE, OWNER).unwrap();
    assert_eq!(a, Span { offset: 0, size: 128 });
    assert_eq!(b, Span { offset: 128, size: FAKE_PAGE_SIZE });
    assert_eq!(allocator.statistics().bytes_committed, 2 * FAKE_PAGE_SIZE);

    // Page 0 is still used by `b`.
    allocator.release(a);
    assert_eq!(rec.count(PageOp::Decommit), 0);

    allocator.release(b);
    assert_eq!(allocator.statistics().bytes_committed, 0);

    let page = |op, idx: usize| PageEvent { op, offset: FAKE_PAGE_SIZE * (idx + 1), len: FAKE_PAGE_SIZE };
    assert_eq!(
        rec.events(),
        vec![
            page(PageOp::Commit, 0),
            page(PageOp::Commit, 1),
            page(PageOp::Decommit, 0),
            page(PageOp::Decommit, 1),
        ]
    );
}

#[test]
fn test_7() {
    // Pages are backed on first touch, only the release hint reaches the provider.
    let (mut allocator, rec) = allocator(4, PageCapabilities::LAZY);

    let a = allocator.allocate(3 * FAKE_PAGE_SIZE, OWNER).unwrap();
    assert_eq!(allocator.statistics().bytes_committed, 3 * FAKE_PAGE_SIZE);
    assert_eq!(rec.count(PageOp::Commit), 0);

    allocator.release(a);
    assert_eq!(rec.count(PageOp::AdviseFree), 3);
    assert_eq!(allocator.statistics().bytes_committed, 0);
}

#[test]
fn test_8() {
    let (mut allocator, rec) = allocator(4, PageCapabilities::EXPLICIT);
    let before = allocator.statistics();

    rec.refuse_commit.store(true, Ordering::Relaxed);
    assert!(matches!(allocator.allocate(64, OWNER), Err(AllocError::Commit(_))));
    assert_eq!(allocator.statistics(), before);
    assert_eq!(allocator.free_bytes(), before.bytes_reserved);

    rec.refuse_commit.store(false, Ordering::Relaxed);
    assert_eq!(allocator.allocate(64, OWNER).unwrap().offset, 0);
}

#[test]
fn test_9() {
    // A span straddling a committed and an uncommitted page rolls back only what it committed.
    let (mut allocator, rec) = allocator(4, PageCapabilities::EXPLICIT);
    let a = allocator.allocate(FAKE_PAGE_SIZE - 64, OWNER).unwrap();

    rec.refuse_commit.store(true, Ordering::Relaxed);
    assert!(allocator.allocate(128, OWNER).is_err());
    rec.refuse_commit.store(false, Ordering::Relaxed);

    assert_eq!(allocator.statistics().bytes_committed, FAKE_PAGE_SIZE);
    allocator.release(a);
    assert_eq!(allocator.statistics().bytes_committed, 0);
}

#[test]
fn test_10() {
    let (mut allocator, _) = allocator(4, PageCapabilities::EXPLICIT);
    let baseline = OwnerTag::new("baseline");
    let optimizing = OwnerTag::new("optimizing");

    let a = allocator.allocate(100, baseline).unwrap();
    let _b = allocator.allocate(1000, optimizing).unwrap();
    let _c = allocator.allocate(10, baseline).unwrap();

    assert_eq!(allocator.owner_bytes(baseline), 128 + 32);
    assert_eq!(allocator.owner_bytes(optimizing), 1024);
    assert_eq!(allocator.owner_breakdown(), vec![(baseline, 160), (optimizing, 1024)]);

    allocator.release(a);
    assert_eq!(allocator.owner_bytes(baseline), 32);
    assert_eq!(allocator.owner_bytes(OwnerTag::UNKNOWN), 0);
}

#[test]
fn test_11() {
    let (mut allocator, _) = allocator(4, PageCapabilities::EXPLICIT);
    let a = allocator.allocate(64, OWNER).unwrap();
    let base = allocator.pool().base().as_ptr();
    assert_eq!(allocator.address_of(a).as_ptr(), base);
    let b = allocator.allocate(64, OWNER).unwrap();
    assert_eq!(allocator.address_of(b).as_ptr(), unsafe { base.add(64) });
}

#[test]
#[cfg(debug_assertions)]
#[should_panic]
fn test_12() {
    let (mut allocator, _) = allocator(4, PageCapabilities::EXPLICIT);
    let a = allocator.allocate(64, OWNER).unwrap();
    allocator.release(a);
    // Should panic because of the liveness debug assertion in release().
    allocator.release(a);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_13() {
    // A page the OS refuses to take back stays committed and is reused as is.
    let (mut allocator, rec) = allocator(4, PageCapabilities::EXPLICIT);
    let a = allocator.allocate(64, OWNER).unwrap();

    rec.permanent_failure.store(true, Ordering::Relaxed);
    allocator.release(a);
    assert_eq!(allocator.statistics().bytes_committed, FAKE_PAGE_SIZE);

    rec.permanent_failure.store(false, Ordering::Relaxed);
    rec.clear();
    let b = allocator.allocate(64, OWNER).unwrap();
    assert_eq!(rec.count(PageOp::Commit), 0);
    assert_eq!(allocator.statistics().bytes_committed, FAKE_PAGE_SIZE);

    allocator.release(b);
    assert_eq!(allocator.statistics().bytes_committed, 0);
}
