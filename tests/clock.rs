//! Hybrid logical clock tests.

use meridian::clock::{HybridLogicalClock, ThreadLocalClock, Timestamp};
use std::collections::BTreeSet;
use std::sync::Arc;

#[test]
fn concurrent_batched_timestamps_are_distinct_and_ordered() {
    const THREADS: usize = 10;
    const PER_THREAD: usize = 10_000;

    let global = Arc::new(HybridLogicalClock::new(1));
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let global = Arc::clone(&global);
        handles.push(std::thread::spawn(move || {
            let local = ThreadLocalClock::new(global);
            let mut produced = Vec::with_capacity(PER_THREAD);
            let mut prev = Timestamp::zero();
            for _ in 0..PER_THREAD {
                let ts = local.now();
                assert!(ts > prev, "per-thread order violated: {} -> {}", prev, ts);
                prev = ts;
                produced.push(ts);
            }
            produced
        }));
    }

    let mut all = BTreeSet::new();
    for handle in handles {
        for ts in handle.join().unwrap() {
            assert!(all.insert(ts), "duplicate timestamp {}", ts);
        }
    }
    assert_eq!(all.len(), THREADS * PER_THREAD);
}

#[test]
fn received_timestamps_are_dominated() {
    let clock = HybridLogicalClock::new(1);
    let mut prev = clock.now();

    // Interleave local events with receive events carrying future and past
    // timestamps; locals must stay monotone and dominate every receive.
    for round in 0..1_000i64 {
        let incoming = Timestamp::new(prev.wall + (round % 7) * 10, round as u32 % 5, 2);
        clock.update(incoming);
        let next = clock.now();
        assert!(next > incoming, "receive not dominated: {} !> {}", next, incoming);
        assert!(next > prev, "local order violated: {} !> {}", next, prev);
        prev = next;
    }
}

#[test]
fn mixed_global_and_batched_producers_stay_monotone() {
    let global = Arc::new(HybridLogicalClock::new(4));
    let local = ThreadLocalClock::new(Arc::clone(&global));

    let mut prev = Timestamp::zero();
    for i in 0..5_000 {
        let ts = if i % 3 == 0 { global.now() } else { local.now() };
        // The shared clock and a batch drawn from it may interleave in
        // wall/logical space, but the union must still be distinct.
        assert_ne!(ts, prev);
        prev = ts;
    }
}
