//! Randomized and concurrent stress scenarios
//!
//! These tests drive the cache through long mixed alloc/free schedules and
//! sweep the structural invariants at checkpoints: returned pointers stay
//! aligned and disjoint, partial slabs stay ahead of full ones, and the
//! in-use total matches the alloc/free ledger.

#[cfg(test)]
mod stress {
    use crate::cache::{Cache, CacheStats};
    use std::ptr::NonNull;
    use std::sync::Arc;

    /// Deterministic xorshift64 generator; the tests need repeatable
    /// schedules, not statistical quality.
    struct XorShift(u64);

    impl XorShift {
        fn new(seed: u64) -> Self {
            Self(seed.max(1))
        }

        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    fn assert_slab_ordering(stats: &CacheStats, maxbuf: usize) {
        let mut seen_full = false;
        for &count in &stats.per_slab_in_use {
            if count == maxbuf {
                seen_full = true;
            } else {
                assert!(
                    !seen_full,
                    "partial slab behind a full one: {:?}",
                    stats.per_slab_in_use
                );
            }
        }
    }

    fn assert_disjoint(live: &[NonNull<u8>], effective_size: usize) {
        let mut spans: Vec<usize> = live.iter().map(|p| p.as_ptr() as usize).collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(
                pair[0] + effective_size <= pair[1],
                "live objects overlap at {:#x}/{:#x}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_random_interleaving_invariants() {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let cache = Cache::new("stress-small", 48);
        let align = crate::cache::DEFAULT_ALIGN;
        let mut rng = XorShift::new(0x9e37_79b9_7f4a_7c15);
        let mut live: Vec<NonNull<u8>> = Vec::new();
        let mut allocs = 0usize;
        let mut frees = 0usize;

        for op in 0..100_000usize {
            if live.is_empty() || rng.next() % 2 == 0 {
                let p = cache.alloc().unwrap();
                assert_eq!(p.as_ptr() as usize % align, 0);
                live.push(p);
                allocs += 1;
            } else {
                let idx = (rng.next() as usize) % live.len();
                let p = live.swap_remove(idx);
                unsafe { cache.free(p.as_ptr()) };
                frees += 1;
            }

            if op % 1000 == 0 {
                let stats = cache.stats();
                assert_eq!(stats.in_use, allocs - frees);
                assert_eq!(stats.in_use, live.len());
                assert_slab_ordering(&stats, cache.slab_maxbuf());
                assert_disjoint(&live, cache.effective_size());
            }
        }

        for p in live.drain(..) {
            unsafe { cache.free(p.as_ptr()) };
        }
        let stats = cache.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.slab_count, 0);
    }

    #[test]
    fn test_random_interleaving_large_regime() {
        let cache = Cache::new("stress-large", crate::page::page_size() / 8 + 200);
        let mut rng = XorShift::new(0x2545_f491_4f6c_dd1d);
        let mut live: Vec<NonNull<u8>> = Vec::new();

        for op in 0..20_000usize {
            if live.len() < 4 || rng.next() % 5 < 3 {
                live.push(cache.alloc().unwrap());
            } else {
                let idx = (rng.next() as usize) % live.len();
                let p = live.swap_remove(idx);
                unsafe { cache.free(p.as_ptr()) };
            }

            if op % 1000 == 0 {
                let stats = cache.stats();
                assert_eq!(stats.in_use, live.len());
                // Every backing slot of every slab is registered in the map.
                assert_eq!(stats.lookup_entries, stats.slab_count * cache.slab_maxbuf());
                assert_slab_ordering(&stats, cache.slab_maxbuf());
            }
        }

        for p in live.drain(..) {
            unsafe { cache.free(p.as_ptr()) };
        }
        let stats = cache.stats();
        assert_eq!(stats.slab_count, 0);
        assert_eq!(stats.lookup_entries, 0);
    }

    #[test]
    fn test_callback_log_mirrors_live_set() {
        use crate::cache::ObjectCallback;
        use std::collections::{HashMap, HashSet};
        use std::sync::Mutex;

        // Log every construct/destruct address; at any checkpoint the live
        // pointer set must equal constructed-minus-destructed.
        let log: Arc<Mutex<(Vec<usize>, Vec<usize>)>> = Arc::new(Mutex::new((Vec::new(), Vec::new())));
        let (ctor_log, dtor_log) = (Arc::clone(&log), Arc::clone(&log));
        let ctor: ObjectCallback = Box::new(move |p, _| {
            ctor_log.lock().unwrap().0.push(p as usize);
        });
        let dtor: ObjectCallback = Box::new(move |p, _| {
            dtor_log.lock().unwrap().1.push(p as usize);
        });
        let cache = Cache::with_options("stress-log", 56, None, Some(ctor), Some(dtor), false);

        let mut rng = XorShift::new(42);
        let mut live: Vec<NonNull<u8>> = Vec::new();
        for op in 0..10_000usize {
            if live.is_empty() || rng.next() % 3 != 0 {
                live.push(cache.alloc().unwrap());
            } else {
                let idx = (rng.next() as usize) % live.len();
                let p = live.swap_remove(idx);
                unsafe { cache.free(p.as_ptr()) };
            }

            if op % 1000 == 0 {
                // Addresses recycle, so balance per-address event counts
                // rather than set membership.
                let guard = log.lock().unwrap();
                let mut balance: HashMap<usize, isize> = HashMap::new();
                for &p in &guard.0 {
                    *balance.entry(p).or_insert(0) += 1;
                }
                for &p in &guard.1 {
                    *balance.entry(p).or_insert(0) -= 1;
                }
                let outstanding: HashSet<usize> = balance
                    .iter()
                    .filter(|(_, &n)| n > 0)
                    .map(|(&p, _)| p)
                    .collect();
                let live_set: HashSet<usize> =
                    live.iter().map(|p| p.as_ptr() as usize).collect();
                assert_eq!(outstanding, live_set);
            }
        }

        for p in live.drain(..) {
            unsafe { cache.free(p.as_ptr()) };
        }
        let guard = log.lock().unwrap();
        assert_eq!(guard.0.len(), guard.1.len());
    }

    #[test]
    fn test_two_workers_on_thread_safe_cache() {
        let cache = Arc::new(Cache::with_options(
            "stress-mt",
            64,
            None,
            None,
            None,
            true,
        ));

        let mut workers = Vec::new();
        for worker in 0..2u64 {
            let cache = Arc::clone(&cache);
            workers.push(std::thread::spawn(move || {
                let mut rng = XorShift::new(0xdead_beef ^ (worker + 1));
                let mut live: Vec<usize> = Vec::new();
                for _ in 0..100_000usize {
                    let p = cache.alloc().unwrap();
                    live.push(p.as_ptr() as usize);
                    // Keep a small working set so slabs cycle through
                    // partial, full, and released states.
                    if live.len() > 16 {
                        let idx = (rng.next() as usize) % live.len();
                        let p = live.swap_remove(idx);
                        unsafe { cache.free(p as *mut u8) };
                    }
                }
                for p in live {
                    unsafe { cache.free(p as *mut u8) };
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.slab_count, 0);
    }
}
