#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::adapter::PoolAllocator;
    use crate::memory::config::{MAX_POOLED_SIZE, NODES_PER_BLOCK, PoolSetConfig};
    use crate::memory::manager::MemoryStats;
    use crate::memory::raw::{SystemAllocator, TrackingAllocator};
    use crate::memory::router::{GlobalMemoryRouter, MemoryResource, MemoryRouter};
    use crate::memory::shared::SharedHandle;
    use crate::memory::stats;
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    trait Component: Send + Sync {
        fn weight(&self) -> u64;
    }

    struct Mesh {
        vertices: [u64; 6],
    }

    impl Component for Mesh {
        fn weight(&self) -> u64 {
            self.vertices.iter().sum()
        }
    }

    struct Light(u64);

    impl Component for Light {
        fn weight(&self) -> u64 {
            self.0
        }
    }

    fn leaked(router: MemoryRouter<TrackingAllocator>) -> &'static dyn MemoryResource {
        Box::leak(Box::new(router))
    }

    #[test]
    fn test_integration_mixed_components() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X1: Handles of different concrete types behind one trait, plus raw
        // router traffic, all from the same tracked resource.
        let tracker = TrackingAllocator::new();
        let resource = leaked(MemoryRouter::new(tracker.clone()));

        let mut components: Vec<SharedHandle<dyn Component>> = Vec::new();
        for i in 0..200u64 {
            let handle = if i % 2 == 0 {
                SharedHandle::new_in(resource, Light(i))
                    .unwrap()
                    .map(|l| l as &dyn Component)
            } else {
                SharedHandle::new_in(resource, Mesh { vertices: [i; 6] })
                    .unwrap()
                    .map(|m| m as &dyn Component)
            };
            components.push(handle);
        }
        let raw = resource.allocate(4 * MAX_POOLED_SIZE).unwrap();

        let total: u64 = components.iter().map(|c| c.weight()).sum();
        let expected: u64 = (0..200u64)
            .map(|i| if i % 2 == 0 { i } else { 6 * i })
            .sum();
        assert_eq!(total, expected);

        let lights = components
            .iter()
            .filter(|c| c.cast::<Light>().is_some())
            .count();
        assert_eq!(lights, 100);

        drop(components);
        // Safety: Test code.
        unsafe { resource.deallocate(raw, 4 * MAX_POOLED_SIZE) };
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_integration_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X2: Threads share handles, allocate through the adapter and hit
        // the global router directly.
        let num_threads = 8;
        let barrier = Arc::new(Barrier::new(num_threads));
        let shared = SharedHandle::create_with(64 * 8, |i| i as u64).unwrap();

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let b = barrier.clone();
                let shared = shared.clone();
                thread::spawn(move || {
                    let alloc = PoolAllocator::<u64>::new();
                    b.wait();

                    for i in 0..200usize {
                        let n = 1 + (t + i) % 200;
                        let buf = alloc.allocate(n).unwrap();
                        // Safety: Test code; `n` u64 slots are ours.
                        unsafe {
                            for j in 0..n {
                                buf.as_ptr().add(j).write(shared[j % shared.len()]);
                            }
                            assert_eq!(*buf.as_ptr().add(n - 1), ((n - 1) % 64) as u64);
                            alloc.deallocate(buf, n);
                        }

                        let local = shared.clone();
                        assert_eq!(local.get(63), Ok(&63));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.strong_count(), 1);
    }

    #[test]
    fn test_integration_producer_consumer_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X3: Objects built on one thread, released on another.
        let tracker = TrackingAllocator::new();
        let resource = leaked(MemoryRouter::new(tracker.clone()));
        let drops = Arc::new(AtomicUsize::new(0));

        struct Payload {
            drops: Arc<AtomicUsize>,
            bytes: [u8; 40],
        }

        impl Drop for Payload {
            fn drop(&mut self) {
                assert!(self.bytes.iter().all(|&b| b == 0x5A));
                self.drops.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (tx, rx) = std::sync::mpsc::channel::<SharedHandle<Payload>>();
        let producer = {
            let drops = drops.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let handle = SharedHandle::new_in(
                        resource,
                        Payload {
                            drops: drops.clone(),
                            bytes: [0x5A; 40],
                        },
                    )
                    .unwrap();
                    tx.send(handle).unwrap();
                }
            })
        };
        let consumer = thread::spawn(move || rx.into_iter().count());

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), 500);
        assert_eq!(drops.load(Ordering::SeqCst), 500);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_integration_oom_handling() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X4: Every layer surfaces OutOfMemory and leaves nothing behind.
        let tracker = TrackingAllocator::with_limit(16 * 1024);
        let resource = leaked(
            MemoryRouter::with_config(
                PoolSetConfig {
                    pool_count: 2,
                    size_step: 8,
                },
                tracker.clone(),
            )
            .unwrap(),
        );

        assert!(resource.allocate(8).is_err());
        assert!(SharedHandle::new_in(resource, 1u64).is_err());
        assert!(PoolAllocator::<u8>::with_resource(resource).allocate(64 * 1024).is_err());

        // Oversized requests under the limit still succeed.
        let ok = resource.allocate(1024).unwrap();
        // Safety: Test code.
        unsafe { resource.deallocate(ok, 1024) };
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_integration_leak_detection() {
        // Exclusive: asserts on process-wide gauges.
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let baseline = MemoryStats::snapshot();

        {
            let router = MemoryRouter::new(SystemAllocator);
            let mut small = Vec::new();
            for size in (1..=MAX_POOLED_SIZE).step_by(7) {
                small.push((router.allocate(size).unwrap(), size));
            }
            let large = router.allocate(3 * MAX_POOLED_SIZE).unwrap();
            let during = MemoryStats::snapshot();
            assert!(during.pool_committed > baseline.pool_committed);
            assert_eq!(
                during.large_alloc_live,
                baseline.large_alloc_live + 3 * MAX_POOLED_SIZE
            );

            for (ptr, size) in small {
                // Safety: Test code.
                unsafe { router.deallocate(ptr, size) };
            }
            // Safety: Test code.
            unsafe { router.deallocate(large, 3 * MAX_POOLED_SIZE) };
        }

        let after = MemoryStats::snapshot();
        assert_eq!(after.total_committed, baseline.total_committed);
        assert_eq!(after.pool_committed, baseline.pool_committed);
        assert_eq!(after.large_alloc_live, baseline.large_alloc_live);
        assert!(after.pool_recycled > baseline.pool_recycled);
    }

    #[test]
    fn test_integration_teardown_releases_blocks() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // X5: Dropping a router with live slots gives the blocks back without
        // counting them as recycled.
        let baseline_recycled = stats::POOL_RECYCLED.get();
        let baseline_committed = stats::POOL_COMMITTED.get();
        let tracker = TrackingAllocator::new();
        {
            let router = MemoryRouter::new(tracker.clone());
            for size in [8, 16, 512] {
                let _ = router.allocate(size).unwrap();
            }
            assert_eq!(tracker.live_count(), 3);
        }
        assert_eq!(tracker.live_count(), 0);
        assert_eq!(stats::POOL_RECYCLED.get(), baseline_recycled);
        assert_eq!(stats::POOL_COMMITTED.get(), baseline_committed);
    }

    #[test]
    fn test_integration_global_recycling() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // X6: A full block's worth of global traffic in one class comes back
        // as recycled bytes once every slot is freed.
        let size = 1000;
        let block_size = GlobalMemoryRouter::get()
            .pools()
            .pool_for(size)
            .unwrap()
            .block_size();
        let before = crate::recycled_bytes(size);

        let ptrs: Vec<_> = (0..NODES_PER_BLOCK)
            .map(|_| crate::allocate(size).unwrap())
            .collect();
        for ptr in ptrs {
            // Safety: Test code.
            unsafe { crate::deallocate(ptr, size) };
        }
        assert!(crate::recycled_bytes(size) >= before + block_size);
    }
}
