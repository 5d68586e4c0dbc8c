use std::collections::HashMap;

use dualmap_allocator::{flush_instruction_cache, JitAllocator};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_env_log::test;

fn validate(allocator: &JitAllocator, live: usize, live_bytes: usize) {
    let (validity, stats) = allocator.stats();
    log::info!(
        "Live: {} ({} bytes); Validity: {:?}, Stats: {:?}",
        live,
        live_bytes,
        validity,
        stats,
    );
    assert!(validity.is_valid());
    assert_eq!(stats.length, live);
    assert_eq!(stats.size, live_bytes);
}

#[test]
fn test_stress() {
    let allocator = JitAllocator::new();
    allocator.initialize().unwrap();
    let page_size = allocator.page_size();

    // None means not allocated
    let mut slots: [Option<(*mut u8, *const u8, usize)>; 32] = [None; 32];
    let mut live: usize = 0;
    let mut live_bytes: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 3 * page_size);

    for _ in 0..1024 {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        match *chosen {
            None => {
                let requested = range.sample(&mut rng);
                let (rw, rx, size) = allocator.allocate_raw(requested).unwrap();
                log::info!("Allocated {} -> {:?}/{:?} {}", requested, rw, rx, size);
                assert!(size >= requested);
                assert_eq!(size % page_size, 0);

                // Stamp every page so a mixed-up translation shows.
                let stamp = (rx as usize >> 12) as u8;
                for offset in (0..size).step_by(page_size) {
                    unsafe { rw.add(offset).write(stamp) };
                }
                flush_instruction_cache(rx, size);

                *chosen = Some((rw, rx, size));
                live += 1;
                live_bytes += size;
            }
            Some((rw, rx, size)) => {
                let stamp = (rx as usize >> 12) as u8;
                let k = rng.gen_range(0, size);
                let rw_k = allocator.rx_to_rw(unsafe { rx.add(k) }).unwrap();
                assert_eq!(rw_k.as_ptr(), unsafe { rw.add(k) });
                let rx_k = allocator.rw_to_rx(unsafe { rw.add(k) }).unwrap();
                assert_eq!(rx_k.as_ptr() as *const u8, unsafe { rx.add(k) });
                assert_eq!(unsafe { rx.add(k - k % page_size).read_volatile() }, stamp);

                log::info!("Freeing {:?}/{:?} {}", rw, rx, size);
                unsafe { allocator.free(rw, rx, size).unwrap() };
                *chosen = None;
                live -= 1;
                live_bytes -= size;
            }
        }

        // And validate that everything is ok
        validate(&allocator, live, live_bytes);
    }

    for (rw, rx, size) in slots.iter().flatten() {
        unsafe { allocator.free(*rw, *rx, *size).unwrap() };
    }
    validate(&allocator, 0, 0);
}

#[test]
fn test_concurrent_threads() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let allocator = JitAllocator::new();
    allocator.initialize().unwrap();
    let page_size = allocator.page_size();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let allocator = &allocator;
            s.spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(t as u64);
                for round in 0..ROUNDS {
                    let requested = rng.gen_range(1, 2 * page_size);
                    let mut block = allocator.allocate(requested).unwrap();
                    let size = block.size();
                    let tag = (t * ROUNDS + round) as u32;
                    block.write(0, &tag.to_le_bytes()).unwrap();
                    block.write(size - 4, &tag.to_le_bytes()).unwrap();

                    let rw = block.rw_ptr() as usize;
                    let rx = block.rx_ptr() as usize;
                    for &k in &[0, size / 2, size - 1] {
                        let to_rw = allocator.rx_to_rw((rx + k) as *const u8).unwrap();
                        assert_eq!(to_rw.as_ptr() as usize, rw + k);
                        let to_rx = allocator.rw_to_rx((rw + k) as *const u8).unwrap();
                        assert_eq!(to_rx.as_ptr() as usize, rx + k);
                    }
                    assert_eq!(&block.code()[..4], &tag.to_le_bytes());
                    assert_eq!(&block.code()[size - 4..], &tag.to_le_bytes());

                    allocator.release(block).unwrap();
                }
            });
        }
    });

    assert!(allocator.is_empty());
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.length, 0);
}

#[test]
fn test_concurrent_translations_stay_inside_their_allocation() {
    const THREADS: usize = 4;

    let allocator = JitAllocator::new();
    let page_size = allocator.page_size();

    // A fixed population that readers look up while writers churn around it.
    let fixed: Vec<_> = (1..=16)
        .map(|pages| allocator.allocate(pages * page_size).unwrap())
        .collect();
    let ranges: HashMap<usize, (usize, usize)> = fixed
        .iter()
        .map(|b| (b.rx_ptr() as usize, (b.rw_ptr() as usize, b.size())))
        .collect();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let allocator = &allocator;
            let ranges = &ranges;
            s.spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(100 + t as u64);
                for _ in 0..500 {
                    if t % 2 == 0 {
                        let block = allocator.allocate(rng.gen_range(1, 4 * page_size)).unwrap();
                        allocator.release(block).unwrap();
                    } else {
                        for (&rx, &(rw, size)) in ranges.iter() {
                            let k = rng.gen_range(0, size);
                            let got = allocator.rx_to_rw((rx + k) as *const u8).unwrap();
                            assert_eq!(got.as_ptr() as usize, rw + k);
                        }
                    }
                }
            });
        }
    });

    assert_eq!(allocator.len(), fixed.len());
    for block in fixed {
        allocator.release(block).unwrap();
    }
    assert!(allocator.is_empty());
}
