use dualmap_allocator::{Error, JitAllocator};

use test_env_log::test;

#[test]
fn test_allocate_translate_free() {
    let allocator = JitAllocator::new();
    allocator.initialize().unwrap();
    let page_size = allocator.page_size();

    for &n in &[1, 100, page_size - 1, page_size, page_size + 1, 5 * page_size] {
        let (rw, rx, size) = allocator.allocate_raw(n).unwrap();
        assert!(!rw.is_null());
        assert!(!rx.is_null());
        assert_ne!(rw as usize, rx as usize);
        assert_eq!(size % page_size, 0);
        assert!(size >= n);

        assert_eq!(allocator.rw_to_rx(rw).unwrap().as_ptr() as *const u8, rx);
        assert_eq!(allocator.rx_to_rw(rx).unwrap().as_ptr(), rw);

        for &k in &[1, size / 3, size - 1] {
            unsafe {
                assert_eq!(
                    allocator.rw_to_rx(rw.add(k)).unwrap().as_ptr() as *const u8,
                    rx.add(k)
                );
                assert_eq!(allocator.rx_to_rw(rx.add(k)).unwrap().as_ptr(), rw.add(k));

                rw.add(k).write((k % 251) as u8);
                assert_eq!(rx.add(k).read_volatile(), (k % 251) as u8);
            }
        }

        unsafe { allocator.free(rw, rx, n).unwrap() };
        assert_eq!(allocator.rx_to_rw(rx), None);
    }
    assert!(allocator.is_empty());
}

#[test]
fn test_double_free_is_harmless() {
    let allocator = JitAllocator::new();
    let (a_rw, a_rx, a_size) = allocator.allocate_raw(10).unwrap();
    let mut b = allocator.allocate(10).unwrap();
    b.write(0, &[0xAB]).unwrap();

    unsafe {
        allocator.free(a_rw, a_rx, a_size).unwrap();
        match allocator.free(a_rw, a_rx, a_size) {
            Err(Error::UnknownAllocation(addr)) => assert_eq!(addr, a_rw as usize),
            other => panic!("expected UnknownAllocation, got {:?}", other),
        }
    }

    // The surviving allocation is still intact.
    assert_eq!(allocator.len(), 1);
    let (validity, _stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(
        allocator.rx_to_rw(b.rx_ptr()).unwrap().as_ptr(),
        b.rw_ptr()
    );
    assert_eq!(b.code()[0], 0xAB);
    allocator.release(b).unwrap();
}

#[test]
fn test_free_with_wrong_rx_releases_the_right_block() {
    let allocator = JitAllocator::new();
    let (a_rw, a_rx, a_size) = allocator.allocate_raw(1).unwrap();
    let (b_rw, b_rx, b_size) = allocator.allocate_raw(1).unwrap();

    // Hand over b's RX pointer with a's RW pointer.
    unsafe { allocator.free(a_rw, b_rx, a_size).unwrap() };

    assert_eq!(allocator.rx_to_rw(a_rx), None);
    assert_eq!(allocator.rw_to_rx(a_rw), None);
    // b was not touched
    assert_eq!(allocator.rx_to_rw(b_rx).unwrap().as_ptr(), b_rw);
    unsafe {
        b_rw.write(7);
        assert_eq!(b_rx.read_volatile(), 7);
        allocator.free(b_rw, b_rx, b_size).unwrap();
    }
    assert!(allocator.is_empty());
}

#[test]
fn test_shutdown_then_reuse() {
    let mut allocator = JitAllocator::new();
    allocator.initialize().unwrap();

    let live: Vec<_> = (1..=3)
        .map(|i| allocator.allocate_raw(i * 4096).unwrap())
        .collect();
    assert_eq!(allocator.len(), 3);

    assert_eq!(allocator.shutdown(), 3);
    assert!(allocator.is_empty());
    for &(rw, rx, _) in &live {
        assert_eq!(allocator.rw_to_rx(rw), None);
        assert_eq!(allocator.rx_to_rw(rx), None);
    }

    let (rw, rx, size) = allocator.allocate_raw(100).unwrap();
    unsafe {
        rw.write(1);
        assert_eq!(rx.read_volatile(), 1);
        allocator.free(rw, rx, size).unwrap();
    }
    allocator.shutdown();
}

#[test]
fn test_independent_allocators_do_not_collide() {
    let first = JitAllocator::new();
    let second = JitAllocator::new();

    let a = first.allocate(1).unwrap();
    let b = second.allocate(1).unwrap();

    assert!(first.rx_to_rw(b.rx_ptr()).is_none());
    assert!(second.rx_to_rw(a.rx_ptr()).is_none());
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);

    first.release(a).unwrap();
    second.release(b).unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_execute_generated_code() {
    let allocator = JitAllocator::new();
    let mut block = allocator.allocate(64).unwrap();

    // mov eax, 42; ret
    block.write(0, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]).unwrap();
    let f: extern "C" fn() -> u32 = unsafe { core::mem::transmute(block.rx_ptr()) };
    assert_eq!(f(), 42);

    // Patch the immediate through the RW alias of an interior RX address.
    let imm = allocator.rx_to_rw(unsafe { block.rx_ptr().add(1) }).unwrap();
    unsafe { imm.as_ptr().write(7) };
    block.flush(0, 6).unwrap();
    assert_eq!(f(), 7);

    allocator.release(block).unwrap();
}

#[cfg(target_arch = "aarch64")]
#[test]
fn test_execute_generated_code() {
    fn mov_w0_ret(value: u16) -> [u8; 8] {
        // mov w0, #value; ret
        let mov = 0x5280_0000u32 | ((value as u32) << 5);
        let mut code = [0u8; 8];
        code[..4].copy_from_slice(&mov.to_le_bytes());
        code[4..].copy_from_slice(&0xD65F_03C0u32.to_le_bytes());
        code
    }

    let allocator = JitAllocator::new();
    let mut block = allocator.allocate(64).unwrap();

    block.write(0, &mov_w0_ret(42)).unwrap();
    let f: extern "C" fn() -> u32 = unsafe { core::mem::transmute(block.rx_ptr()) };
    assert_eq!(f(), 42);

    // Patch the mov through the RW alias of its RX address. Without the
    // instruction cache maintenance in `flush` the old 42 would still run.
    let mov = allocator.rx_to_rw(block.rx_ptr()).unwrap();
    let patched = mov_w0_ret(7);
    unsafe { core::ptr::copy_nonoverlapping(patched.as_ptr(), mov.as_ptr(), 4) };
    block.flush(0, 4).unwrap();
    assert_eq!(f(), 7);

    // And again, through the handle.
    block.write(0, &mov_w0_ret(1234)).unwrap();
    assert_eq!(f(), 1234);

    allocator.release(block).unwrap();
}
