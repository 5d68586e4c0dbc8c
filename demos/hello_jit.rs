//! A very small example: emit a function through the RW view, run it through
//! the RX view, then patch it by translating its execution address back.

use dualmap_allocator::JitAllocator;

#[cfg(target_arch = "x86_64")]
fn emit_return(value: u32) -> Vec<u8> {
    // mov eax, imm32; ret
    let mut code = vec![0xB8];
    code.extend_from_slice(&value.to_le_bytes());
    code.push(0xC3);
    code
}

#[cfg(target_arch = "aarch64")]
fn emit_return(value: u32) -> Vec<u8> {
    // mov w0, #imm16; ret
    let mov = 0x5280_0000u32 | ((value & 0xFFFF) << 5);
    let mut code = mov.to_le_bytes().to_vec();
    code.extend_from_slice(&0xD65F_03C0u32.to_le_bytes());
    code
}

fn main() {
    env_logger::init();

    let allocator = JitAllocator::new();
    allocator.initialize().expect("JIT memory unavailable");
    println!("Page size: {}", allocator.page_size());

    let mut block = allocator.allocate(100).expect("JIT allocation failed");
    println!(
        "Allocated {} bytes: rw={:p}, rx={:p}",
        block.size(),
        block.rw_ptr(),
        block.rx_ptr()
    );

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        block.write(0, &emit_return(42)).unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(block.rx_ptr()) };
        println!("Generated code returned {}", f());

        // Re-emit over the same entry point, found from its RX address.
        let rw = allocator.rx_to_rw(block.rx_ptr()).unwrap();
        let patch = emit_return(7);
        unsafe { std::ptr::copy_nonoverlapping(patch.as_ptr(), rw.as_ptr(), patch.len()) };
        block.flush(0, patch.len()).unwrap();
        println!("Patched code returned {}", f());
    }

    allocator.release(block).unwrap();
}
