//! Instruction cache maintenance.

#[cfg(not(target_arch = "aarch64"))]
use core::ffi::c_void;

use log::debug;
#[cfg(not(target_arch = "aarch64"))]
use log::warn;

/// Make freshly written code in `[start, start + size)` visible to
/// instruction fetch.
///
/// Call this after writing code through an RW view and before jumping to the
/// matching RX addresses. Pass the RX address: data cache lines are cleaned by
/// physical line, but instruction caches may be indexed by virtual address.
///
/// On x86 and x86_64 the instruction cache snoops data writes and this does
/// nothing. On aarch64 the range is cleaned to the point of unification and
/// invalidated in the instruction cache explicitly; dual-mapped code never
/// goes through an `mprotect` that would do it as a side effect. Afterwards
/// every core's pipeline is flushed so threads already running don't keep
/// stale prefetched instructions.
///
/// Failures are logged rather than returned; there is nothing useful a caller
/// could do about them.
pub fn flush_instruction_cache(start: *const u8, size: usize) {
    if start.is_null() || size == 0 {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    aarch64::clean_and_invalidate(start as usize, size);

    #[cfg(not(target_arch = "aarch64"))]
    {
        #[allow(unused_unsafe)]
        let result =
            unsafe { wasmtime_jit_icache_coherence::clear_cache(start as *const c_void, size) };
        if let Err(e) = result {
            warn!("Instruction cache flush of {:?}+{} failed: {}", start, size, e);
        }
    }

    if let Err(e) = wasmtime_jit_icache_coherence::pipeline_flush_mt() {
        // Old kernels lack membarrier; the local core is still coherent.
        debug!("Cross-core pipeline flush failed: {}", e);
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    use core::arch::asm;

    /// Data and instruction cache line sizes in bytes, from `CTR_EL0`.
    pub fn line_sizes() -> (usize, usize) {
        let ctr: u64;
        // Linux and Android let EL0 read CTR_EL0 (trapping and emulating it
        // where the hardware doesn't).
        unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags)) };
        // DminLine is bits [19:16], IminLine bits [3:0], both log2 of words.
        let dline = 4usize << ((ctr >> 16) & 0xF);
        let iline = 4usize << (ctr & 0xF);
        (dline, iline)
    }

    pub fn clean_and_invalidate(start: usize, size: usize) {
        let (dline, iline) = line_sizes();
        let end = start.saturating_add(size);

        let mut addr = start & !(dline - 1);
        while addr < end {
            unsafe { asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags)) };
            addr += dline;
        }
        unsafe { asm!("dsb ish", options(nostack, preserves_flags)) };

        let mut addr = start & !(iline - 1);
        while addr < end {
            unsafe { asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags)) };
            addr += iline;
        }
        unsafe {
            asm!("dsb ish", options(nostack, preserves_flags));
            asm!("isb", options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_flush_is_harmless() {
        let code = [0xC3u8; 64];
        flush_instruction_cache(code.as_ptr(), code.len());
        flush_instruction_cache(core::ptr::null(), 16);
        flush_instruction_cache(code.as_ptr(), 0);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_cache_line_sizes() {
        let (dline, iline) = aarch64::line_sizes();
        log::info!("dcache line {}, icache line {}", dline, iline);
        for line in [dline, iline] {
            assert!(line.is_power_of_two());
            assert!((4..=2048).contains(&line));
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_flush_unaligned_range() {
        // Spans several lines and starts mid-line.
        let code = [0u8; 1000];
        flush_instruction_cache(unsafe { code.as_ptr().add(3) }, 990);
    }
}
