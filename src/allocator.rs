//! The allocator itself, and the handle it gives out.
//!
//! ## [`JitAllocator`](struct.JitAllocator.html)
//!
//! Hands out page-aligned blocks of memory that are mapped twice: a read-write
//! view for emitting code and a read-execute view for running it. Neither view
//! is ever writable and executable at once, so this works under a W^X policy.
//! Each allocator owns its own [`Registry`](../registry/struct.Registry.html);
//! independent allocators never see each other's blocks.
//!
//! ## [`JitBlock`](struct.JitBlock.html)
//!
//! The handle for one allocation. It borrows the allocator, so the allocator
//! cannot be shut down or dropped while a handle is live, and it carries a
//! token that [`JitAllocator::release`](struct.JitAllocator.html#method.release)
//! checks against the registry.
//!
//! The raw surface (`allocate_raw`, `free`, `rx_to_rw`, `rw_to_rx`) deals only
//! in addresses, for callers that keep code pointers in their own structures.

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use log::{debug, info, warn};
use static_assertions::assert_impl_all;

use crate::config::{Config, MismatchPolicy};
use crate::error::{Error, Result};
use crate::icache::flush_instruction_cache;
use crate::page::{self, round_to_pages};
use crate::registry::{Allocation, AllocationId, Registry, Stats, Validity};
use crate::unix::{create_backing, map_dual};

// Lifecycle states
const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A W^X executable memory allocator built on dual mappings.
pub struct JitAllocator {
    // Values:
    // - 0: Untouched, or shut down
    // - 1: Initialization in progress
    // - 2: Initialized
    state: AtomicU8,
    page_size: AtomicUsize,
    next_id: AtomicU64,
    registry: Registry,
    config: Config,
}

assert_impl_all!(JitAllocator: Send, Sync);

impl Default for JitAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl JitAllocator {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        JitAllocator {
            state: AtomicU8::new(UNINITIALIZED),
            page_size: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            registry: Registry::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prepare the allocator for use. Calling it again is a no-op.
    ///
    /// `allocate` calls this itself if needed, but callers should call it
    /// explicitly at startup.
    pub fn initialize(&self) -> Result<()> {
        // The plan:
        // - If nobody has started (0), claim it (1), do the work, publish (2)
        // - If someone else is mid-way (1), spin until they publish
        // - If it is done (2), there's nothing to do
        match self
            .state
            .compare_exchange(UNINITIALIZED, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let page_size = page::page_size();
                self.page_size.store(page_size, Ordering::Release);
                self.state.store(READY, Ordering::Release);
                info!("JIT allocator initialized, page size: {}", page_size);
            }
            Err(READY) => {}
            Err(_) => {
                while self.state.load(Ordering::Acquire) == INITIALIZING {
                    // Hint to the processor that we're in a spin loop
                    core::hint::spin_loop();
                }
            }
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            debug!("JIT allocator used before initialize(); initializing now");
            self.initialize()?;
        }
        Ok(())
    }

    /// The page size allocations are rounded to.
    pub fn page_size(&self) -> usize {
        match self.page_size.load(Ordering::Acquire) {
            0 => page::page_size(),
            size => size,
        }
    }

    /// Allocate a dual-mapped block of at least `size` bytes.
    ///
    /// The size is rounded up to whole pages. A zero size is an
    /// `InvalidArgument`. Running out of memory is an ordinary error; callers
    /// should fall back to something that doesn't need JIT memory.
    pub fn allocate(&self, size: usize) -> Result<JitBlock<'_>> {
        let alloc = self.create(size)?;
        let block = JitBlock {
            id: alloc.id(),
            rw: NonNull::new(alloc.rw_ptr()).ok_or(Error::InvalidArgument("null RW view"))?,
            rx: NonNull::new(alloc.rx_ptr() as *mut u8)
                .ok_or(Error::InvalidArgument("null RX view"))?,
            size: alloc.size(),
            _allocator: PhantomData,
        };
        self.registry.register(alloc);
        Ok(block)
    }

    /// Allocate a block and return its raw parts: `(rw, rx, size)`.
    ///
    /// The block stays allocated until it is given to [`free`](#method.free)
    /// or the allocator shuts down.
    pub fn allocate_raw(&self, size: usize) -> Result<(*mut u8, *const u8, usize)> {
        self.allocate(size).map(JitBlock::into_raw)
    }

    // Everything up to, but not including, registration. No lock is held here,
    // so concurrent allocations make their system calls in parallel.
    fn create(&self, size: usize) -> Result<Allocation> {
        self.ensure_initialized()?;

        let rounded = round_to_pages(size, self.page_size())?;
        let backing = create_backing(rounded, self.config.backing_name())?;
        let mapping = map_dual(&backing, rounded)?;

        let id = AllocationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let alloc = Allocation::new(id, backing, mapping);
        debug!(
            "JIT alloc {}: size={} (requested {}), rw={:p}, rx={:p}",
            id,
            rounded,
            size,
            alloc.rw_ptr(),
            alloc.rx_ptr()
        );
        Ok(alloc)
    }

    /// Free a block through its handle.
    ///
    /// A handle from a different allocator names an address this one doesn't
    /// know, so it is an `UnknownAllocation`. If the address is live here but
    /// under a different token (the handle's block was freed through the raw
    /// API and the address reused), it is an `InvalidArgument`. Either way
    /// nothing is freed.
    pub fn release(&self, block: JitBlock<'_>) -> Result<()> {
        let rw = block.rw.as_ptr() as usize;
        let id = block.id;
        let alloc = self.registry.unregister_with(rw, |alloc| {
            if alloc.id() != id {
                warn!(
                    "JIT release: handle {} does not match allocation {} at {:#x}",
                    id,
                    alloc.id(),
                    rw
                );
                return Err(Error::InvalidArgument("handle does not match the live allocation"));
            }
            Ok(())
        })?;
        debug!("JIT release {}: rw={:#x}, rx={:#x}", id, rw, alloc.rx_base());
        // Unmapping happens here, after the registry lock is released.
        drop(alloc);
        Ok(())
    }

    /// Free the block whose RW view starts at `rw`.
    ///
    /// The registry's record is authoritative. If `rx` is not the RX base on
    /// record, the configured [`MismatchPolicy`] decides between warning and
    /// freeing the recorded views, or refusing. `size` is only checked against
    /// the record.
    ///
    /// Freeing an address with no live allocation, including a second free of
    /// the same block, is logged and returns `UnknownAllocation` without doing
    /// anything else.
    ///
    /// # Safety
    ///
    /// Both views are unmapped. Nothing may use either view afterwards: no
    /// execution through the RX view, no reads or writes through either, and no
    /// live [`JitBlock`] for the same allocation.
    pub unsafe fn free(&self, rw: *mut u8, rx: *const u8, size: usize) -> Result<()> {
        if rw.is_null() {
            return Err(Error::InvalidArgument("null RW pointer"));
        }

        let rw = rw as usize;
        let rx = rx as usize;
        let policy = self.config.mismatch_policy();
        let page_size = self.page_size();

        let result = self.registry.unregister_with(rw, |alloc| {
            if alloc.rx_base() != rx {
                warn!(
                    "JIT free: rx mismatch for rw={:#x}, expected {:#x}, got {:#x}",
                    rw,
                    alloc.rx_base(),
                    rx
                );
                if policy == MismatchPolicy::Reject {
                    return Err(Error::InvalidArgument("RX pointer does not match the allocation"));
                }
            }
            if size != 0 && page::round_up(size, page_size) != Some(alloc.size()) {
                warn!(
                    "JIT free: size {} for rw={:#x} does not match allocated size {}",
                    size,
                    rw,
                    alloc.size()
                );
            }
            Ok(())
        });

        let alloc = match result {
            Ok(alloc) => alloc,
            Err(e) => {
                warn!("JIT free: {}", e);
                return Err(e);
            }
        };

        debug!(
            "JIT free {}: rw={:#x}, rx={:#x}",
            alloc.id(),
            alloc.rw_base(),
            alloc.rx_base()
        );
        drop(alloc);
        Ok(())
    }

    /// The RW address of the byte at `rx`, which may be a block's RX base or
    /// any address inside its RX view.
    pub fn rx_to_rw(&self, rx: *const u8) -> Option<NonNull<u8>> {
        if rx.is_null() {
            return None;
        }
        let rw = self.registry.translate_rx_to_rw(rx as usize)?;
        NonNull::new(rw as *mut u8)
    }

    /// The RX address of the byte at `rw`, which may be a block's RW base or
    /// any address inside its RW view.
    pub fn rw_to_rx(&self, rw: *const u8) -> Option<NonNull<u8>> {
        if rw.is_null() {
            return None;
        }
        let rx = self.registry.translate_rw_to_rx(rw as usize)?;
        NonNull::new(rx as *mut u8)
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Get statistics on live allocations, and verify the registry.
    pub fn stats(&self) -> (Validity, Stats) {
        self.registry.stats(self.page_size())
    }

    /// Release every allocation still live and return to the uninitialized
    /// state. Returns how many allocations were reclaimed.
    ///
    /// This is leak recovery for process teardown, not a substitute for
    /// freeing blocks. Raw pointers from `allocate_raw` dangle afterwards.
    /// The allocator can be initialized and used again.
    pub fn shutdown(&mut self) -> usize {
        let leaked = self.reclaim();
        self.state.store(UNINITIALIZED, Ordering::Release);
        info!("JIT allocator shutdown complete");
        leaked
    }

    fn reclaim(&self) -> usize {
        let drained = self.registry.drain_all();
        if !drained.is_empty() {
            warn!("JIT shutdown: reclaiming {} live allocation(s)", drained.len());
        }
        for alloc in &drained {
            debug!(
                "JIT shutdown: releasing {} rw={:#x} rx={:#x} size={}",
                alloc.id(),
                alloc.rw_base(),
                alloc.rx_base(),
                alloc.size()
            );
        }
        drained.len()
    }
}

impl Drop for JitAllocator {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.reclaim();
        }
    }
}

/// A live dual-mapped block.
///
/// Writes go through the RW view ([`as_mut_slice`](#method.as_mut_slice),
/// [`write`](#method.write)); the CPU runs code from the RX view
/// ([`rx_ptr`](#method.rx_ptr)). Offset `k` in one view is offset `k` in the
/// other.
#[derive(Debug)]
pub struct JitBlock<'a> {
    id: AllocationId,
    rw: NonNull<u8>,
    rx: NonNull<u8>,
    size: usize,
    _allocator: PhantomData<&'a JitAllocator>,
}

// The views are plain shared memory; the handle can move between threads like
// the &JitAllocator it stands in for.
unsafe impl Send for JitBlock<'_> {}
unsafe impl Sync for JitBlock<'_> {}

impl<'a> JitBlock<'a> {
    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn rw_ptr(&self) -> *mut u8 {
        self.rw.as_ptr()
    }

    pub fn rx_ptr(&self) -> *const u8 {
        self.rx.as_ptr()
    }

    /// Size of each view, a whole number of pages.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The RW view.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.rw.as_ptr(), self.size) }
    }

    /// The RX view, as data.
    pub fn code(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.rx.as_ptr(), self.size) }
    }

    /// Copy `bytes` in at `offset` and flush the instruction cache over them.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.size)
            .ok_or(Error::InvalidArgument("write past the end of the block"))?;
        self.as_mut_slice()[offset..end].copy_from_slice(bytes);
        self.flush(offset, bytes.len())
    }

    /// Flush the instruction cache for `len` bytes at `offset`.
    pub fn flush(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => return Err(Error::InvalidArgument("flush past the end of the block")),
        }
        flush_instruction_cache(unsafe { self.rx.as_ptr().add(offset) }, len);
        Ok(())
    }

    /// Give up the handle and keep the block allocated, returning
    /// `(rw, rx, size)` for use with [`JitAllocator::free`].
    pub fn into_raw(self) -> (*mut u8, *const u8, usize) {
        (self.rw.as_ptr(), self.rx.as_ptr() as *const u8, self.size)
    }
}
