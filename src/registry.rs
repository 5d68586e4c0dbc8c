//! The registry of live allocations.
//!
//! Every live [`Allocation`](struct.Allocation.html) is indexed twice, once by
//! its RW base and once by its RX base. Both indexes hold the same `Arc`, so a
//! record is never duplicated, and both are updated under one lock so no
//! observer can see one index changed without the other.
//!
//! Lookups come in two phases: an exact match on a base address, then a
//! containment check for addresses inside an allocation. Each index is ordered
//! by base address, so the containment phase only has to look at the nearest
//! allocation starting at or below the address.

use core::fmt;
use core::ops::Range;
use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::unix::{Backing, DualMapping};

/// Token identifying one allocation for the lifetime of its allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One dual-mapped region and the object backing it.
///
/// Dropping an `Allocation` unmaps both views and then closes the backing
/// descriptor.
#[derive(Debug)]
pub struct Allocation {
    id: AllocationId,
    // Field order is drop order: unmap before closing.
    mapping: DualMapping,
    backing: Backing,
}

impl Allocation {
    pub fn new(id: AllocationId, backing: Backing, mapping: DualMapping) -> Self {
        Allocation {
            id,
            mapping,
            backing,
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn rw_base(&self) -> usize {
        self.mapping.rw.addr()
    }

    pub fn rx_base(&self) -> usize {
        self.mapping.rx.addr()
    }

    pub fn rw_ptr(&self) -> *mut u8 {
        self.mapping.rw.as_ptr()
    }

    pub fn rx_ptr(&self) -> *const u8 {
        self.mapping.rx.as_ptr()
    }

    /// Size in bytes of each view; always a whole number of pages.
    pub fn size(&self) -> usize {
        self.mapping.size()
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn rw_range(&self) -> Range<usize> {
        self.rw_base()..self.rw_base() + self.size()
    }

    pub fn rx_range(&self) -> Range<usize> {
        self.rx_base()..self.rx_base() + self.size()
    }
}

/// An enum for easy comparison of address ranges and their order
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl Relation {
    /// How `this` sits relative to `other`.
    pub fn of(this: &Range<usize>, other: &Range<usize>) -> Relation {
        if this.end < other.start {
            Relation::Before
        } else if this.end == other.start {
            Relation::AdjacentBefore
        } else if this.start < other.end {
            Relation::Overlapping
        } else if this.start == other.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// Validity contains a representation of all invalid states found in a
/// Registry.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of entries where the RW and RX indexes disagree: an entry in one
    /// index with no counterpart in the other, or a counterpart that is a
    /// different record.
    pub index_mismatches: usize,

    /// Number of allocations whose range, in either view, overlaps the next
    /// allocation in that view. This likely indicates corruption.
    pub overlaps: usize,

    /// Number of allocations that, in either view, start after the allocation
    /// following them.
    pub out_of_orders: usize,

    /// Number of allocations whose size is zero or not a multiple of the page
    /// size.
    pub misaligned: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.index_mismatches == 0
            && self.overlaps == 0
            && self.out_of_orders == 0
            && self.misaligned == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Number of live allocations.
    pub length: usize,
    /// Total bytes mapped per view.
    pub size: usize,
}

#[derive(Default)]
struct Indexes {
    by_rw: BTreeMap<usize, Arc<Allocation>>,
    by_rx: BTreeMap<usize, Arc<Allocation>>,
}

/// Which index a lookup starts from.
#[derive(Copy, Clone)]
enum Side {
    Rw,
    Rx,
}

impl Indexes {
    fn index(&self, from: Side) -> &BTreeMap<usize, Arc<Allocation>> {
        match from {
            Side::Rw => &self.by_rw,
            Side::Rx => &self.by_rx,
        }
    }

    /// Find the allocation `addr` belongs to in the `from` view, and its base
    /// there.
    fn find(&self, from: Side, addr: usize) -> Option<(usize, &Arc<Allocation>)> {
        let index = self.index(from);

        if let Some(alloc) = index.get(&addr) {
            return Some((addr, alloc));
        }

        // Views never overlap, so only the closest base below can contain addr.
        let (&base, alloc) = index.range(..addr).next_back()?;
        if addr - base < alloc.size() {
            Some((base, alloc))
        } else {
            None
        }
    }

    fn translate(&self, from: Side, addr: usize) -> Option<usize> {
        let (base, alloc) = self.find(from, addr)?;
        let offset = addr - base;
        let target = match from {
            Side::Rw => alloc.rx_base(),
            Side::Rx => alloc.rw_base(),
        };
        Some(target + offset)
    }
}

/// A thread-safe directory of live allocations.
pub struct Registry {
    inner: Mutex<Indexes>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(f, "Registry(")?;
        for (i, alloc) in inner.by_rw.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{}: {:#x}/{:#x}+{}",
                alloc.id(),
                alloc.rw_base(),
                alloc.rx_base(),
                alloc.size()
            )?;
        }
        write!(f, ")")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Add an allocation under both of its base addresses.
    pub fn register(&self, allocation: Allocation) {
        let allocation = Arc::new(allocation);
        let rw = allocation.rw_base();
        let rx = allocation.rx_base();

        let mut inner = self.inner.lock();
        let old_rw = inner.by_rw.insert(rw, Arc::clone(&allocation));
        let old_rx = inner.by_rx.insert(rx, allocation);
        // The kernel does not hand out an address range that is still mapped.
        debug_assert!(old_rw.is_none(), "RW base {:#x} registered twice", rw);
        debug_assert!(old_rx.is_none(), "RX base {:#x} registered twice", rx);
    }

    /// Remove the allocation whose RW base is `rw`.
    ///
    /// `check` sees the record before anything is removed; if it returns an
    /// error, the registry is left untouched and the error is returned.
    ///
    /// The returned record is the last reference: dropping it tears down the
    /// mappings. Drop it after the lock is released, which this method already
    /// guarantees by returning it.
    pub fn unregister_with<F>(&self, rw: usize, check: F) -> Result<Arc<Allocation>>
    where
        F: FnOnce(&Allocation) -> Result<()>,
    {
        let mut inner = self.inner.lock();

        let alloc = inner.by_rw.get(&rw).ok_or(Error::UnknownAllocation(rw))?;
        check(alloc)?;

        let rx = alloc.rx_base();
        let removed_rx = inner.by_rx.remove(&rx);
        debug_assert!(removed_rx.is_some(), "RX index lost {:#x}", rx);
        inner.by_rw.remove(&rw).ok_or(Error::UnknownAllocation(rw))
    }

    /// Remove the allocation whose RW base is `rw`.
    pub fn unregister(&self, rw: usize) -> Result<Arc<Allocation>> {
        self.unregister_with(rw, |_| Ok(()))
    }

    /// Translate an address in some allocation's RX view, base or interior, to
    /// the same byte in its RW view.
    pub fn translate_rx_to_rw(&self, addr: usize) -> Option<usize> {
        self.inner.lock().translate(Side::Rx, addr)
    }

    /// Translate an address in some allocation's RW view, base or interior, to
    /// the same byte in its RX view.
    pub fn translate_rw_to_rx(&self, addr: usize) -> Option<usize> {
        self.inner.lock().translate(Side::Rw, addr)
    }

    /// Empty both indexes and hand back every allocation that was live.
    pub fn drain_all(&self) -> Vec<Arc<Allocation>> {
        let mut inner = self.inner.lock();
        // Drop the RX references first so each returned Arc is the only one.
        inner.by_rx.clear();
        let by_rw = core::mem::take(&mut inner.by_rw);
        by_rw.into_iter().map(|(_, alloc)| alloc).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_rw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_rw.is_empty()
    }

    /// Get statistics on this registry, and verify that both indexes agree.
    pub fn stats(&self, page_size: usize) -> (Validity, Stats) {
        let inner = self.inner.lock();
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        for (&rw, alloc) in inner.by_rw.iter() {
            stats.length += 1;
            stats.size += alloc.size();

            if alloc.size() == 0 || alloc.size() % page_size != 0 {
                validity.misaligned += 1;
            }

            let paired = inner
                .by_rx
                .get(&alloc.rx_base())
                .map(|other| Arc::ptr_eq(alloc, other))
                .unwrap_or(false);
            if rw != alloc.rw_base() || !paired {
                validity.index_mismatches += 1;
            }
        }

        for (&rx, alloc) in inner.by_rx.iter() {
            let paired = inner
                .by_rw
                .get(&alloc.rw_base())
                .map(|other| Arc::ptr_eq(alloc, other))
                .unwrap_or(false);
            if rx != alloc.rx_base() || !paired {
                validity.index_mismatches += 1;
            }
        }

        check_order(inner.by_rw.values().map(|a| a.rw_range()), &mut validity);
        check_order(inner.by_rx.values().map(|a| a.rx_range()), &mut validity);

        (validity, stats)
    }
}

// Walk ranges in index order, counting neighbours that overlap or come out of
// order.
fn check_order<I: Iterator<Item = Range<usize>>>(ranges: I, validity: &mut Validity) {
    let mut previous: Option<Range<usize>> = None;
    for next in ranges {
        match previous.as_ref().map(|p| Relation::of(p, &next)) {
            Some(Relation::Before) | Some(Relation::AdjacentBefore) | None => {
                // Adjacent views are fine: unlike freed blocks, separate
                // mappings are never merged.
            }
            Some(Relation::Overlapping) => {
                validity.overlaps += 1;
            }
            Some(Relation::AdjacentAfter) | Some(Relation::After) => {
                validity.out_of_orders += 1;
            }
        }
        previous = Some(next);
    }
}
