//! Page geometry: the platform page size and rounding to it.

use log::warn;
use spin::Once;
use static_assertions::const_assert;

use crate::error::{Error, Result};

/// Page size assumed when the platform refuses to tell us.
pub const FALLBACK_PAGE_SIZE: usize = 4096;
const_assert!(FALLBACK_PAGE_SIZE.is_power_of_two());

static PAGE_SIZE: Once<usize> = Once::new();

/// The platform page size, queried once per process.
///
/// A nonsensical answer from the OS (zero, or not a power of two, which is
/// also what `-1` looks like once cast) is replaced by
/// [`FALLBACK_PAGE_SIZE`](constant.FALLBACK_PAGE_SIZE.html).
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| checked_page_size(sysconf::page::pagesize()))
}

fn checked_page_size(reported: usize) -> usize {
    if reported == 0 || !reported.is_power_of_two() {
        warn!(
            "Platform reported page size {}, falling back to {}",
            reported, FALLBACK_PAGE_SIZE
        );
        return FALLBACK_PAGE_SIZE;
    }
    reported
}

/// Round up value to the nearest multiple of increment.
///
/// Returns `None` if the result does not fit in a `usize`. Zero stays zero.
pub fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment).checked_add(1)?.checked_mul(increment)
}

/// Round a requested allocation size up to whole pages.
///
/// Zero is rejected rather than silently turned into a page.
pub fn round_to_pages(size: usize, page_size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::InvalidArgument("allocation size must be non-zero"));
    }
    round_up(size, page_size).ok_or(Error::InvalidArgument(
        "allocation size overflows when rounded to pages",
    ))
}
