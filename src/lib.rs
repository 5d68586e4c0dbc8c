//! A Write-XOR-Execute executable memory allocator for JIT compilers.
//!
//! Some platforms (Android 10 and later, hardened Linux and BSD setups) refuse
//! to map any page both writable and executable. A JIT still needs to write
//! code and then run it, so each allocation here is one anonymous shared
//! memory object mapped twice:
//!
//! - an RW view, where the code generator writes and patches code, and
//! - an RX view, which the CPU executes.
//!
//! Both views alias the same physical pages, so a write through the RW view is
//! visible through the RX view with no copy. After writing, flush the
//! instruction cache over the written range before running it.
//!
//! ```no_run
//! use dualmap_allocator::JitAllocator;
//!
//! let allocator = JitAllocator::new();
//! allocator.initialize().unwrap();
//!
//! let mut block = allocator.allocate(100).unwrap();
//! // x86-64 `ret`
//! block.write(0, &[0xC3]).unwrap();
//! let entry = block.rx_ptr();
//! // ... jump to `entry` ...
//! # let _ = entry;
//! allocator.release(block).unwrap();
//! ```
//!
//! Addresses inside a block can be translated between views with
//! [`JitAllocator::rx_to_rw`](allocator/struct.JitAllocator.html#method.rx_to_rw)
//! and [`JitAllocator::rw_to_rx`](allocator/struct.JitAllocator.html#method.rw_to_rx),
//! for patching code found by its execution address.

#[cfg(not(unix))]
compile_error!("dualmap_allocator needs a Unix virtual memory interface");

pub mod allocator;
pub mod config;
pub mod error;
pub mod icache;
pub mod page;
pub mod registry;
pub mod unix;

pub use crate::allocator::{JitAllocator, JitBlock};
pub use crate::config::{Config, MismatchPolicy};
pub use crate::error::{Error, Result, View};
pub use crate::icache::flush_instruction_cache;
pub use crate::page::page_size;
