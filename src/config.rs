//! Runtime configuration for a [`JitAllocator`](../allocator/struct.JitAllocator.html).

use std::ffi::{CStr, CString};

/// What `free` does when the RX pointer it is handed is not the one the
/// registry has on record for that RW pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Log a warning and free the registry's record anyway. Leaving executable
    /// memory mapped is worse than trusting the registry.
    Warn,
    /// Refuse with `InvalidArgument` and free nothing.
    Reject,
}

impl Default for MismatchPolicy {
    fn default() -> Self {
        MismatchPolicy::Warn
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    backing_name: CString,
    mismatch_policy: MismatchPolicy,
}

pub const DEFAULT_BACKING_NAME: &str = "dualmap_jit";

impl Default for Config {
    fn default() -> Self {
        Config {
            // No interior NUL in the literal, so this cannot fail.
            backing_name: CString::new(DEFAULT_BACKING_NAME).unwrap_or_default(),
            mismatch_policy: MismatchPolicy::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name given to each backing object, as shown in `/proc/<pid>/maps`.
    ///
    /// Names containing a NUL byte are ignored and the current name is kept.
    pub fn with_backing_name(mut self, name: &str) -> Self {
        match CString::new(name) {
            Ok(name) => self.backing_name = name,
            Err(_) => log::warn!("Ignoring backing name with an interior NUL: {:?}", name),
        }
        self
    }

    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }

    pub fn backing_name(&self) -> &CStr {
        &self.backing_name
    }

    pub fn mismatch_policy(&self) -> MismatchPolicy {
        self.mismatch_policy
    }
}
