//! Unix virtual memory plumbing: anonymous shared memory objects, and mapping
//! one object twice with different protections.
//!
//! On Linux and Android the backing object comes from `memfd_create`. Where the
//! kernel does not implement it (`ENOSYS`), and on the other Unixes, a POSIX
//! shared memory object is opened under a unique name and unlinked straight
//! away, so it is never reachable through the filesystem.

use core::ptr::{null_mut, NonNull};
#[cfg(any(target_os = "linux", target_os = "android"))]
use core::sync::atomic::AtomicBool;
#[cfg(not(target_os = "android"))]
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::ffi::CStr;
#[cfg(not(target_os = "android"))]
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use errno::{errno, Errno};
use log::{debug, error};

use crate::error::{Error, Result, View};

//============================================================
// Backing objects

/// An anonymous, shareable memory object sized to one allocation.
///
/// The descriptor is closed when the `Backing` is dropped.
#[derive(Debug)]
pub struct Backing {
    fd: OwnedFd,
    size: usize,
}

impl Backing {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Create a backing object of exactly `size` bytes.
///
/// `name` only shows up in `/proc/<pid>/maps` and the like; it need not be
/// unique.
pub fn create_backing(size: usize, name: &CStr) -> Result<Backing> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| Error::InvalidArgument("backing size does not fit in off_t"))?;

    let fd = open_anonymous(name)?;

    // From here on, dropping `fd` closes the half-built object.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
        let e = errno();
        error!("ftruncate({}) failed: {}", size, e);
        return Err(Error::BackingResizeFailed(e));
    }

    Ok(Backing { fd, size })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
static MEMFD_NOT_SUPPORTED: AtomicBool = AtomicBool::new(false);

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_anonymous(name: &CStr) -> Result<OwnedFd> {
    if !MEMFD_NOT_SUPPORTED.load(Ordering::Relaxed) {
        let fd = unsafe { memfd_create(name) };
        if fd >= 0 {
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }

        let e = errno();
        if e.0 != libc::ENOSYS {
            error!("memfd_create failed: {}", e);
            return Err(Error::BackingCreationFailed(e));
        }
        // The kernel predates memfd_create; never ask again.
        debug!("memfd_create is not available, falling back to shm_open");
        MEMFD_NOT_SUPPORTED.store(true, Ordering::Relaxed);
    }

    #[cfg(target_os = "android")]
    {
        Err(Error::BackingCreationFailed(Errno(libc::ENOSYS)))
    }

    #[cfg(not(target_os = "android"))]
    {
        shm_anonymous()
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_anonymous(_name: &CStr) -> Result<OwnedFd> {
    shm_anonymous()
}

/// The libc wrapper, when the C library has one.
#[cfg(all(target_os = "linux", not(feature = "raw_syscall")))]
unsafe fn memfd_create(name: &CStr) -> libc::c_int {
    libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC)
}

/// The raw syscall, for Android below API level 30 and old C libraries.
#[cfg(any(target_os = "android", all(target_os = "linux", feature = "raw_syscall")))]
unsafe fn memfd_create(name: &CStr) -> libc::c_int {
    libc::syscall(libc::SYS_memfd_create, name.as_ptr(), libc::MFD_CLOEXEC) as libc::c_int
}

#[cfg(not(target_os = "android"))]
fn shm_anonymous() -> Result<OwnedFd> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    const RETRIES: usize = 100;

    let pid = unsafe { libc::getpid() };
    for _ in 0..RETRIES {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        // Short names: macOS caps shm names at 31 bytes.
        let name = CString::new(format!("/dmjit-{:x}-{:x}", pid, n))
            .map_err(|_| Error::InvalidArgument("shm name contains a NUL byte"))?;

        let fd = unsafe { shm_open_exclusive(&name) };
        if fd >= 0 {
            // Only the descriptor keeps it alive from now on.
            unsafe { libc::shm_unlink(name.as_ptr()) };
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }

        let e = errno();
        if e.0 != libc::EEXIST {
            error!("shm_open failed: {}", e);
            return Err(Error::BackingCreationFailed(e));
        }
    }

    Err(Error::BackingCreationFailed(Errno(libc::EEXIST)))
}

#[cfg(not(target_os = "android"))]
unsafe fn shm_open_exclusive(name: &CStr) -> libc::c_int {
    let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
    // shm_open is variadic on macOS, so the mode must be promoted.
    #[cfg(target_os = "macos")]
    let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint;
    #[cfg(not(target_os = "macos"))]
    let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t;

    libc::shm_open(name.as_ptr(), flags, mode)
}

//============================================================
// Mappings

/// One view of a backing object. Unmapped on drop.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// A Mapping is only an address range; the pages behind it are not tied to the
// thread that mapped them.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes of `backing` from offset 0 with the given protection.
    fn new(backing: &Backing, len: usize, view: View) -> Result<Mapping> {
        let prot = match view {
            View::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            View::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                len,
                prot,
                // MAP_SHARED: writes through one view must land in the object,
                // not in a private copy, or the other view would never see them.
                libc::MAP_SHARED,
                backing.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let errno = errno();
            error!("mmap {} view of {} bytes failed: {}", view, len, errno);
            return Err(Error::MappingFailed { view, errno });
        }

        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => Ok(Mapping { ptr, len }),
            // mmap(NULL, ...) should never hand back address zero
            None => Err(Error::MappingFailed {
                view,
                errno: Errno(libc::EINVAL),
            }),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            error!("munmap({:?}, {}) failed: {}", self.ptr, self.len, errno());
        }
    }
}

/// A backing object mapped twice: writable, and separately executable.
///
/// Offset `k` into `rw` and offset `k` into `rx` are the same byte. Neither
/// view is ever both writable and executable.
#[derive(Debug)]
pub struct DualMapping {
    pub rw: Mapping,
    pub rx: Mapping,
}

impl DualMapping {
    pub fn size(&self) -> usize {
        self.rw.len()
    }
}

/// Map `backing` twice, RW first and then RX.
///
/// If the RX mapping fails the RW mapping is unmapped again before the error is
/// returned, so nothing is left half-built.
pub fn map_dual(backing: &Backing, size: usize) -> Result<DualMapping> {
    if size == 0 || size > backing.size() {
        return Err(Error::InvalidArgument("mapping size must be within the backing object"));
    }

    let rw = Mapping::new(backing, size, View::ReadWrite)?;
    // On failure `rw` drops here, which unmaps it.
    let rx = Mapping::new(backing, size, View::ReadExecute)?;

    Ok(DualMapping { rw, rx })
}
