use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr::{self, NonNull},
    slice,
};

use once_cell::sync::Lazy;
use thiserror::Error;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

/// Smallest ring capacity on this system, one page.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("couldn't create ring backing object")]
    Create(#[source] io::Error),
    #[error("couldn't size ring backing object to {1} bytes")]
    Size(#[source] io::Error, usize),
    #[error("couldn't map ring backing object")]
    Map(#[source] io::Error),
}

/// Single-producer single-consumer byte ring backed by one set of
/// physical pages mapped twice back to back.
///
/// Capacity is a power of two of at least one page. Because the second
/// virtual mapping repeats the first, the occupied region starting at
/// `start` and the free region behind it are each one contiguous slice,
/// no matter where they sit relative to the physical wrap point. Socket
/// code can therefore always issue a single read or write covering
/// everything the ring has to offer.
///
/// Invariants:
/// - `start < capacity`
/// - `count <= capacity`
/// - byte `i` of the occupied region lives at `data + start + i`, which
///   aliases `data + (start + i) % capacity`
pub struct Ring {
    /// Base of the doubled virtual window, `2 * size` bytes long.
    data: NonNull<u8>,
    size: usize,
    start: usize,
    count: usize,
    backing: OwnedFd,
}

// The mapping is private to this ring; &mut discipline serialises access.
unsafe impl Send for Ring {}

impl Ring {
    /// Maps a ring of the smallest valid capacity >= `min_size`.
    pub fn with_min_size(min_size: usize) -> Result<Self, RingError> {
        let mut size = page_size();
        while size < min_size {
            size <<= 1;
        }

        let fd = unsafe { libc::memfd_create(c"vchan-ring".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(RingError::Create(io::Error::last_os_error()));
        }
        // SAFETY: memfd_create returned a fresh descriptor we now own.
        let backing = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(backing.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(RingError::Size(io::Error::last_os_error(), size));
        }

        // Reserve the doubled window first, then land both views of the
        // backing object inside it with MAP_FIXED.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                2 * size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RingError::Map(io::Error::last_os_error()));
        }

        for half in 0..2 {
            let view = unsafe {
                libc::mmap(
                    base.cast::<u8>().add(half * size).cast(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    backing.as_raw_fd(),
                    0,
                )
            };
            if view == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(base, 2 * size) };
                return Err(RingError::Map(err));
            }
        }

        let data = NonNull::new(base.cast::<u8>()).expect("mmap succeeded with a null base");
        Ok(Self { data, size, start: 0, count: 0, backing })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Bytes currently queued.
    #[inline]
    pub fn filled(&self) -> usize {
        self.count
    }

    /// Free space left before the producer has to wait.
    #[inline]
    pub fn available(&self) -> usize {
        self.size - self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The occupied region, `filled()` contiguous bytes.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        // SAFETY: [start, start + count) stays inside the doubled window
        // (start < size, count <= size) and does not physically overlap
        // the writable region.
        unsafe { slice::from_raw_parts(self.data.as_ptr().add(self.start), self.count) }
    }

    /// The free region, `available()` contiguous bytes.
    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        let tail = (self.start + self.count) & (self.size - 1);
        // SAFETY: [tail, tail + available) covers exactly the physical
        // bytes not covered by readable(), through the doubled window.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr().add(tail), self.size - self.count) }
    }

    /// Retires `count` bytes from the front of the occupied region.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.count);
        self.start = (self.start + count) & (self.size - 1);
        self.count -= count;
    }

    /// Commits `count` bytes previously written into `writable()`.
    #[inline]
    pub fn produce(&mut self, count: usize) {
        debug_assert!(count <= self.available());
        self.count += count;
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // SAFETY: data/size describe the live 2 * size reservation mapped
        // in with_min_size; the backing fd closes with the OwnedFd.
        unsafe {
            libc::munmap(self.data.as_ptr().cast(), 2 * self.size);
        }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.size)
            .field("start", &self.start)
            .field("count", &self.count)
            .field("backing", &self.backing.as_raw_fd())
            .finish()
    }
}
