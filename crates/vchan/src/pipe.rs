use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

/// How many pending signal bytes one drain discards.
const DRAIN_BATCH: usize = 16;

/// Non-blocking pipe carrying coalesced "something changed" edges
/// between the worker and user threads.
///
/// A readable byte means ring contents or connection state moved since
/// the last drain. The byte count carries no meaning: writers post one
/// byte per event, a full pipe already says "changed", and readers
/// discard everything pending in one go.
pub(crate) struct EventPipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl EventPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 returned two fresh descriptors nobody else owns.
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { rx, tx })
    }

    /// Posts one signal byte. A pipe that is already full still encodes
    /// the edge, so `WouldBlock` counts as delivered.
    pub fn notify(&self) -> io::Result<()> {
        let byte = 0u8;
        let n = unsafe { libc::write(self.tx.as_raw_fd(), (&raw const byte).cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Discards pending signal bytes; an empty pipe is fine.
    pub fn drain(&self) -> io::Result<()> {
        let mut buf = [0u8; DRAIN_BATCH];
        let n = unsafe { libc::read(self.rx.as_raw_fd(), buf.as_mut_ptr().cast(), DRAIN_BATCH) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Blocks until a signal byte is pending, then drains.
    pub fn wait_readable(&self) -> io::Result<()> {
        let mut fds =
            [libc::pollfd { fd: self.rx.as_raw_fd(), events: libc::POLLIN, revents: 0 }];
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        self.drain()
    }

    /// The selectable end; readable whenever a signal is pending.
    pub fn reader(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }

    pub fn reader_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}
