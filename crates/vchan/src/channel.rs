use std::{
    os::fd::BorrowedFd,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use tracing::warn;
use vchan_ring::Ring;

use crate::{directories, error::Error, pipe::EventPipe, worker};

/// Ring size used for both directions when the client does not get to
/// choose one.
const DEFAULT_RING_MIN: usize = 1024;

/// Connection state reported by [`Vchan::state`].
///
/// The discriminants are stable: 0 disconnected, 1 connected, 2 server
/// waiting for its peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Initial client state, and terminal state after either side of an
    /// established session goes away.
    Disconnected = 0,
    Connected = 1,
    /// Server bound and listening, no client yet.
    Waiting = 2,
}

/// Everything the worker and user threads both mutate, behind the one
/// per-channel mutex.
pub(crate) struct Shared {
    /// Socket -> user direction; the worker produces, `read`/`recv`
    /// consume.
    pub read_ring: Ring,
    /// User -> socket direction; `write`/`send` produce, the worker
    /// consumes.
    pub write_ring: Ring,
    pub state: State,
    /// Set once by close; the worker flushes `write_ring` and exits.
    pub shutdown: bool,
}

/// Per-channel control block shared between caller threads and the
/// worker.
///
/// The pipes sit outside the mutex: both ends are single fds safe to
/// poke concurrently, and the blocking `poll` calls on them must not
/// hold the lock.
pub(crate) struct Control {
    pub shared: Mutex<Shared>,
    /// User -> worker: ring contents changed, or shutdown requested.
    pub user_event: EventPipe,
    /// Worker -> user: ring contents or state changed. The read end is
    /// the externally selectable descriptor.
    pub socket_event: EventPipe,
    pub socket_path: PathBuf,
}

impl Control {
    pub fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of a bidirectional byte channel between two local processes.
///
/// A channel endpoint pair is named by (server domain, client domain,
/// port); both sides derive the same socket node under
/// [`socket_dir`](crate::socket_dir) and meet there. The server listens,
/// the client retries until the server appears. Once either side of an
/// established session disconnects the channel is done for good; a new
/// session needs fresh handles on both sides.
///
/// All byte-moving calls block. `read`/`write` move at least one byte,
/// `recv`/`send` exactly the buffer. Any number of threads may share a
/// handle by reference; operations are serialised per direction but not
/// framed, so interleaved writers need their own framing.
///
/// [`event_fd`](Self::event_fd) exposes a descriptor that turns readable
/// on every state change and every byte moved by the worker, for callers
/// multiplexing a channel into their own poll loop.
pub struct Vchan {
    control: Arc<Control>,
    worker: Option<JoinHandle<()>>,
}

impl Vchan {
    /// Creates the listening side of a channel towards `domain`.
    ///
    /// Ring sizes are rounded up to a power of two of at least one
    /// page. The channel reports [`State::Waiting`] until a client
    /// connects.
    pub fn server(domain: u32, port: u32, read_min: usize, write_min: usize) -> Result<Self, Error> {
        let path = directories::socket_path(directories::current_domain(), domain, port);
        Self::init(path, read_min, write_min, State::Waiting, worker::server)
    }

    /// Creates the connecting side of a channel towards `domain`.
    ///
    /// Returns immediately; the worker keeps retrying in the background
    /// while the server is missing, and the channel reports
    /// [`State::Disconnected`] until the connection lands.
    pub fn client(domain: u32, port: u32) -> Result<Self, Error> {
        let path = directories::socket_path(domain, directories::current_domain(), port);
        Self::init(path, DEFAULT_RING_MIN, DEFAULT_RING_MIN, State::Disconnected, worker::client)
    }

    fn init(
        socket_path: PathBuf,
        read_min: usize,
        write_min: usize,
        state: State,
        entry: fn(Arc<Control>),
    ) -> Result<Self, Error> {
        let control = Arc::new(Control {
            shared: Mutex::new(Shared {
                read_ring: Ring::with_min_size(read_min)?,
                write_ring: Ring::with_min_size(write_min)?,
                state,
                shutdown: false,
            }),
            user_event: EventPipe::new().map_err(Error::ResourceExhausted)?,
            socket_event: EventPipe::new().map_err(Error::ResourceExhausted)?,
            socket_path,
        });

        let worker = thread::Builder::new()
            .name("vchan-worker".into())
            .spawn({
                let control = Arc::clone(&control);
                move || entry(control)
            })
            .map_err(Error::ResourceExhausted)?;

        Ok(Self { control, worker: Some(worker) })
    }

    /// Reads between 1 and `buf.len()` bytes, blocking until something
    /// is buffered. An empty `buf` returns 0 without blocking.
    ///
    /// A disconnected channel with an empty buffer blocks until more
    /// data arrives, which is never; callers seeing this call return
    /// small amounts should consult [`state`](Self::state) before
    /// reading again.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.do_read(buf, 1)
    }

    /// Reads exactly `buf.len()` bytes, blocking as needed.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        // Exact reads wider than the ring proceed in capacity-bounded
        // slices; each slice blocks until it fits entirely.
        let cap = self.control.lock().read_ring.capacity();
        let mut done = 0;
        while done < buf.len() {
            let want = (buf.len() - done).min(cap);
            done += self.do_read(&mut buf[done..], want)?;
        }
        Ok(done)
    }

    /// Writes between 1 and `buf.len()` bytes, blocking until the
    /// outgoing buffer has room. An empty `buf` returns 0.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.do_write(buf, 1)
    }

    /// Writes exactly `buf.len()` bytes, blocking as needed.
    pub fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        let cap = self.control.lock().write_ring.capacity();
        let mut done = 0;
        while done < buf.len() {
            let want = (buf.len() - done).min(cap);
            done += self.do_write(&buf[done..], want)?;
        }
        Ok(done)
    }

    fn do_read(&self, buf: &mut [u8], min: usize) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut shared = self.control.lock();
        while shared.read_ring.filled() < min {
            drop(shared);
            self.wait()?;
            shared = self.control.lock();
        }

        self.control.socket_event.drain().map_err(Error::Io)?;

        let size = shared.read_ring.filled().min(buf.len());
        buf[..size].copy_from_slice(&shared.read_ring.readable()[..size]);
        shared.read_ring.consume(size);
        drop(shared);

        self.control.user_event.notify().map_err(Error::Io)?;
        Ok(size)
    }

    fn do_write(&self, buf: &[u8], min: usize) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut shared = self.control.lock();
        while shared.write_ring.available() < min {
            drop(shared);
            self.wait()?;
            shared = self.control.lock();
        }

        let size = shared.write_ring.available().min(buf.len());
        shared.write_ring.writable()[..size].copy_from_slice(&buf[..size]);
        shared.write_ring.produce(size);
        drop(shared);

        self.control.user_event.notify().map_err(Error::Io)?;
        Ok(size)
    }

    /// Blocks until the worker reports a state change or data movement,
    /// then consumes the report.
    pub fn wait(&self) -> Result<(), Error> {
        self.control.socket_event.wait_readable().map_err(Error::Io)
    }

    /// Bytes buffered for [`read`](Self::read), without blocking.
    pub fn data_ready(&self) -> usize {
        self.control.lock().read_ring.filled()
    }

    /// Room left for [`write`](Self::write), without blocking.
    pub fn buffer_space(&self) -> usize {
        self.control.lock().write_ring.available()
    }

    pub fn state(&self) -> State {
        self.control.lock().state
    }

    /// Descriptor for external poll loops. Stable for the channel's
    /// lifetime; becomes readable on every state change and every batch
    /// of bytes the worker moves. External selectors should not consume
    /// it; the next `read` or `wait` drains it.
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.control.socket_event.reader()
    }

    /// Shuts the channel down. Buffered outgoing bytes are flushed to
    /// the peer first; anything unread coming the other way is dropped.
    /// Dropping the handle does the same.
    pub fn close(self) {
        drop(self);
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else { return };

        self.control.lock().shutdown = true;
        if let Err(err) = self.control.user_event.notify() {
            warn!(?err, "couldn't kick the worker for shutdown");
        }
        if worker.join().is_err() {
            warn!("channel worker exited by panic");
        }
    }
}

impl Drop for Vchan {
    fn drop(&mut self) {
        self.shutdown();
    }
}
