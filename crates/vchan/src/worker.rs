use std::{
    io, mem,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    ptr,
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    channel::{Control, State},
    socket,
};

/// Accept-side poll timeout; bounds how long a shutdown request can go
/// unnoticed while no client has shown up.
const ACCEPT_POLL_MS: libc::c_int = 100;

/// Listening-side worker: bind, wait for the channel's one peer, run
/// the session, report the outcome.
pub(crate) fn server(control: Arc<Control>) {
    block_signals();

    let listener = match socket::listen(&control.socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(?err, path = ?control.socket_path, "couldn't bind channel socket");
            change_state(&control, State::Disconnected);
            return;
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        warn!(?err, "couldn't make the listener non-blocking");
        change_state(&control, State::Disconnected);
        return;
    }

    change_state(&control, State::Waiting);

    let stream = match wait_for_peer(&control, &listener) {
        Ok(Some(stream)) => stream,
        // Closed before anyone connected.
        Ok(None) => return,
        Err(err) => {
            warn!(?err, "accepting a peer failed");
            change_state(&control, State::Disconnected);
            return;
        }
    };

    change_state(&control, State::Connected);
    comm_loop(&control, &stream);
    change_state(&control, State::Disconnected);
}

/// Connecting-side worker: retry until the server node answers, run the
/// session, report the outcome.
pub(crate) fn client(control: Arc<Control>) {
    block_signals();

    let stream = match socket::connect(&control.socket_path, || !control.lock().shutdown) {
        Ok(Some(stream)) => stream,
        // Closed before the server ever appeared.
        Ok(None) => return,
        Err(err) => {
            warn!(?err, path = ?control.socket_path, "couldn't connect to channel socket");
            change_state(&control, State::Disconnected);
            return;
        }
    };

    change_state(&control, State::Connected);
    comm_loop(&control, &stream);
    change_state(&control, State::Disconnected);
}

/// Blocks until a client connects, waking every [`ACCEPT_POLL_MS`] to
/// notice a shutdown request. `Ok(None)` means shutdown won.
fn wait_for_peer(control: &Control, listener: &UnixListener) -> io::Result<Option<UnixStream>> {
    loop {
        let mut fds =
            [libc::pollfd { fd: listener.as_raw_fd(), events: libc::POLLIN, revents: 0 }];
        poll_fds(&mut fds, ACCEPT_POLL_MS)?;

        if control.lock().shutdown {
            return Ok(None);
        }
        if fds[0].revents & libc::POLLIN == 0 {
            continue;
        }

        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                return Ok(Some(stream));
            }
            // The connection went away between poll and accept.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
    }
}

/// The per-session engine: one poll loop shuttling bytes between the
/// socket and the two rings until the peer goes away or close drains
/// the outgoing ring. Either way the session is over when this returns;
/// the channel never re-arms.
fn comm_loop(control: &Control, stream: &UnixStream) {
    let socket_fd = stream.as_raw_fd();
    let pipe_fd = control.user_event.reader_fd();

    let mut done = false;
    let mut shutdown = false;

    while !done {
        let mut fds = [
            libc::pollfd { fd: socket_fd, events: 0, revents: 0 },
            libc::pollfd { fd: pipe_fd, events: libc::POLLIN, revents: 0 },
        ];
        {
            let shared = control.lock();
            if shared.read_ring.available() > 0 {
                fds[0].events |= libc::POLLIN;
            }
            if shared.write_ring.filled() > 0 {
                fds[0].events |= libc::POLLOUT;
            }
        }

        if let Err(err) = poll_fds(&mut fds, -1) {
            warn!(?err, "session poll failed");
            return;
        }

        let mut shared = control.lock();
        shutdown = shared.shutdown;

        if fds[1].revents & libc::POLLIN != 0 {
            if let Err(err) = control.user_event.drain() {
                warn!(?err, "couldn't drain the user event pipe");
                return;
            }
        }

        let mut notify = false;

        // Socket -> read ring.
        if fds[0].revents & libc::POLLIN != 0 && shared.read_ring.available() > 0 {
            match fd_read(socket_fd, shared.read_ring.writable()) {
                Ok(0) => done = true,
                Ok(count) => {
                    shared.read_ring.produce(count);
                    notify = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.raw_os_error() == Some(libc::ECONNRESET) => done = true,
                Err(err) => {
                    warn!(?err, "socket read failed");
                    return;
                }
            }
        }

        // Write ring -> socket.
        if fds[0].revents & libc::POLLOUT != 0 && shared.write_ring.filled() > 0 {
            match fd_write(socket_fd, shared.write_ring.readable()) {
                Ok(0) => {}
                Ok(count) => {
                    shared.write_ring.consume(count);
                    notify = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.raw_os_error() == Some(libc::EPIPE) => done = true,
                Err(err) => {
                    warn!(?err, "socket write failed");
                    return;
                }
            }
        }

        if notify {
            if let Err(err) = control.socket_event.notify() {
                warn!(?err, "couldn't report data movement");
                return;
            }
        }

        // A closing channel flushes everything already accepted for the
        // peer before going away.
        if shutdown && shared.write_ring.is_empty() {
            done = true;
        }
    }

    if !shutdown {
        debug!("peer disconnected");
    }
}

/// Publishes a state transition and wakes anyone selecting on the
/// channel.
fn change_state(control: &Control, state: State) {
    let mut shared = control.lock();
    shared.state = state;
    if let Err(err) = control.socket_event.notify() {
        warn!(?err, ?state, "couldn't report state change");
    }
}

/// Blocks every asynchronous signal on the worker thread, keeping
/// process-directed signals from interrupting its poll loop.
fn block_signals() {
    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigfillset(set.as_mut_ptr());
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, set.as_ptr(), ptr::null_mut());
        if rc != 0 {
            warn!(code = rc, "couldn't mask signals on the worker thread");
        }
    }
}

fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<usize> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn fd_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn fd_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
