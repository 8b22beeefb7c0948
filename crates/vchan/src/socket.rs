use std::{
    fs, io,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    thread,
    time::Duration,
};

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

/// Delay between client connect attempts while the server side is
/// missing or not yet listening.
pub(crate) const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// One peer per channel, so one pending connection is all we accept.
const BACKLOG: i32 = 1;

/// Binds the channel's socket node, replacing a stale one left behind
/// by an earlier server.
pub(crate) fn listen(path: &Path) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!(?path, "removed stale socket node"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Connects to the channel's socket node, retrying while the server is
/// not there yet. Returns `None` when `keep_trying` says to stop.
pub(crate) fn connect(
    path: &Path,
    keep_trying: impl Fn() -> bool,
) -> io::Result<Option<UnixStream>> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                return Ok(Some(stream));
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
            {
                if !keep_trying() {
                    return Ok(None);
                }
                thread::sleep(CONNECT_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listen_replaces_a_stale_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan.sock");

        let first = listen(&path).unwrap();
        drop(first);
        // The node is still on disk; a new server must displace it.
        listen(&path).unwrap();
    }

    #[test]
    fn connect_gives_up_when_told_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobody-home.sock");
        let got = connect(&path, || false).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn connect_reaches_a_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan.sock");
        let listener = listen(&path).unwrap();

        let stream = connect(&path, || true).unwrap().unwrap();
        let (_peer, _) = listener.accept().unwrap();
        drop(stream);
    }
}
