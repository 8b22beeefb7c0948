use std::io;

use thiserror::Error;
use vchan_ring::RingError;

#[derive(Error, Debug)]
pub enum Error {
    /// Allocation, mapping, pipe or thread creation failed while the
    /// channel was being set up.
    #[error("out of channel resources")]
    ResourceExhausted(#[source] io::Error),
    /// Unrecoverable syscall failure on a live channel.
    #[error("channel i/o error")]
    Io(#[source] io::Error),
}

impl From<RingError> for Error {
    fn from(err: RingError) -> Self {
        Self::ResourceExhausted(io::Error::other(err))
    }
}
