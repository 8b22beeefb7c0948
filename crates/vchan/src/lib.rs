mod channel;
mod directories;
mod error;
mod pipe;
mod socket;
mod worker;

pub use channel::{State, Vchan};
pub use directories::{socket_dir, socket_path};
pub use error::Error;
pub use vchan_ring::Ring;
