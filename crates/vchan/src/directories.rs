use std::{
    env,
    path::{Path, PathBuf},
};

use tracing::warn;

const SOCKET_DIR: &str = "/var/run/vchan";

/// Domain id of the calling process, taken from `VCHAN_DOMAIN`.
pub(crate) fn current_domain() -> u32 {
    match env::var("VCHAN_DOMAIN") {
        Ok(s) => s.parse().unwrap_or_else(|_| {
            warn!(value = %s, "VCHAN_DOMAIN is not an integer, using domain 0");
            0
        }),
        Err(_) => 0,
    }
}

/// Directory holding the per-channel socket nodes, `VCHAN_SOCKET_DIR`
/// or `/var/run/vchan`.
pub fn socket_dir() -> PathBuf {
    env::var_os("VCHAN_SOCKET_DIR").map_or_else(|| PathBuf::from(SOCKET_DIR), PathBuf::from)
}

/// Socket node a (server, client, port) endpoint pair meets on.
pub fn socket_path(server_domain: u32, client_domain: u32, port: u32) -> PathBuf {
    socket_path_in(&socket_dir(), server_domain, client_domain, port)
}

fn socket_path_in(dir: &Path, server_domain: u32, client_domain: u32, port: u32) -> PathBuf {
    dir.join(format!("vchan.{server_domain}.{client_domain}.{port}.sock"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_names_both_domains_and_the_port() {
        let path = socket_path_in(Path::new("/run/x"), 3, 7, 42);
        assert_eq!(path, Path::new("/run/x/vchan.3.7.42.sock"));
    }

    #[test]
    fn default_dir_without_env() {
        if env::var_os("VCHAN_SOCKET_DIR").is_none() {
            assert_eq!(socket_dir(), Path::new(SOCKET_DIR));
        }
    }
}
