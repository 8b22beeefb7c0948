use std::{env, sync::OnceLock, thread, time::Duration};

use tempfile::TempDir;

/// Points every channel in this test process at one scratch directory.
/// Call before the first channel is created.
pub fn socket_dir_init() {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("couldn't create a socket dir");
        // SAFETY: the environment is only touched through this
        // once-per-process initialiser, before any channel exists.
        unsafe { env::set_var("VCHAN_SOCKET_DIR", dir.path()) };
        dir
    });
}

pub fn wait_until(cond: impl Fn() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
