//! Process-wide library initialisation

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise the library: install a default `tracing` subscriber if the
/// process has none, and ignore SIGPIPE so a peer closing a UNIX-domain
/// socket surfaces as EPIPE on write instead of killing the host process.
///
/// Runs at most once per process; further calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().try_init();

        // SAFETY: SIG_IGN is a valid disposition and signal(2) touches no
        // Rust-visible state.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}
