use std::sync::Once;

static IGNORE_SIGPIPE: Once = Once::new();

/// Ignore `SIGPIPE` process-wide, once. Writing to a peer that has reset its connection raises
/// `SIGPIPE` by default, which would kill the process before the write call ever gets a chance
/// to return `EPIPE`; every [`crate::event_loop::EventLoop`] calls this during construction.
pub fn ignore_once() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
