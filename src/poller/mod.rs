mod epoll;
mod poll;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::channel::Channel;
use crate::time::Timestamp;

pub use epoll::EpollPoller;
pub use poll::PollPoller;

/// OS I/O-readiness multiplexer, abstracted so an [`crate::event_loop::EventLoop`] can run
/// atop either backend without its callers noticing.
///
/// Every method must be called from the loop thread that owns this `Poller`; nothing here is
/// `Sync`, only `Send` (a loop's Poller moves to its worker thread once and stays there).
pub trait Poller: Send {
    /// Wait up to `timeout` for readiness, appending `(fd, revents)` pairs for every channel
    /// that became active to `active`. Returns the instant `poll`/`epoll_wait` returned.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<(RawFd, u32)>) -> io::Result<Timestamp>;

    /// Reflect `channel.interest_mask()` into the OS registration for `channel.fd()`.
    fn update_channel(&mut self, channel: &mut Channel) -> io::Result<()>;

    /// Remove `channel` from the OS registration. Precondition: `channel.is_none_event()`.
    fn remove_channel(&mut self, channel: &mut Channel) -> io::Result<()>;

    fn has_channel(&self, fd: RawFd) -> bool;
}

/// Selects a backend: the `FISHNET_USE_POLL` environment variable forces `poll(2)`; epoll(7)
/// is the default on Linux.
pub fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if std::env::var_os("FISHNET_USE_POLL").is_some() {
        log_poller_choice("poll(2) (FISHNET_USE_POLL set)");
        Ok(Box::new(PollPoller::new()))
    } else {
        log_poller_choice("epoll(7)");
        Ok(Box::new(EpollPoller::new()?))
    }
}

fn log_poller_choice(which: &str) {
    #[cfg(feature = "log")]
    log::debug!("selecting {which} poller backend");
    #[cfg(not(feature = "log"))]
    let _ = which;
}
