use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::channel::Channel;
use crate::macros::syscall;
use crate::time::Timestamp;

use super::Poller;

const INIT_EVENT_LIST_SIZE: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Added,
    Deleted,
}

/// `epoll(7)`-backed [`Poller`]. Level-triggered throughout (no `EPOLLET`) so that the
/// Acceptor's EMFILE-recovery dance and the poll(2) backend observe identical semantics.
pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    state_of: HashMap<RawFd, State>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            // SAFETY: epoll_create1 returned a valid, freshly-owned fd.
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            state_of: HashMap::new(),
        })
    }
}

fn interest_to_epoll(mask: u32) -> u32 {
    // Our interest_mask already uses POLLIN/POLLOUT/POLLPRI bit values; epoll's bits happen
    // to share the low bits with poll(2) on Linux, but we spell the translation out rather
    // than rely on that coincidence holding across future mask bits.
    let mut events = 0u32;
    if mask & libc::POLLIN as u32 != 0 {
        events |= libc::EPOLLIN as u32;
    }
    if mask & libc::POLLPRI as u32 != 0 {
        events |= libc::EPOLLPRI as u32;
    }
    if mask & libc::POLLOUT as u32 != 0 {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_poll(events: u32) -> u32 {
    let mut mask = 0u32;
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= libc::POLLIN as u32;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        mask |= libc::POLLPRI as u32;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= libc::POLLOUT as u32;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        mask |= libc::POLLHUP as u32;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        mask |= libc::POLLERR as u32;
    }
    if events & libc::EPOLLRDHUP as u32 != 0 {
        mask |= 0x2000; // matches the RDHUP bit Channel::handle_event checks for
    }
    mask
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<(RawFd, u32)>) -> io::Result<Timestamp> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = match syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.len() as i32,
            timeout_ms,
        )) {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };
        let now = Timestamp::now();
        for ev in &self.events[..n] {
            let fd = ev.u64 as RawFd;
            active.push((fd, epoll_to_poll(ev.events)));
        }
        if n == self.events.len() {
            let new_len = self.events.len() * 2;
            self.events.resize(new_len, unsafe { std::mem::zeroed() });
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &mut Channel) -> io::Result<()> {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest_mask()),
            u64: fd as u64,
        };
        match self.state_of.get(&fd) {
            None | Some(State::Deleted) => {
                syscall!(epoll_ctl(
                    self.epoll_fd.as_raw_fd(),
                    libc::EPOLL_CTL_ADD,
                    fd,
                    &mut event
                ))?;
                self.state_of.insert(fd, State::Added);
            }
            Some(State::Added) => {
                if channel.is_none_event() {
                    syscall!(epoll_ctl(
                        self.epoll_fd.as_raw_fd(),
                        libc::EPOLL_CTL_DEL,
                        fd,
                        std::ptr::null_mut()
                    ))?;
                    self.state_of.insert(fd, State::Deleted);
                } else {
                    syscall!(epoll_ctl(
                        self.epoll_fd.as_raw_fd(),
                        libc::EPOLL_CTL_MOD,
                        fd,
                        &mut event
                    ))?;
                }
            }
        }
        Ok(())
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> io::Result<()> {
        debug_assert!(channel.is_none_event());
        let fd = channel.fd();
        if let Some(state) = self.state_of.remove(&fd) {
            if state == State::Added {
                syscall!(epoll_ctl(
                    self.epoll_fd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut()
                ))?;
            }
        }
        Ok(())
    }

    fn has_channel(&self, fd: RawFd) -> bool {
        matches!(self.state_of.get(&fd), Some(State::Added))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::RawFd;

    #[test]
    fn register_observe_remove() {
        let mut poller = EpollPoller::new().unwrap();
        let (r, w) = unix_pipe();
        let mut ch = Channel::new(r);
        ch.enable_reading();
        poller.update_channel(&mut ch).unwrap();
        assert!(poller.has_channel(r));

        unsafe {
            libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let mut active = Vec::new();
        poller.poll(Duration::from_millis(500), &mut active).unwrap();
        assert_eq!(active, vec![(r, libc::POLLIN as u32)]);

        ch.disable_all();
        poller.update_channel(&mut ch).unwrap();
        poller.remove_channel(&mut ch).unwrap();
        assert!(!poller.has_channel(r));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    fn unix_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }
}
