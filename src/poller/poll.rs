use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::channel::Channel;
use crate::macros::syscall;
use crate::time::Timestamp;

use super::Poller;

/// `poll(2)`-backed [`Poller`].
///
/// Tracks its own `fd -> pollfds_ index` map rather than relying on the [`Channel`] to carry
/// one, since a `remove_channel` swap-with-last-and-pop may need to renumber a *different*
/// channel's slot than the one passed in.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    index_of: HashMap<RawFd, usize>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            index_of: HashMap::new(),
        }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

fn interest_to_poll(mask: u32) -> libc::c_short {
    mask as libc::c_short
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<(RawFd, u32)>) -> io::Result<Timestamp> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = match syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms,
        )) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };
        let now = Timestamp::now();
        if n > 0 {
            let mut found = 0;
            for pfd in &self.pollfds {
                if pfd.fd < 0 {
                    continue;
                }
                if pfd.revents != 0 {
                    active.push((pfd.fd, pfd.revents as u32));
                    found += 1;
                    if found == n {
                        break;
                    }
                }
            }
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &mut Channel) -> io::Result<()> {
        let fd = channel.fd();
        match self.index_of.get(&fd) {
            None => {
                let pfd = libc::pollfd {
                    fd,
                    events: interest_to_poll(channel.interest_mask()),
                    revents: 0,
                };
                let idx = self.pollfds.len();
                self.pollfds.push(pfd);
                self.index_of.insert(fd, idx);
            }
            Some(&idx) => {
                let pfd = &mut self.pollfds[idx];
                debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
                pfd.fd = fd;
                pfd.events = interest_to_poll(channel.interest_mask());
                pfd.revents = 0;
                if channel.is_none_event() {
                    // Disable without renumbering every later slot: mask the fd so poll(2)
                    // ignores it but the index remains stable for siblings.
                    pfd.fd = -fd - 1;
                }
            }
        }
        Ok(())
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> io::Result<()> {
        debug_assert!(channel.is_none_event());
        let fd = channel.fd();
        let idx = match self.index_of.remove(&fd) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        if idx == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            let last = self.pollfds.len() - 1;
            self.pollfds.swap(idx, last);
            let moved_fd = self.pollfds[idx].fd;
            let moved_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            self.index_of.insert(moved_fd, idx);
            self.pollfds.pop();
        }
        Ok(())
    }

    fn has_channel(&self, fd: RawFd) -> bool {
        self.index_of.contains_key(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[test]
    fn register_and_remove_round_trips() {
        let mut poller = PollPoller::new();
        let (r, w) = unix_pipe();
        let mut ch = Channel::new(r);
        ch.enable_reading();
        poller.update_channel(&mut ch).unwrap();
        assert!(poller.has_channel(r));

        nix_write(w, b"x");
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

    #[test]
    fn removal_of_middle_slot_fixes_up_last() {
        let mut poller = PollPoller::new();
        let pipes: Vec<(RawFd, RawFd)> = (0..3).map(|_| unix_pipe()).collect();
        let mut channels: Vec<Channel> = pipes
            .iter()
            .map(|&(r, _)| {
                let mut c = Channel::new(r);
                c.enable_reading();
                c
            })
            .collect();
        for c in channels.iter_mut() {
            poller.update_channel(c).unwrap();
        }
        channels[0].disable_all();
        poller.update_channel(&mut channels[0]).unwrap();
        poller.remove_channel(&mut channels[0]).unwrap();
        assert!(poller.has_channel(pipes[1].0));
        assert!(poller.has_channel(pipes[2].0));
        for &(r, w) in &pipes {
            unsafe {
                libc::close(r);
                libc::close(w);
            }
        }
    }

    fn unix_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn nix_write(fd: RawFd, data: &[u8]) {
        unsafe {
            libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
        }
    }
}
