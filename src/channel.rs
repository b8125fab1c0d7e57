use std::any::Any;
use std::os::fd::RawFd;
use std::sync::Weak;

use crate::time::Timestamp;

pub const EVENT_NONE: u32 = 0;
pub const EVENT_READ: u32 = libc::POLLIN as u32 | libc::POLLPRI as u32;
pub const EVENT_WRITE: u32 = libc::POLLOUT as u32;

pub type ReadCallback = Box<dyn FnMut(&mut Channel, Timestamp) + Send>;
pub type EventCallback = Box<dyn FnMut(&mut Channel) + Send>;

/// Binds one file descriptor to its owning loop's [`crate::poller::Poller`].
///
/// A `Channel` does not own `fd`; whoever constructs it (Acceptor, Connector, TcpConnection)
/// is responsible for closing it. The `tie` is a weak reference to that owner, promoted for
/// the duration of [`Channel::handle_event`] so a close callback firing mid-dispatch can't
/// free the owner out from under the rest of the dispatch.
pub struct Channel {
    fd: RawFd,
    interest_mask: u32,
    revents_mask: u32,
    tied: bool,
    tie: Weak<dyn Any + Send + Sync>,
    event_handling: bool,
    added_to_loop: bool,
    disposed: bool,

    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interest_mask: EVENT_NONE,
            revents_mask: EVENT_NONE,
            tied: false,
            tie: Weak::<()>::new(),
            event_handling: false,
            added_to_loop: false,
            disposed: false,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }
    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }
    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }
    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    /// Keep `owner` alive for the duration of every future `handle_event` call.
    pub fn tie(&mut self, weak: Weak<dyn Any + Send + Sync>) {
        self.tie = weak;
        self.tied = true;
    }

    pub fn interest_mask(&self) -> u32 {
        self.interest_mask
    }

    pub fn set_revents(&mut self, revents: u32) {
        self.revents_mask = revents;
    }

    pub fn is_none_event(&self) -> bool {
        self.interest_mask == EVENT_NONE
    }

    pub fn is_writing(&self) -> bool {
        self.interest_mask & EVENT_WRITE != 0
    }

    pub fn is_reading(&self) -> bool {
        self.interest_mask & EVENT_READ != 0
    }

    pub fn added_to_loop(&self) -> bool {
        self.added_to_loop
    }

    pub fn set_added_to_loop(&mut self, v: bool) {
        self.added_to_loop = v;
    }

    pub fn set_interest(&mut self, mask: u32) {
        self.interest_mask = mask;
    }

    pub fn enable_reading(&mut self) {
        self.interest_mask |= EVENT_READ;
    }
    pub fn disable_reading(&mut self) {
        self.interest_mask &= !EVENT_READ;
    }
    pub fn enable_writing(&mut self) {
        self.interest_mask |= EVENT_WRITE;
    }
    pub fn disable_writing(&mut self) {
        self.interest_mask &= !EVENT_WRITE;
    }
    pub fn disable_all(&mut self) {
        self.interest_mask = EVENT_NONE;
    }

    /// Dispatch `revents_mask` to the installed callbacks in the fixed order: close, error,
    /// read, write. If tied, the owner is promoted and held for the call's duration; a failed
    /// promotion (owner already gone) drops the event silently.
    pub fn handle_event(&mut self, receive_time: Timestamp) {
        let _guard: Option<std::sync::Arc<dyn Any + Send + Sync>> = if self.tied {
            match self.tie.upgrade() {
                Some(strong) => Some(strong),
                None => return,
            }
        } else {
            None
        };
        self.handle_event_with_guard(receive_time);
    }

    /// Each callback is taken out of its slot before being invoked so it can receive `&mut
    /// self` (the `Channel`) as an argument — e.g. to toggle its own interest mask mid-dispatch
    /// without going back through the loop's channel registry and risking a reentrant lock.
    fn handle_event_with_guard(&mut self, receive_time: Timestamp) {
        self.event_handling = true;
        let revents = self.revents_mask;

        if revents & libc::POLLHUP as u32 != 0 && revents & libc::POLLIN as u32 == 0 {
            if let Some(mut cb) = self.close_cb.take() {
                cb(self);
                if self.close_cb.is_none() {
                    self.close_cb = Some(cb);
                }
            }
        }
        if revents & (libc::POLLERR as u32 | libc::POLLNVAL as u32) != 0 {
            if let Some(mut cb) = self.error_cb.take() {
                cb(self);
                if self.error_cb.is_none() {
                    self.error_cb = Some(cb);
                }
            }
        }
        if revents & (libc::POLLIN as u32 | libc::POLLPRI as u32 | 0x2000 /* RDHUP */) != 0 {
            if let Some(mut cb) = self.read_cb.take() {
                cb(self, receive_time);
                if self.read_cb.is_none() {
                    self.read_cb = Some(cb);
                }
            }
        }
        if revents & libc::POLLOUT as u32 != 0 {
            if let Some(mut cb) = self.write_cb.take() {
                cb(self);
                if self.write_cb.is_none() {
                    self.write_cb = Some(cb);
                }
            }
        }
        self.event_handling = false;
    }

    pub fn event_handling(&self) -> bool {
        self.event_handling
    }

    /// Mark this channel as no longer wanted by its owner (fd handed off or closed) while a
    /// callback is running mid-[`Channel::handle_event`] and so has no way to reach the loop's
    /// channel registry directly. Forces the interest mask empty so the eventual
    /// `Poller::remove_channel` precondition holds.
    pub fn dispose(&mut self) {
        self.interest_mask = EVENT_NONE;
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest_mask", &self.interest_mask)
            .field("revents_mask", &self.revents_mask)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn read_and_write_interests_are_independent() {
        let mut ch = Channel::new(3);
        assert!(ch.is_none_event());
        ch.enable_reading();
        assert!(ch.is_reading() && !ch.is_writing());
        ch.enable_writing();
        assert!(ch.is_reading() && ch.is_writing());
        ch.disable_reading();
        assert!(!ch.is_reading() && ch.is_writing());
        ch.disable_all();
        assert!(ch.is_none_event());
    }

    #[test]
    fn dispatch_order_is_close_error_read_write() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ch = Channel::new(3);
        let o = order.clone();
        ch.set_close_callback(Box::new(move |_| o.lock().unwrap().push("close")));
        let o = order.clone();
        ch.set_error_callback(Box::new(move |_| o.lock().unwrap().push("error")));
        let o = order.clone();
        ch.set_read_callback(Box::new(move |_, _| o.lock().unwrap().push("read")));
        let o = order.clone();
        ch.set_write_callback(Box::new(move |_| o.lock().unwrap().push("write")));

        ch.set_revents(libc::POLLERR as u32 | libc::POLLIN as u32 | libc::POLLOUT as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock().unwrap(), vec!["error", "read", "write"]);
    }

    #[test]
    fn tie_drop_suppresses_dispatch() {
        struct Owner;
        let mut ch = Channel::new(3);
        let owner: Arc<dyn Any + Send + Sync> = Arc::new(Owner);
        ch.tie(Arc::downgrade(&owner));
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        ch.set_read_callback(Box::new(move |_, _| *f.lock().unwrap() = true));
        ch.set_revents(libc::POLLIN as u32);
        drop(owner);
        ch.handle_event(Timestamp::now());
        assert!(!*fired.lock().unwrap());
    }
}
