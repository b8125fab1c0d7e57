use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::macros::syscall;
use crate::poller::{self, Poller};
use crate::time::Timestamp;
use crate::timer::{TimerCallback, TimerId};
use crate::timer_queue::TimerQueue;

/// A unit of cross-thread work. Closures are self-contained (they capture whatever
/// [`LoopHandle`]/`Arc` state they need), mirroring the original's plain `std::function<void()>`
/// functor rather than threading an explicit loop reference through every call site.
pub type TaskFn = Box<dyn FnOnce() + Send>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_EXISTS_ON_THIS_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

struct Shared {
    thread_id: ThreadId,
    wakeup_fd: RawFd,
    timer_fd: RawFd,
    quit: AtomicBool,
    looping: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    pending_tasks: Mutex<Vec<TaskFn>>,
    channels: Mutex<HashMap<RawFd, Channel>>,
    poller: Mutex<Box<dyn Poller>>,
    timer_queue: Mutex<TimerQueue>,
}

/// A cheaply-cloneable, `Send + Sync` reference to an [`EventLoop`]'s shared state.
///
/// Every mutation a `LoopHandle` performs on the channel registry or poller is guarded by a
/// `Mutex`; the lock is never contended in practice because the thread-affinity invariant
/// (enforced by `debug_assert!` where it matters) means only the owning thread ever calls
/// these methods with intent to actually touch OS state — other threads only ever reach here
/// via `run_in_loop`/`queue_in_loop`.
#[derive(Clone)]
pub struct LoopHandle(Arc<Shared>);

impl LoopHandle {
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.0.thread_id
    }

    pub fn assert_loop_thread(&self) {
        let current = thread::current().id();
        assert!(
            current == self.0.thread_id,
            "operation attempted off the owning EventLoop's thread (loop: {:?}, current: {:?})",
            self.0.thread_id,
            current
        );
    }

    /// Run `task` now if called from the loop thread, else hand it to [`LoopHandle::queue_in_loop`].
    pub fn run_in_loop(&self, task: TaskFn) {
        if self.is_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` for the loop thread to run at the top of its next iteration. Wakes the
    /// loop unless the caller already is the loop thread AND the loop isn't mid-drain of its
    /// own pending-task batch (in which case it will see this new entry before returning to
    /// `poll`, so an extra wakeup write would be wasted).
    pub fn queue_in_loop(&self, task: TaskFn) {
        let should_wake = {
            let mut tasks = self.0.pending_tasks.lock().unwrap();
            tasks.push(task);
            !self.is_loop_thread() || self.0.calling_pending.load(Ordering::Acquire)
        };
        if should_wake {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        let one: u64 = 1;
        let _ = syscall!(write(
            self.0.wakeup_fd,
            &one as *const u64 as *const libc::c_void,
            8
        ));
    }

    pub fn quit(&self) {
        self.0.quit.store(true, Ordering::Release);
        if !self.is_loop_thread() {
            self.wakeup();
        }
    }

    pub fn iteration(&self) -> u64 {
        self.0.iteration.load(Ordering::Relaxed)
    }

    /// Insert a freshly constructed channel into the registry. The caller is expected to set
    /// its desired interest and call [`LoopHandle::update_channel`] next.
    pub fn register_channel(&self, channel: Channel) {
        self.assert_loop_thread();
        let fd = channel.fd();
        self.0.channels.lock().unwrap().insert(fd, channel);
    }

    pub fn with_channel_mut<R>(&self, fd: RawFd, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let mut channels = self.0.channels.lock().unwrap();
        channels.get_mut(&fd).map(f)
    }

    /// Push `fd`'s current interest mask to the OS poller.
    pub fn update_channel(&self, fd: RawFd) {
        self.assert_loop_thread();
        let mut channels = self.0.channels.lock().unwrap();
        if let Some(ch) = channels.get_mut(&fd) {
            let mut poller = self.0.poller.lock().unwrap();
            poller
                .update_channel(ch)
                .expect("poller update_channel failed");
        }
    }

    /// Remove `fd` from both the channel registry and the OS poller. Precondition: `fd`'s
    /// channel has no active interest (`Channel::is_none_event`).
    pub fn remove_channel(&self, fd: RawFd) {
        self.assert_loop_thread();
        let mut channels = self.0.channels.lock().unwrap();
        if let Some(mut ch) = channels.remove(&fd) {
            let mut poller = self.0.poller.lock().unwrap();
            let _ = poller.remove_channel(&mut ch);
        }
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.0.channels.lock().unwrap().contains_key(&fd)
    }

    pub fn run_at(&self, when: Instant, callback: TimerCallback) -> TimerId {
        self.schedule(callback, when, Duration::ZERO)
    }

    pub fn run_after(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.schedule(callback, Instant::now() + delay, Duration::ZERO)
    }

    pub fn run_every(&self, interval: Duration, callback: TimerCallback) -> TimerId {
        self.schedule(callback, Instant::now() + interval, interval)
    }

    fn schedule(&self, callback: TimerCallback, when: Instant, interval: Duration) -> TimerId {
        let handle = self.clone();
        let (id, earliest_changed) = {
            let mut queue = self.0.timer_queue.lock().unwrap();
            let before = queue.next_expiration();
            let id = queue.add_timer(callback, when, interval);
            let after = queue.next_expiration();
            (id, before != after)
        };
        if earliest_changed {
            handle.rearm_timerfd();
        }
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.0.timer_queue.lock().unwrap().cancel(id);
    }

    fn rearm_timerfd(&self) {
        let next = self.0.timer_queue.lock().unwrap().next_expiration();
        arm_timerfd(self.0.timer_fd, next);
    }

    fn handle_timer_expired(&self) {
        drain_fd(self.0.timer_fd);
        let now = Instant::now();
        self.0.timer_queue.lock().unwrap().handle_expired(now);
        self.rearm_timerfd();
    }

    fn drain_wakeup(&self) {
        drain_fd(self.0.wakeup_fd);
    }
}

/// The reactor itself: owns nothing Arc-shared beyond its [`LoopHandle`]; `run` is only ever
/// called by the thread that constructed it.
pub struct EventLoop {
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        LOOP_EXISTS_ON_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "an EventLoop already exists on this thread"
            );
            flag.set(true);
        });

        crate::sigpipe::ignore_once();

        let poller = poller::new_default_poller()?;
        let timer_fd = create_timerfd()?;
        let wakeup_fd = create_eventfd()?;

        let shared = Arc::new(Shared {
            thread_id: thread::current().id(),
            wakeup_fd,
            timer_fd,
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            pending_tasks: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            poller: Mutex::new(poller),
            timer_queue: Mutex::new(TimerQueue::new()),
        });

        {
            let mut p = shared.poller.lock().unwrap();
            let mut timer_ch = Channel::new(timer_fd);
            timer_ch.enable_reading();
            p.update_channel(&mut timer_ch)?;
            let mut wake_ch = Channel::new(wakeup_fd);
            wake_ch.enable_reading();
            p.update_channel(&mut wake_ch)?;
        }

        #[cfg(feature = "log")]
        log::debug!("EventLoop created for thread {:?}", thread::current().id());

        Ok(EventLoop {
            handle: LoopHandle(shared),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Blocks until [`LoopHandle::quit`] is called (from any thread). Must be called from the
    /// thread that constructed this loop.
    pub fn run(&mut self) {
        self.handle.assert_loop_thread();
        assert!(
            !self.handle.0.looping.swap(true, Ordering::AcqRel),
            "EventLoop::run called re-entrantly"
        );
        self.handle.0.quit.store(false, Ordering::Release);

        #[cfg(feature = "log")]
        log::debug!("EventLoop starting");

        let mut active = Vec::new();
        while !self.handle.0.quit.load(Ordering::Acquire) {
            active.clear();
            let now = {
                let mut poller = self.handle.0.poller.lock().unwrap();
                match poller.poll(POLL_TIMEOUT, &mut active) {
                    Ok(t) => t,
                    Err(e) => {
                        #[cfg(feature = "log")]
                        log::error!("poller error: {e}");
                        Timestamp::now()
                    }
                }
            };
            self.handle.0.iteration.fetch_add(1, Ordering::Relaxed);

            for &(fd, revents) in &active {
                if fd == self.handle.0.timer_fd {
                    self.handle.handle_timer_expired();
                    continue;
                }
                if fd == self.handle.0.wakeup_fd {
                    self.handle.drain_wakeup();
                    continue;
                }
                self.dispatch_channel(fd, revents, now);
            }

            self.do_pending_functors();
        }

        self.handle.0.looping.store(false, Ordering::Release);
        #[cfg(feature = "log")]
        log::debug!("EventLoop stopped");
    }

    /// The channel being dispatched is pulled out of the registry for the duration of
    /// `handle_event` so a handler touching some *other* fd's channel (registering a new
    /// connection, tearing one down) never re-enters the registry's mutex. Two things can have
    /// happened to `fd` by the time `handle_event` returns, and both are handled explicitly
    /// rather than blindly reinserting the channel we pulled out:
    /// - a handler handed `fd` off to a brand-new channel (e.g. `Connector` completing a
    ///   connect and a `TcpConnection` registering over the same fd) — the registry already
    ///   holds the replacement, so ours must be discarded, not reinserted over it;
    /// - a handler marked our channel [`Channel::dispose`]d (the connect attempt failed and the
    ///   fd was closed) — it must be deregistered from the poller, not reinserted at all.
    fn dispatch_channel(&mut self, fd: RawFd, revents: u32, now: Timestamp) {
        let taken = self.handle.0.channels.lock().unwrap().remove(&fd);
        if let Some(mut channel) = taken {
            let before = channel.interest_mask();
            channel.set_revents(revents);
            channel.handle_event(now);

            let mut channels = self.handle.0.channels.lock().unwrap();
            if channels.contains_key(&fd) {
                // Handed off mid-dispatch; the replacement channel already owns this fd.
            } else if channel.is_disposed() {
                drop(channels);
                let mut poller = self.handle.0.poller.lock().unwrap();
                let _ = poller.remove_channel(&mut channel);
            } else {
                if before != channel.interest_mask() {
                    let mut poller = self.handle.0.poller.lock().unwrap();
                    let _ = poller.update_channel(&mut channel);
                }
                channels.insert(fd, channel);
            }
        }
    }

    fn do_pending_functors(&mut self) {
        self.handle.0.calling_pending.store(true, Ordering::Release);
        let tasks: Vec<TaskFn> = std::mem::take(&mut *self.handle.0.pending_tasks.lock().unwrap());
        for task in tasks {
            task();
        }
        self.handle.0.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.handle.0.wakeup_fd);
            libc::close(self.handle.0.timer_fd);
        }
        LOOP_EXISTS_ON_THIS_THREAD.with(|flag| flag.set(false));
    }
}

fn create_eventfd() -> io::Result<RawFd> {
    syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
}

fn create_timerfd() -> io::Result<RawFd> {
    syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
    ))
}

fn arm_timerfd(timer_fd: RawFd, next: Option<Instant>) {
    let spec = match next {
        Some(when) => {
            let now = Instant::now();
            let delay = when.saturating_duration_since(now).max(Duration::from_micros(1));
            libc::itimerspec {
                it_interval: libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                },
                it_value: libc::timespec {
                    tv_sec: delay.as_secs() as libc::time_t,
                    tv_nsec: delay.subsec_nanos() as libc::c_long,
                },
            }
        }
        None => libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        },
    };
    unsafe {
        libc::timerfd_settime(timer_fd, 0, &spec, std::ptr::null_mut());
    }
}

fn drain_fd(fd: RawFd) {
    let mut buf = [0u8; 8];
    unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn run_and_quit_from_same_thread() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        handle.run_in_loop(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        handle.quit();
        event_loop.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_from_another_thread_wakes_loop() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let joiner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.quit();
        });
        event_loop.run();
        joiner.join().unwrap();
    }

    #[test]
    fn timer_fires_and_loop_quits_after() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let h = handle.clone();
        handle.run_after(
            Duration::from_millis(20),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
                h.quit();
            }),
        );
        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn second_loop_on_same_thread_panics() {
        let _a = EventLoop::new().unwrap();
        let _b = EventLoop::new().unwrap();
    }
}
