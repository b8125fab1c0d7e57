use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::net::socket::Socket;

const MAX_RETRY_DELAY_MS: u64 = 30_000;
const INIT_RETRY_DELAY_MS: u64 = 500;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

type NewConnectionCallback = Arc<dyn Fn(RawFd, SocketAddr) + Send + Sync>;

/// Non-blocking `connect(2)` with errno classification and exponential backoff, capped at
/// [`MAX_RETRY_DELAY_MS`]. A successful connect hands the fd off to `new_connection_cb` and
/// detaches its own channel — ownership of the fd moves to whatever wraps it next
/// (`TcpConnection`).
///
/// `self_handle` lets any `&self` method obtain an owned `Arc<Connector>` to hand to a posted
/// closure, without requiring every caller to already be holding one.
pub struct Connector {
    self_handle: Weak<Connector>,
    loop_handle: LoopHandle,
    server_addr: SocketAddr,
    connect_requested: AtomicBool,
    state: Mutex<State>,
    retry_delay_ms: AtomicU64,
    fd: Mutex<Option<RawFd>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            self_handle: weak.clone(),
            loop_handle,
            server_addr,
            connect_requested: AtomicBool::new(false),
            state: Mutex::new(State::Disconnected),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            fd: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Connector> {
        self.self_handle.upgrade().expect("Connector outlives its own handle")
    }

    pub fn set_new_connection_callback(&self, cb: impl Fn(RawFd, SocketAddr) + Send + Sync + 'static) {
        *self.new_connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// The backoff delay that will be used for the *next* scheduled retry (doubles each time
    /// `retry` runs, capped at [`MAX_RETRY_DELAY_MS`]). Exposed for tests that assert on the
    /// backoff schedule; not otherwise load-bearing for callers.
    pub fn current_retry_delay_ms(&self) -> u64 {
        self.retry_delay_ms.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        self.connect_requested.store(true, Ordering::Release);
        let this = self.arc();
        self.loop_handle.run_in_loop(Box::new(move || this.start_in_loop()));
    }

    /// Resets the backoff delay to its initial value before starting again.
    pub fn restart(&self) {
        *self.state.lock().unwrap() = State::Disconnected;
        self.retry_delay_ms.store(INIT_RETRY_DELAY_MS, Ordering::Relaxed);
        self.connect_requested.store(true, Ordering::Release);
        self.start_in_loop();
    }

    pub fn stop(&self) {
        self.connect_requested.store(false, Ordering::Release);
        let this = self.arc();
        self.loop_handle.run_in_loop(Box::new(move || this.stop_in_loop()));
    }

    fn start_in_loop(&self) {
        self.loop_handle.assert_loop_thread();
        if !self.connect_requested.load(Ordering::Acquire) {
            return;
        }
        let socket = match Socket::new_tcp(&self.server_addr) {
            Ok(s) => s,
            Err(e) => {
                #[cfg(feature = "log")]
                log::error!("Connector: failed to open socket: {e}");
                return;
            }
        };
        match socket.connect(&self.server_addr) {
            Ok(()) => self.connecting(socket.into_raw_fd()),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(socket.into_raw_fd())
                }
                Some(libc::EAGAIN) | Some(libc::EADDRINUSE) | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => self.retry(socket.into_raw_fd()),
                _ => {
                    #[cfg(feature = "log")]
                    log::error!("Connector: connect(2) failed fatally: {e}");
                }
            },
        }
    }

    fn connecting(&self, fd: RawFd) {
        *self.state.lock().unwrap() = State::Connecting;
        *self.fd.lock().unwrap() = Some(fd);

        let mut channel = Channel::new(fd);
        let this_write = self.arc();
        channel.set_write_callback(Box::new(move |ch| this_write.handle_write(ch)));
        let this_err = self.arc();
        channel.set_error_callback(Box::new(move |_ch| this_err.handle_error()));
        channel.enable_writing();
        self.loop_handle.register_channel(channel);
        self.loop_handle.update_channel(fd);
    }

    fn remove_and_reset_channel(&self) -> Option<RawFd> {
        let fd = self.fd.lock().unwrap().take()?;
        self.loop_handle.with_channel_mut(fd, |ch| ch.disable_all());
        self.loop_handle.update_channel(fd);
        self.loop_handle.remove_channel(fd);
        Some(fd)
    }

    /// Runs mid-dispatch of this connector's own channel, so the registry doesn't hold `self.fd`
    /// for the duration — `ch` (handed to us directly by `Channel::handle_event`) is used to
    /// disown the channel in place instead of going through `remove_and_reset_channel`. Disposal
    /// defers the actual `Poller::remove_channel` call to `EventLoop::dispatch_channel`, which
    /// also detects and skips reinsertion when `new_connection_cb` below has already registered
    /// a fresh channel for the same fd (the `TcpConnection` handoff case).
    fn handle_write(&self, ch: &mut Channel) {
        if *self.state.lock().unwrap() != State::Connecting {
            return;
        }
        let fd = match self.fd.lock().unwrap().take() {
            Some(fd) => fd,
            None => return,
        };
        ch.disable_all();
        ch.dispose();

        let socket = unsafe { Socket::from_raw_fd(fd) };
        let err = socket.socket_error().unwrap_or(-1);
        let self_connect = socket
            .local_addr()
            .and_then(|l| socket.peer_addr().map(|p| l.socket_addr() == p.socket_addr()))
            .unwrap_or(false);

        if err != 0 || self_connect {
            if self_connect {
                #[cfg(feature = "log")]
                log::warn!("Connector: self-connect detected, retrying");
            }
            self.retry(socket.into_raw_fd());
            return;
        }

        *self.state.lock().unwrap() = State::Connected;
        if self.connect_requested.load(Ordering::Acquire) {
            let peer = socket.peer_addr().map(|a| a.socket_addr()).unwrap_or(self.server_addr);
            let fd = socket.into_raw_fd();
            if let Some(cb) = self.new_connection_cb.lock().unwrap().clone() {
                cb(fd, peer);
            }
        }
    }

    fn handle_error(&self) {
        #[cfg(feature = "log")]
        log::error!("Connector: error event on connecting socket (fd {:?})", *self.fd.lock().unwrap());
    }

    fn retry(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
        *self.state.lock().unwrap() = State::Disconnected;
        if self.connect_requested.load(Ordering::Acquire) {
            let delay = self.retry_delay_ms.load(Ordering::Relaxed);
            #[cfg(feature = "log")]
            log::info!("Connector: retrying in {delay}ms");
            let this = self.arc();
            self.loop_handle
                .run_after(Duration::from_millis(delay), Box::new(move || this.start_in_loop()));
            self.retry_delay_ms
                .store((delay * 2).min(MAX_RETRY_DELAY_MS), Ordering::Relaxed);
        }
    }

    fn stop_in_loop(&self) {
        if *self.state.lock().unwrap() == State::Connecting {
            if let Some(fd) = self.remove_and_reset_channel() {
                self.retry(fd);
            }
        }
    }
}
