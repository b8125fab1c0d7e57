use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::buffer::{write_fd_nonblocking, Buffer};
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::net::socket::Socket;
use crate::time::Timestamp;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Per-connection state machine plus its input/output buffers.
///
/// Always lives behind `Arc<TcpConnection>`: the server/client's connection map holds one
/// strong reference, every task posted to its loop referencing it holds another, and the
/// Channel holds only the weak "tie" reference (see [`crate::channel::Channel::tie`]).
/// Mutable fields use `Mutex` rather than plain cells so the type remains `Send + Sync` and
/// `send()`/`shutdown()` etc. can be called from any thread, not just the io loop's.
/// `self_handle` lets `&self` methods hand an owned `Arc<TcpConnection>` to a posted closure or
/// a user callback without every caller needing to already hold one.
pub struct TcpConnection {
    self_handle: Weak<TcpConnection>,
    loop_handle: LoopHandle,
    name: String,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Mutex<State>,
    reading: AtomicBool,
    writing: AtomicBool,
    high_water_mark: AtomicUsize,
    input_buf: Mutex<Buffer>,
    output_buf: Mutex<Buffer>,
    context: Mutex<Option<Box<dyn Any + Send>>>,

    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub fn new(
        loop_handle: LoopHandle,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let conn = Arc::new_cyclic(|weak| TcpConnection {
            self_handle: weak.clone(),
            loop_handle: loop_handle.clone(),
            name,
            fd,
            local_addr,
            peer_addr,
            state: Mutex::new(State::Connecting),
            reading: AtomicBool::new(true),
            writing: AtomicBool::new(false),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buf: Mutex::new(Buffer::new()),
            output_buf: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
            connection_cb: Mutex::new(crate::callbacks::default_connection_cb()),
            message_cb: Mutex::new(crate::callbacks::default_message_cb()),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        });

        let weak: Weak<TcpConnection> = Arc::downgrade(&conn);
        let mut channel = Channel::new(fd);
        let tie: Weak<dyn Any + Send + Sync> = weak.clone();
        channel.tie(tie);

        let w = weak.clone();
        channel.set_read_callback(Box::new(move |ch, time| {
            if let Some(c) = w.upgrade() {
                c.handle_read(ch, time);
            }
        }));
        let w = weak.clone();
        channel.set_write_callback(Box::new(move |ch| {
            if let Some(c) = w.upgrade() {
                c.handle_write(ch);
            }
        }));
        let w = weak.clone();
        channel.set_close_callback(Box::new(move |ch| {
            if let Some(c) = w.upgrade() {
                c.handle_close(ch);
            }
        }));
        let w = weak.clone();
        channel.set_error_callback(Box::new(move |_ch| {
            if let Some(c) = w.upgrade() {
                c.handle_error();
            }
        }));

        loop_handle.register_channel(channel);

        #[cfg(feature = "log")]
        log::debug!("TcpConnection [{}] created, fd {}", conn.name, fd);

        conn
    }

    fn arc(&self) -> Arc<TcpConnection> {
        self.self_handle.upgrade().expect("TcpConnection outlives its own handle")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        *self.state.lock().unwrap() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        *self.state.lock().unwrap() == State::Disconnected
    }

    pub fn set_context(&self, ctx: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(ctx);
    }

    pub fn with_context<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        f(self.context.lock().unwrap().as_deref())
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = cb;
    }
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = cb;
    }
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, threshold: usize) {
        *self.high_water_mark_cb.lock().unwrap() = Some(cb);
        self.high_water_mark.store(threshold, Ordering::Relaxed);
    }
    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        // Socket is a thin fd wrapper; wrap-without-owning is safe here since we never let it
        // run its Drop (the connection, not this temporary, owns the fd).
        let socket = unsafe { Socket::from_raw_fd(self.fd) };
        let result = socket.set_tcp_no_delay(on);
        std::mem::forget(socket);
        result
    }

    pub fn start_read(&self) {
        let this = self.arc();
        self.loop_handle.run_in_loop(Box::new(move || {
            if !this.reading.swap(true, Ordering::AcqRel) {
                this.loop_handle.with_channel_mut(this.fd, |ch| ch.enable_reading());
                this.loop_handle.update_channel(this.fd);
            }
        }));
    }

    pub fn stop_read(&self) {
        let this = self.arc();
        self.loop_handle.run_in_loop(Box::new(move || {
            if this.reading.swap(false, Ordering::AcqRel) {
                this.loop_handle.with_channel_mut(this.fd, |ch| ch.disable_reading());
                this.loop_handle.update_channel(this.fd);
            }
        }));
    }

    /// Invoked once by the owning server/client after the fd has been installed, transitioning
    /// Connecting -> Connected and enabling reads.
    pub fn connect_established(&self) {
        self.loop_handle.assert_loop_thread();
        {
            let mut state = self.state.lock().unwrap();
            assert_eq!(*state, State::Connecting);
            *state = State::Connected;
        }
        self.loop_handle.with_channel_mut(self.fd, |ch| ch.enable_reading());
        self.loop_handle.update_channel(self.fd);
        (self.connection_cb.lock().unwrap())(&self.arc());
    }

    /// Invoked once the connection has reached Disconnected and the final Channel removal may
    /// proceed.
    pub fn connect_destroyed(&self) {
        self.loop_handle.assert_loop_thread();
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Connected {
                *state = State::Disconnected;
                self.loop_handle.with_channel_mut(self.fd, |ch| ch.disable_all());
                self.writing.store(false, Ordering::Release);
                (self.connection_cb.lock().unwrap())(&self.arc());
            }
        }
        self.loop_handle.remove_channel(self.fd);
    }

    pub fn send(&self, data: &[u8]) {
        if *self.state.lock().unwrap() != State::Connected {
            return;
        }
        if self.loop_handle.is_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = self.arc();
            self.loop_handle.queue_in_loop(Box::new(move || this.send_in_loop(&owned)));
        }
    }

    /// May run mid-dispatch of this very connection's own channel (`message_cb` calling
    /// `send()` back out). In that case the registry doesn't hold `self.fd` (the dispatching
    /// channel has been pulled out for the duration of its own `handle_event`), so the
    /// `writing` cache — not a registry lookup — is this connection's source of truth for
    /// whether POLLOUT is currently enabled. When the registry lookup below misses for that
    /// reason, `handle_read`'s call to `sync_writing_interest` reconciles the live `Channel` it
    /// already holds once `message_cb` returns.
    fn send_in_loop(&self, data: &[u8]) {
        self.loop_handle.assert_loop_thread();
        if *self.state.lock().unwrap() == State::Disconnected {
            #[cfg(feature = "log")]
            log::warn!("TcpConnection [{}]: give up writing, already disconnected", self.name);
            return;
        }

        let mut remaining = data.len();
        let mut offset = 0usize;
        let already_writing = self.writing.load(Ordering::Acquire);

        if !already_writing && self.output_buf.lock().unwrap().readable_bytes() == 0 {
            match write_fd_nonblocking(self.fd, data) {
                Ok(n) => {
                    offset = n;
                    remaining -= n;
                    if remaining == 0 {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            cb(&self.arc());
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) => {
                    #[cfg(feature = "log")]
                    log::error!("TcpConnection [{}]: write faulted: {e}", self.name);
                    return;
                }
                Err(e) => {
                    #[cfg(feature = "log")]
                    log::error!("TcpConnection [{}]: write(2) failed: {e}", self.name);
                    return;
                }
            }
        }

        if remaining > 0 {
            let mut out = self.output_buf.lock().unwrap();
            let old_len = out.readable_bytes();
            out.append(&data[offset..]);
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            let crossed = old_len < high_water_mark && old_len + remaining >= high_water_mark;
            let new_len = out.readable_bytes();
            drop(out);
            if crossed {
                if let Some(cb) = self.high_water_mark_cb.lock().unwrap().clone() {
                    cb(&self.arc(), new_len);
                }
            }
            if !self.writing.swap(true, Ordering::AcqRel) {
                let updated = self
                    .loop_handle
                    .with_channel_mut(self.fd, |ch| ch.enable_writing())
                    .is_some();
                if updated {
                    self.loop_handle.update_channel(self.fd);
                }
            }
        }
    }

    fn handle_read(&self, ch: &mut Channel, receive_time: Timestamp) {
        let mut input = self.input_buf.lock().unwrap();
        match input.read_fd(self.fd) {
            Ok(0) => {
                drop(input);
                self.handle_close(ch);
            }
            Ok(_n) => {
                let cb = self.message_cb.lock().unwrap().clone();
                cb(&self.arc(), &mut input, receive_time);
                drop(input);
                // `message_cb` may have called `send()` back out; reconcile the live channel
                // with whatever `send_in_loop` was forced to track in `self.writing` alone.
                self.sync_writing_interest(ch);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                #[cfg(feature = "log")]
                log::error!("TcpConnection [{}]: read_fd failed: {e}", self.name);
                self.handle_error_with(e);
            }
        }
    }

    fn sync_writing_interest(&self, ch: &mut Channel) {
        let want_write = self.writing.load(Ordering::Acquire);
        if want_write != ch.is_writing() {
            if want_write {
                ch.enable_writing();
            } else {
                ch.disable_writing();
            }
        }
    }

    fn handle_write(&self, ch: &mut Channel) {
        if !ch.is_writing() {
            #[cfg(feature = "log")]
            log::trace!("TcpConnection [{}]: no more writing", self.name);
            return;
        }

        let mut out = self.output_buf.lock().unwrap();
        match write_fd_nonblocking(self.fd, out.peek()) {
            Ok(n) => {
                out.retrieve(n);
                if out.readable_bytes() == 0 {
                    ch.disable_writing();
                    self.writing.store(false, Ordering::Release);
                    drop(out);
                    if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                        cb(&self.arc());
                    }
                    if *self.state.lock().unwrap() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                #[cfg(feature = "log")]
                log::error!("TcpConnection [{}]: handle_write failed: {e}", self.name);
            }
        }
    }

    fn handle_close(&self, ch: &mut Channel) {
        self.loop_handle.assert_loop_thread();
        {
            let mut state = self.state.lock().unwrap();
            assert!(matches!(*state, State::Connected | State::Disconnecting));
            *state = State::Disconnected;
        }
        ch.disable_all();
        self.writing.store(false, Ordering::Release);

        #[cfg(feature = "log")]
        log::info!("TcpConnection [{}]: closed", self.name);

        let this = self.arc();
        (self.connection_cb.lock().unwrap())(&this);
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(&this);
        }
    }

    fn handle_error(&self) {
        let err = unsafe { Socket::from_raw_fd(self.fd) };
        let errno = err.socket_error().unwrap_or(-1);
        std::mem::forget(err);
        #[cfg(feature = "log")]
        log::error!("TcpConnection [{}]: SO_ERROR = {errno}", self.name);
    }

    fn handle_error_with(&self, e: io::Error) {
        #[cfg(feature = "log")]
        log::error!("TcpConnection [{}]: {e}", self.name);
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Connected {
            *state = State::Disconnecting;
            drop(state);
            let this = self.arc();
            self.loop_handle.run_in_loop(Box::new(move || this.shutdown_in_loop()));
        }
    }

    fn shutdown_in_loop(&self) {
        if !self.writing.load(Ordering::Acquire) {
            let socket = unsafe { Socket::from_raw_fd(self.fd) };
            let _ = socket.shutdown_write();
            std::mem::forget(socket);
        }
    }

    pub fn force_close(&self) {
        let state = *self.state.lock().unwrap();
        if matches!(state, State::Connected | State::Disconnecting) {
            let this = self.arc();
            self.loop_handle.queue_in_loop(Box::new(move || this.force_close_in_loop()));
        }
    }

    /// Not mid-dispatch of our own channel here (`force_close` lands via `queue_in_loop`, run
    /// from `do_pending_functors` between poll iterations), so the registry still holds it.
    fn force_close_in_loop(&self) {
        let state = *self.state.lock().unwrap();
        if matches!(state, State::Connected | State::Disconnecting) {
            let handled = self
                .loop_handle
                .with_channel_mut(self.fd, |ch| self.handle_close(ch))
                .is_some();
            if !handled {
                #[cfg(feature = "log")]
                log::warn!("TcpConnection [{}]: force_close found no channel to close", self.name);
            }
        }
    }

    /// Schedules `force_close` after `delay`, keyed off a weak reference so a connection that
    /// was already destroyed by the time the timer fires is a silent no-op.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let weak = self.self_handle.clone();
        self.loop_handle.run_after(
            delay,
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            }),
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
