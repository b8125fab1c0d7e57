use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::net::socket::Socket;

type NewConnectionCallback = Box<dyn Fn(RawFd, SocketAddr) + Send>;

struct Inner {
    listen_socket: Socket,
    idle_fd: RawFd,
    new_connection_cb: Option<NewConnectionCallback>,
}

impl Inner {
    /// Drains every pending connection on the listening socket, handing each off to
    /// `new_connection_cb`. On `EMFILE`/`ENFILE`, releases the idle fd to accept (and
    /// immediately drop) exactly one pending connection, preventing a level-triggered poller
    /// from spinning hot on a listening socket it can no longer service.
    fn handle_read(&mut self) {
        loop {
            match self.listen_socket.accept() {
                Ok(Some((socket, peer))) => {
                    let fd = socket.into_raw_fd();
                    #[cfg(feature = "log")]
                    log::info!("Acceptor accepted connection from {peer}");
                    match &self.new_connection_cb {
                        Some(cb) => cb(fd, peer),
                        None => unsafe {
                            libc::close(fd);
                        },
                    }
                }
                Ok(None) => break,
                Err(e) if is_fd_exhaustion(&e) => {
                    if self.idle_fd >= 0 {
                        unsafe {
                            libc::close(self.idle_fd);
                        }
                    }
                    if let Ok(Some(_)) = self.listen_socket.accept() {
                        #[cfg(feature = "log")]
                        log::warn!("fd exhaustion: dropped one pending connection");
                    }
                    self.idle_fd = open_dev_null().unwrap_or(-1);
                    break;
                }
                Err(e) => {
                    #[cfg(feature = "log")]
                    log::error!("accept4 failed: {e}");
                    break;
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.idle_fd >= 0 {
            unsafe {
                libc::close(self.idle_fd);
            }
        }
    }
}

/// Listening socket wrapped as a [`Channel`]. Holds an idle fd on `/dev/null` purely as a
/// reserve to release under `EMFILE`/`ENFILE`.
///
/// The mutable accept-loop state lives behind `Arc<Mutex<Inner>>` rather than directly on
/// `Acceptor`, because the installed read callback must reach it without re-entering the
/// loop's channel registry (the registry is what dispatch temporarily removed this Channel
/// from); the mutex is never contended since only the owning loop thread ever locks it.
pub struct Acceptor {
    loop_handle: LoopHandle,
    fd: RawFd,
    listening: bool,
    inner: Arc<Mutex<Inner>>,
}

impl Acceptor {
    pub fn new(loop_handle: LoopHandle, addr: SocketAddr, reuse_port: bool) -> io::Result<Acceptor> {
        let listen_socket = Socket::new_tcp(&addr)?;
        listen_socket.set_reuse_addr(true)?;
        if reuse_port {
            listen_socket.set_reuse_port(true)?;
        }
        listen_socket.bind(&addr)?;
        let idle_fd = open_dev_null()?;
        let fd = listen_socket.fd();

        let inner = Arc::new(Mutex::new(Inner {
            listen_socket,
            idle_fd,
            new_connection_cb: None,
        }));

        let for_read = inner.clone();
        let mut channel = Channel::new(fd);
        channel.set_read_callback(Box::new(move |_ch, _time| {
            for_read.lock().unwrap().handle_read();
        }));
        loop_handle.register_channel(channel);

        #[cfg(feature = "log")]
        log::debug!("Acceptor created on fd {fd}");

        Ok(Acceptor {
            loop_handle,
            fd,
            listening: false,
            inner,
        })
    }

    pub fn set_new_connection_callback(&mut self, cb: impl Fn(RawFd, SocketAddr) + Send + 'static) {
        self.inner.lock().unwrap().new_connection_cb = Some(Box::new(cb));
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// The actual bound address, which may differ from the address passed to `new` when that
    /// address used port 0 (ask the OS to pick one).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .lock()
            .unwrap()
            .listen_socket
            .local_addr()
            .map(|a| a.socket_addr())
    }

    /// Must run on the owning loop thread.
    pub fn listen(&mut self, backlog: i32) {
        self.loop_handle.assert_loop_thread();
        self.listening = true;
        self.inner
            .lock()
            .unwrap()
            .listen_socket
            .listen(backlog)
            .expect("listen(2) failed");
        self.loop_handle
            .with_channel_mut(self.fd, |ch| ch.enable_reading());
        self.loop_handle.update_channel(self.fd);
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn open_dev_null() -> io::Result<RawFd> {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.loop_handle.with_channel_mut(self.fd, |ch| ch.disable_all());
        self.loop_handle.update_channel(self.fd);
        self.loop_handle.remove_channel(self.fd);
        unsafe {
            libc::close(self.fd);
        }
    }
}
