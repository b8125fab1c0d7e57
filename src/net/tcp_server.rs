use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback, WriteCompleteCallback,
};
use crate::event_loop::LoopHandle;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::net::acceptor::Acceptor;
use crate::net::socket::Socket;
use crate::net::tcp_connection::TcpConnection;

const DEFAULT_LISTEN_BACKLOG: usize = 128;

/// Accepts inbound connections on one loop and distributes them round-robin across an
/// [`EventLoopThreadPool`]. `start()` is idempotent; everything else (`set_thread_num`,
/// the callback setters) must run before the first `start()`.
///
/// Mirrors the original's ownership split: the server's main loop only ever runs the
/// `Acceptor`; every accepted connection's I/O runs on whichever pool loop it was assigned to.
/// `self_handle` is the same `Arc::new_cyclic` idiom used by [`crate::net::connector::Connector`]
/// and [`TcpConnection`] — it lets the `new_connection_cb` and `close_cb` closures installed on
/// the acceptor/connections hand back an owned `Arc<TcpServer>` without the caller already
/// needing one.
pub struct TcpServer {
    self_handle: Weak<TcpServer>,
    loop_handle: LoopHandle,
    name: String,
    listen_addr: SocketAddr,
    acceptor: Mutex<Acceptor>,
    thread_pool: Mutex<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    listen_backlog: AtomicUsize,

    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<(HighWaterMarkCallback, usize)>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    pub fn new(loop_handle: LoopHandle, listen_addr: SocketAddr, name: impl Into<String>) -> Arc<TcpServer> {
        Self::with_reuse_port(loop_handle, listen_addr, name, false)
    }

    pub fn with_reuse_port(
        loop_handle: LoopHandle,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Arc<TcpServer> {
        let acceptor = Acceptor::new(loop_handle.clone(), listen_addr, reuse_port)
            .expect("failed to create listening socket");
        let thread_pool = EventLoopThreadPool::new(loop_handle.clone());
        let name = name.into();

        let server = Arc::new_cyclic(|weak| TcpServer {
            self_handle: weak.clone(),
            loop_handle,
            name,
            listen_addr,
            acceptor: Mutex::new(acceptor),
            thread_pool: Mutex::new(thread_pool),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            listen_backlog: AtomicUsize::new(DEFAULT_LISTEN_BACKLOG),
            connection_cb: Mutex::new(crate::callbacks::default_connection_cb()),
            message_cb: Mutex::new(crate::callbacks::default_message_cb()),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
        });

        let weak = server.self_handle.clone();
        server
            .acceptor
            .lock()
            .unwrap()
            .set_new_connection_callback(move |fd, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer);
                }
            });

        server
    }

    fn arc(&self) -> Arc<TcpServer> {
        self.self_handle.upgrade().expect("TcpServer outlives its own handle")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actual bound address. Differs from the address passed to [`TcpServer::new`] when
    /// that address requested port 0.
    pub fn listen_addr(&self) -> SocketAddr {
        self.acceptor
            .lock()
            .unwrap()
            .local_addr()
            .unwrap_or(self.listen_addr)
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Must be called before [`TcpServer::start`]. 0 keeps every connection on the server's own
    /// loop; N > 0 spins up N worker loops and distributes connections across them.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::Acquire), "set_thread_num after start");
        self.thread_pool
            .lock()
            .unwrap()
            .start(num_threads, self.thread_init_cb.lock().unwrap().clone());
    }

    /// Sets the backlog passed to `listen(2)`. Must be called before [`TcpServer::start`];
    /// default is 128.
    pub fn set_listen_backlog(&self, backlog: usize) {
        assert!(!self.started.load(Ordering::Acquire), "set_listen_backlog after start");
        self.listen_backlog.store(backlog, Ordering::Relaxed);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_cb.lock().unwrap() = Some(cb);
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
        *self.high_water_mark_cb.lock().unwrap() = Some((cb, threshold));
    }

    /// Starts listening. Idempotent — only the first call has an effect, matching the
    /// original's guard against re-entering `listen(2)`.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.arc();
        let backlog = self.listen_backlog.load(Ordering::Relaxed) as i32;
        self.loop_handle.run_in_loop(Box::new(move || {
            let mut acceptor = this.acceptor.lock().unwrap();
            if !acceptor.listening() {
                acceptor.listen(backlog);
            }
        }));
    }

    fn new_connection(&self, fd: RawFd, peer: SocketAddr) {
        self.loop_handle.assert_loop_thread();
        let io_loop = self.thread_pool.lock().unwrap().get_next_loop();

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer, id);

        // Borrow-without-owning: the fd still belongs to whoever accepted it until
        // `TcpConnection::new` takes it over below.
        let probe = unsafe { Socket::from_raw_fd(fd) };
        let local = probe.local_addr().map(|a| a.socket_addr()).unwrap_or(self.listen_addr);
        std::mem::forget(probe);

        #[cfg(feature = "log")]
        log::info!("TcpServer [{}]: new connection [{conn_name}] from {peer}", self.name);

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), fd, local, peer);
        conn.set_connection_callback(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(self.message_cb.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some((cb, threshold)) = self.high_water_mark_cb.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb, threshold);
        }

        let this = self.arc();
        conn.set_close_callback(Arc::new(move |conn| this.remove_connection(conn)));

        self.connections.lock().unwrap().insert(conn_name, conn.clone());
        io_loop.run_in_loop(Box::new(move || conn.connect_established()));
    }

    /// Installed as every connection's close callback. Always hops back to the server's own
    /// loop before touching the connection map, then hops to the connection's io loop to run
    /// its final teardown — mirroring the original's two-loop dance for cross-thread closes.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let this = self.arc();
        let conn = conn.clone();
        self.loop_handle.run_in_loop(Box::new(move || {
            this.connections.lock().unwrap().remove(conn.name());
            #[cfg(feature = "log")]
            log::info!("TcpServer [{}]: removed connection [{}]", this.name, conn.name());
            let io_loop = conn.loop_handle();
            io_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));
        }));
    }
}
