use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::callbacks::{ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback};
use crate::event_loop::LoopHandle;
use crate::net::connector::Connector;
use crate::net::socket::Socket;
use crate::net::tcp_connection::TcpConnection;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// A single-connection counterpart to [`crate::net::tcp_server::TcpServer`]: owns exactly one
/// [`Connector`] and, once connected, exactly one [`TcpConnection`].
///
/// `connection()` may legitimately be called from any thread (the original exposes it that
/// way), so the current connection is kept behind a `Mutex` rather than assumed loop-thread-only
/// like most of this crate's state.
pub struct TcpClient {
    self_handle: Weak<TcpClient>,
    loop_handle: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicUsize,
    connection: Mutex<Option<Arc<TcpConnection>>>,

    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<(HighWaterMarkCallback, usize)>>,
}

impl TcpClient {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr, name: Option<String>) -> Arc<TcpClient> {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.unwrap_or_else(|| format!("TcpClient{id}"));
        let connector = Connector::new(loop_handle.clone(), server_addr);

        let client = Arc::new_cyclic(|weak| TcpClient {
            self_handle: weak.clone(),
            loop_handle,
            connector: connector.clone(),
            name,
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicUsize::new(1),
            connection: Mutex::new(None),
            connection_cb: Mutex::new(crate::callbacks::default_connection_cb()),
            message_cb: Mutex::new(crate::callbacks::default_message_cb()),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
        });

        let weak = client.self_handle.clone();
        connector.set_new_connection_callback(move |fd, peer| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(fd, peer);
            }
        });

        client
    }

    fn arc(&self) -> Arc<TcpClient> {
        self.self_handle.upgrade().expect("TcpClient outlives its own handle")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Once enabled, a connection loss is followed by reconnect attempts at the connector's
    /// backoff schedule rather than simply giving up.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
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

    pub fn connect(&self) {
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Stops reconnecting; any connection already established keeps running until the peer or
    /// the user calls [`TcpClient::stop`]/drops the client.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(&self, fd: RawFd, peer: SocketAddr) {
        self.loop_handle.assert_loop_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer, id);

        let probe = unsafe { Socket::from_raw_fd(fd) };
        let local = probe
            .local_addr()
            .map(|a| a.socket_addr())
            .unwrap_or_else(|_| peer);
        std::mem::forget(probe);

        #[cfg(feature = "log")]
        log::info!("TcpClient [{}]: connected as [{conn_name}] to {peer}", self.name);

        let conn = TcpConnection::new(self.loop_handle.clone(), conn_name, fd, local, peer);
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

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        self.loop_handle.assert_loop_thread();
        {
            let mut slot = self.connection.lock().unwrap();
            if slot.as_ref().map(Arc::as_ptr) == Some(Arc::as_ptr(conn)) {
                *slot = None;
            }
        }
        let conn = conn.clone();
        self.loop_handle.queue_in_loop(Box::new(move || conn.connect_destroyed()));

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            #[cfg(feature = "log")]
            log::info!("TcpClient [{}]: reconnecting", self.name);
            self.connector.restart();
        }
    }
}
