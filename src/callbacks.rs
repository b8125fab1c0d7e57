use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::net::tcp_connection::TcpConnection;
use crate::time::Timestamp;

/// Fired when a connection is established and again when it is closed; distinguish the two
/// with `conn.connected()`.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired whenever bytes arrive. The user drains `input` via its `retrieve*` methods.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired once the output buffer has fully drained after being non-empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired once, on the upward crossing of the configured threshold.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal: installed by TcpServer/TcpClient to learn when a connection has reached
/// Disconnected and should be reaped from their bookkeeping.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Installed by TcpServer/TcpClient on each `EventLoopThread` they spin up.
pub type ThreadInitCallback = Arc<dyn Fn(&crate::event_loop::LoopHandle) + Send + Sync>;

/// Installed by Acceptor/Connector: a freshly accepted or connected fd plus its peer address.
pub type NewConnectionCallback = Arc<dyn Fn(RawFd, SocketAddr) + Send + Sync>;

pub(crate) fn default_connection_cb() -> ConnectionCallback {
    Arc::new(|conn| {
        #[cfg(feature = "log")]
        log::debug!(
            "{} -> {}",
            conn.name(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    })
}

pub(crate) fn default_message_cb() -> MessageCallback {
    Arc::new(|_conn, buf, _time| {
        buf.retrieve_all();
    })
}

