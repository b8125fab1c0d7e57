//! A multi-threaded, one-loop-per-thread TCP reactor library.
//!
//! Each [`event_loop::EventLoop`] owns a set of [`channel::Channel`]s and runs on exactly one
//! thread for its entire lifetime; callers move work onto it with
//! [`event_loop::LoopHandle::run_in_loop`]/`queue_in_loop`, or schedule timers with `run_at`/
//! `run_after`/`run_every`. [`net::tcp_server::TcpServer`] accepts connections on one loop and
//! distributes them across an [`event_loop_thread_pool::EventLoopThreadPool`];
//! [`net::tcp_client::TcpClient`] drives a single outbound [`net::connector::Connector`].
//!
//! Non-blocking I/O and backoff/retry plumbing is built directly on `libc`; see
//! [`net::socket::Socket`] for the raw syscall layer.

pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod net;
pub mod poller;
mod macros;
mod sigpipe;
pub mod time;
pub mod timer;
pub mod timer_queue;

pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, NewConnectionCallback,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use net::addr::InetAddr;
pub use net::tcp_client::TcpClient;
pub use net::tcp_connection::TcpConnection;
pub use net::tcp_server::TcpServer;
pub use time::Timestamp;
pub use timer::TimerId;
