use std::net::SocketAddr;
use std::sync::Arc;

use fishreactor::{EventLoopThread, LoopHandle, TcpServer};

/// Spins up one background `EventLoop` and starts `server` on it, returning the loop's handle
/// (kept alive for the server's lifetime) alongside the bound address.
///
/// `server` is built by the caller from the supplied `LoopHandle` so it can install callbacks
/// before `start()` is called here.
pub fn start_server(build: impl FnOnce(LoopHandle) -> Arc<TcpServer>) -> (EventLoopThread, Arc<TcpServer>, SocketAddr) {
    let mut thread = EventLoopThread::new();
    let handle = thread.start();
    let server = build(handle);
    let addr = server.listen_addr();
    server.start();
    // give the loop thread a moment to process the posted listen() task.
    std::thread::sleep(std::time::Duration::from_millis(50));
    (thread, server, addr)
}

pub fn any_loopback_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}
