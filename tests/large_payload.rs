mod support;

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use fishreactor::TcpServer;

/// Sends a payload well past any OS socket send buffer as soon as the connection is accepted;
/// the peer must eventually read every byte. Exercises the `handle_write` drain path once
/// `output_buf` has backed up and `POLLOUT` starts firing.
#[test]
fn large_write_is_fully_delivered() {
    const PAYLOAD_LEN: usize = 8 * 1024 * 1024;

    let (_thread, _server, addr) = support::start_server(|loop_handle| {
        let server = TcpServer::new(loop_handle, support::any_loopback_addr(), "bulk");
        server.set_connection_callback(Arc::new(|conn| {
            if conn.connected() {
                let payload = vec![b'z'; PAYLOAD_LEN];
                conn.send(&payload);
            }
        }));
        server
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let mut received = Vec::with_capacity(PAYLOAD_LEN);
    let mut chunk = [0u8; 64 * 1024];
    while received.len() < PAYLOAD_LEN {
        let n = stream.read(&mut chunk).expect("read from server");
        assert!(n > 0, "connection closed early at {} of {PAYLOAD_LEN} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(received.len(), PAYLOAD_LEN);
    assert!(received.iter().all(|&b| b == b'z'));
}
