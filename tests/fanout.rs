mod support;

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fishreactor::TcpServer;

#[test]
fn multi_connection_fanout_sums_indices() {
    let sum = Arc::new(AtomicU32::new(0));
    let sum_cb = sum.clone();

    let (_thread, _server, addr) = support::start_server(move |loop_handle| {
        let server = TcpServer::new(loop_handle, support::any_loopback_addr(), "fanout");
        server.set_thread_num(4);
        server.set_message_callback(Arc::new(move |_conn, buf, _time| {
            for byte in buf.retrieve_all_as_vec() {
                sum_cb.fetch_add(byte as u32, Ordering::SeqCst);
            }
        }));
        server
    });

    let mut streams = Vec::new();
    for i in 0u8..8 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&[i]).unwrap();
        streams.push(stream);
    }

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sum.load(Ordering::SeqCst), (0..8u32).sum());
}
