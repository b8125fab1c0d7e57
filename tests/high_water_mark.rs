mod support;

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fishreactor::TcpServer;

/// Server pushes 2 MiB to a client that never reads; the high-water-mark callback (threshold
/// 1 MiB) must fire exactly once, with the reported size at or above the threshold.
#[test]
fn high_water_mark_fires_once() {
    let fire_count = Arc::new(AtomicUsize::new(0));
    let last_size = Arc::new(AtomicUsize::new(0));
    let (count_cb, size_cb) = (fire_count.clone(), last_size.clone());

    let (_thread, _server, addr) = support::start_server(move |loop_handle| {
        let server = TcpServer::new(loop_handle, support::any_loopback_addr(), "hwm");
        let threshold = 1_048_576usize;
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let payload = vec![b'x'; 2 * 1024 * 1024];
                conn.send(&payload);
            }
        }));
        server.set_high_water_mark_callback(
            Arc::new(move |_conn, size| {
                count_cb.fetch_add(1, Ordering::SeqCst);
                size_cb.store(size, Ordering::SeqCst);
            }),
            threshold,
        );
        server
    });

    // Connect but never read: forces the server's output buffer to back up.
    let _stream = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    assert!(last_size.load(Ordering::SeqCst) >= 1_048_576);
}
