use std::time::{Duration, Instant};

use fishreactor::net::connector::Connector;
use fishreactor::EventLoopThread;

/// Connects against a port nothing is listening on; each failed attempt should double the
/// scheduled backoff delay: 500, 1000, 2000, 4000, ... ms, capped at 30s.
#[test]
fn backoff_doubles_after_each_failed_attempt() {
    let closed_port_addr = {
        // Bind-then-drop: the port is free again but nothing will accept a connection to it,
        // so `connect(2)` reliably yields ECONNREFUSED instead of racing a real service.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut thread = EventLoopThread::new();
    let loop_handle = thread.start();

    let connector = Connector::new(loop_handle, closed_port_addr);
    connector.set_new_connection_callback(|fd, _peer| unsafe {
        libc::close(fd);
    });
    assert_eq!(connector.current_retry_delay_ms(), 500);
    connector.start();

    let deadline = Instant::now() + Duration::from_secs(8);
    let mut seen = vec![connector.current_retry_delay_ms()];
    while Instant::now() < deadline && *seen.last().unwrap() < 4000 {
        std::thread::sleep(Duration::from_millis(50));
        let current = connector.current_retry_delay_ms();
        if current != *seen.last().unwrap() {
            seen.push(current);
        }
    }

    // At least the first three doublings should have been observed: 500 -> 1000 -> 2000 -> 4000.
    assert!(seen.len() >= 4, "expected at least 4 distinct delays, saw {seen:?}");
    for pair in seen.windows(2) {
        assert_eq!(pair[1], pair[0] * 2);
    }
}
