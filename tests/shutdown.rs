mod support;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fishreactor::TcpServer;

#[test]
fn graceful_shutdown_reaches_disconnected_both_ends() {
    let saw_bye = Arc::new(AtomicBool::new(false));
    let saw_bye_cb = saw_bye.clone();
    let server_disconnected = Arc::new(AtomicBool::new(false));
    let server_disconnected_cb = server_disconnected.clone();
    let last = Arc::new(Mutex::new(Vec::new()));
    let last_cb = last.clone();

    let (_thread, _server, addr) = support::start_server(move |loop_handle| {
        let server = TcpServer::new(loop_handle, support::any_loopback_addr(), "shutdown");
        server.set_message_callback(Arc::new(move |_conn, buf, _time| {
            let bytes = buf.retrieve_all_as_vec();
            last_cb.lock().unwrap().extend_from_slice(&bytes);
            if last_cb.lock().unwrap().as_slice() == b"BYE" {
                saw_bye_cb.store(true, Ordering::SeqCst);
            }
        }));
        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.connected() {
                server_disconnected_cb.store(true, Ordering::SeqCst);
            }
        }));
        server
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"BYE").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(saw_bye.load(Ordering::SeqCst));

    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);

    std::thread::sleep(Duration::from_millis(100));
    assert!(server_disconnected.load(Ordering::SeqCst));
}
