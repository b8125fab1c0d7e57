use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fishreactor::{EventLoopThread, TcpClient};

/// `TcpClient` connecting out to a plain listener: exercises the `Connector` handoff path
/// (connect completes, the connecting channel is disposed, and the freshly registered
/// `TcpConnection` channel must be the one the loop actually dispatches reads for).
#[test]
fn client_round_trip_through_connector() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer_thread = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let mut loop_thread = EventLoopThread::new();
    let handle = loop_thread.start();

    let client = TcpClient::new(handle, addr, Some("test-client".into()));

    let received = Arc::new(Mutex::new(Vec::new()));
    let got_reply = Arc::new(AtomicBool::new(false));
    let (recv_cb, flag_cb) = (received.clone(), got_reply.clone());
    client.set_message_callback(Arc::new(move |_conn, buf, _time| {
        recv_cb.lock().unwrap().extend(buf.retrieve_all_as_vec());
        flag_cb.store(true, Ordering::Release);
    }));
    client.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            conn.send(b"PING\n");
        }
    }));

    client.connect();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !got_reply.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(got_reply.load(Ordering::Acquire), "client never saw the echoed reply");
    assert_eq!(&received.lock().unwrap()[..], b"PING\n");

    peer_thread.join().unwrap();
}
