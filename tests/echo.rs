mod support;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use fishreactor::TcpServer;

#[test]
fn echo_round_trip() {
    let (_thread, _server, addr) = support::start_server(|loop_handle| {
        let server = TcpServer::new(loop_handle, support::any_loopback_addr(), "echo");
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let bytes = buf.retrieve_all_as_vec();
            conn.send(&bytes);
        }));
        server
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"PING\n").unwrap();

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"PING\n");
}
