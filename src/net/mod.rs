pub mod acceptor;
pub mod addr;
pub mod connector;
pub mod socket;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
