//! Integration test exercising the splice-based relay end to end
//! against two real loopback sockets, without a Postgres backend
//! (the data plane never parses the wire protocol it forwards).

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::time::Duration;

use pg_gateway::gateway::connection::{ConnState, Connection, DriveOutcome};
use pg_gateway::net;

#[test]
fn test_full_duplex_relay_between_two_real_sockets() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_addr = client_listener.local_addr().unwrap();

    let mut app_client = std::net::TcpStream::connect(client_addr).unwrap();
    let (gw_client_side, _) = client_listener.accept().unwrap();

    let gw_backend_side = std::net::TcpStream::connect(backend_addr).unwrap();
    let mut app_backend = backend_listener.accept().unwrap().0;

    net::tcp::set_nonblock(gw_client_side.as_raw_fd()).unwrap();
    net::tcp::set_nonblock(gw_backend_side.as_raw_fd()).unwrap();
    app_client.set_nonblocking(true).unwrap();
    app_backend.set_nonblocking(true).unwrap();

    let client_fd = gw_client_side.into_raw_fd();
    let backend_fd = gw_backend_side.into_raw_fd();

    let mut conn = Connection::new(client_fd, backend_fd, 0).unwrap();
    conn.state = ConnState::Established;

    app_client.write_all(b"hello backend").unwrap();
    std::thread::sleep(Duration::from_millis(30));

    drive_until_alive(&mut conn);

    let mut buf = [0u8; 64];
    let n = read_with_retry(&mut app_backend, &mut buf);
    assert_eq!(&buf[..n], b"hello backend");

    app_backend.write_all(b"hello client").unwrap();
    std::thread::sleep(Duration::from_millis(30));
    drive_until_alive(&mut conn);

    let mut buf = [0u8; 64];
    let n = read_with_retry(&mut app_client, &mut buf);
    assert_eq!(&buf[..n], b"hello client");

    assert_eq!(conn.bytes_client_to_backend, "hello backend".len() as u64);
    assert_eq!(conn.bytes_backend_to_client, "hello client".len() as u64);
}

#[test]
fn test_relay_reports_backend_closed() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_addr = client_listener.local_addr().unwrap();

    let _app_client = std::net::TcpStream::connect(client_addr).unwrap();
    let (gw_client_side, _) = client_listener.accept().unwrap();
    let gw_backend_side = std::net::TcpStream::connect(backend_addr).unwrap();
    let app_backend = backend_listener.accept().unwrap().0;

    net::tcp::set_nonblock(gw_client_side.as_raw_fd()).unwrap();
    net::tcp::set_nonblock(gw_backend_side.as_raw_fd()).unwrap();

    let client_fd = gw_client_side.into_raw_fd();
    let backend_fd = gw_backend_side.into_raw_fd();

    let mut conn = Connection::new(client_fd, backend_fd, 0).unwrap();
    conn.state = ConnState::Established;

    drop(app_backend);
    std::thread::sleep(Duration::from_millis(30));

    let outcome = loop {
        match conn.relay() {
            DriveOutcome::Alive => {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            done @ DriveOutcome::Done(_) => break done,
        }
    };

    match outcome {
        DriveOutcome::Done(reason) => {
            assert_eq!(format!("{reason:?}"), "BackendClosed");
        }
        DriveOutcome::Alive => panic!("expected teardown"),
    }
}

fn drive_until_alive(conn: &mut Connection) {
    for _ in 0..20 {
        match conn.relay() {
            DriveOutcome::Alive => return,
            DriveOutcome::Done(reason) => panic!("unexpected teardown: {reason:?}"),
        }
    }
}

fn read_with_retry(stream: &mut std::net::TcpStream, buf: &mut [u8]) -> usize {
    for _ in 0..50 {
        match stream.read(buf) {
            Ok(n) if n > 0 => return n,
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    panic!("no data received");
}
