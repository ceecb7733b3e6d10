//! End-to-end checks against a live server on an ephemeral port.

use scalebench::message::{digest_hex, random_payload, TOKEN_SIZE};
use scalebench::server::Server;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind on an ephemeral port, run the server in the background, and return
/// the port. The listener is bound before the thread spawns, so clients can
/// connect immediately.
fn start_server(pool_size: usize) -> u16 {
    let server = Server::bind(0, pool_size).expect("bind failed");
    let port = server.port();
    thread::spawn(move || {
        let _ = server.run();
    });
    port
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream
}

fn round_trip(stream: &mut TcpStream) -> String {
    let payload = random_payload();
    let expected = digest_hex(&payload);
    stream.write_all(&payload).expect("send failed");

    let mut token = [0u8; TOKEN_SIZE];
    stream.read_exact(&mut token).expect("no acknowledgment");
    let received = std::str::from_utf8(&token).expect("token not UTF-8");

    assert_eq!(received, expected);
    received.to_string()
}

#[test]
fn test_single_payload_round_trip() {
    let port = start_server(4);
    let mut stream = connect(port);

    let token = round_trip(&mut stream);
    assert_eq!(token.len(), TOKEN_SIZE);
    assert!(token
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_sequential_requests_each_acknowledged() {
    let port = start_server(4);
    let mut stream = connect(port);

    for _ in 0..20 {
        round_trip(&mut stream);
    }
}

#[test]
fn test_round_trips_with_minimal_worker_pool() {
    // One general worker beyond the event loop: the digest reliably
    // finishes after the connection's writable event has already fired,
    // so delivery depends on the digest hand-off re-triggering the flush
    let port = start_server(2);
    let mut stream = connect(port);

    for _ in 0..20 {
        round_trip(&mut stream);
    }
}

#[test]
fn test_concurrent_clients() {
    let port = start_server(4);

    let clients: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(port);
                for _ in 0..10 {
                    round_trip(&mut stream);
                }
            })
        })
        .collect();

    for client in clients {
        client.join().expect("client thread failed");
    }
}

#[test]
fn test_server_survives_abrupt_disconnect() {
    let port = start_server(4);

    // Half a request, then hang up
    {
        let mut stream = connect(port);
        stream.write_all(&random_payload()[..1000]).unwrap();
    }

    // A fresh connection still gets full service
    thread::sleep(Duration::from_millis(100));
    let mut stream = connect(port);
    round_trip(&mut stream);
}
