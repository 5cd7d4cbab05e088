use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Once},
    thread,
    time::{Duration, Instant},
};

use tether_http::{HttpRequest, HttpServer, HttpServerResponse};
use tether_mio::{
    net::{IpVersion, DEFAULT_BACKLOG},
    Reactor, RunMode,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn ensure_reactor() {
    static STARTED: Once = Once::new();
    STARTED.call_once(|| {
        std::mem::forget(Reactor::global().work());
        thread::spawn(|| {
            Reactor::global()
                .start(RunMode::Single)
                .expect("reactor run failed");
        });
    });
}

type RequestHandler = Arc<dyn Fn(&(HttpRequest, HttpServerResponse)) + Send + Sync>;

/// Start a server on an ephemeral port routing every request to `handler`.
fn given_server(handler: RequestHandler) -> (HttpServer, SocketAddr) {
    ensure_reactor();
    let server = HttpServer::new();
    server.events().error.listen(|error| {
        eprintln!("server error: {error}");
    });

    server.events().client_connected.listen(move |connection| {
        let handler = handler.clone();
        connection.events().request_made.listen(move |pair| {
            handler(pair);
        });
    });

    let (addr_tx, addr_rx) = crossbeam_channel::unbounded();
    server.events().listening.listen(move |addr| {
        let _ = addr_tx.send(*addr);
    });
    server
        .listen_on(0, IpVersion::V4, DEFAULT_BACKLOG)
        .expect("listen_on failed");
    let addr = addr_rx.recv_timeout(TIMEOUT).expect("no listening event");

    (server, addr)
}

/// Send raw bytes, return everything read until the server closes.
fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).expect("connect failed");
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    client.write_all(request).expect("client write failed");

    let mut response = Vec::new();
    client.read_to_end(&mut response).expect("client read failed");
    response
}

#[test]
fn serves_a_parsed_request() {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (_server, addr) = given_server(Arc::new(move |(request, response)| {
        let _ = request_tx.send((request.method, request.path.clone()));
        response.close_when_writes_completed();
        response.send_status(200).unwrap();
        response.add_header("Content-Type", "text/plain");
        response.end_with("hello").unwrap();
    }));

    let reply = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    let (method, path) = request_rx.recv_timeout(TIMEOUT).expect("no request");
    assert_eq!(method, tether_http::Method::Get);
    assert_eq!(path, "/");

    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Type: text/plain\r\n"));
    assert!(text.contains("Date: "));
    assert!(text.contains("Content-Length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\nhello"));
}

#[test]
fn split_head_yields_one_request() {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (_server, addr) = given_server(Arc::new(move |(request, response)| {
        let _ = request_tx.send(request.path.clone());
        response.close_when_writes_completed();
        response.send_status(204).unwrap();
        response.end().unwrap();
    }));

    let request = b"GET /split HTTP/1.1\r\nHost: x\r\n\r\n";
    let mut client = TcpStream::connect(addr).expect("connect failed");
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    client.write_all(&request[..10]).expect("client write failed");
    thread::sleep(Duration::from_millis(200));
    client.write_all(&request[10..]).expect("client write failed");

    assert_eq!(
        request_rx.recv_timeout(TIMEOUT).expect("no request"),
        "/split"
    );
    assert!(
        request_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "head must parse exactly once"
    );

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).expect("client read failed");
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 204 No Content\r\n"));
}

#[test]
fn send_body_alone_still_writes_status_first() {
    let (_server, addr) = given_server(Arc::new(move |(_, response)| {
        response.close_when_writes_completed();
        // Deliberately out of order; send() gating must fix it.
        response.write("payload");
        response.send_body().unwrap();
        response.end().unwrap();
    }));

    let reply = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("\r\n\r\npayload"));
}

#[test]
fn unparseable_request_gets_a_400_and_an_error_event() {
    let (error_tx, error_rx) = crossbeam_channel::unbounded();
    let server = HttpServer::new();
    {
        ensure_reactor();
        server.events().error.listen(move |error| {
            let _ = error_tx.send(error.to_string());
        });
    }

    let (addr_tx, addr_rx) = crossbeam_channel::unbounded();
    server.events().listening.listen(move |addr| {
        let _ = addr_tx.send(*addr);
    });
    server
        .listen_on(0, IpVersion::V4, DEFAULT_BACKLOG)
        .expect("listen_on failed");
    let addr = addr_rx.recv_timeout(TIMEOUT).expect("no listening event");

    let reply = roundtrip(addr, b"NOT-HTTP\r\n\r\n");
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.ends_with("400 Bad Request\r\n"));

    let surfaced = error_rx.recv_timeout(TIMEOUT).expect("no error event");
    assert!(surfaced.contains("error parsing http request"), "got: {surfaced}");
}

#[test]
fn closed_connections_leave_the_registry() {
    let (server, addr) = given_server(Arc::new(move |(_, response)| {
        response.close_when_writes_completed();
        response.send_status(200).unwrap();
        response.end().unwrap();
    }));

    let reply = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(!reply.is_empty());

    // Removal happens on the closed event, shortly after the client reads.
    let deadline = Instant::now() + TIMEOUT;
    while server.connection_count() != 0 {
        assert!(Instant::now() < deadline, "connection never removed");
        thread::sleep(Duration::from_millis(20));
    }
}
