use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Once,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use tether_mio::{
    net::{IpVersion, NetServer, NetStream, ReadMode, DEFAULT_BACKLOG},
    Reactor, RunMode,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Run the process-wide reactor on a background thread for all tests.
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

/// Bind a fresh acceptor on an ephemeral port.
fn given_listening_server(server: &NetServer) -> SocketAddr {
    let (addr_tx, addr_rx) = crossbeam_channel::unbounded();
    server.events().listening.listen(move |addr| {
        let _ = addr_tx.send(*addr);
    });
    server.events().error.listen(|error| {
        eprintln!("server error: {error}");
    });
    server
        .listen(0, IpVersion::V4, DEFAULT_BACKLOG)
        .expect("listen failed");
    addr_rx.recv_timeout(TIMEOUT).expect("no listening event")
}

fn quiet_errors(stream: &NetStream) {
    stream.events().error.listen(|error| {
        eprintln!("stream error: {error}");
    });
}

#[test]
fn echo_newline_roundtrip() {
    ensure_reactor();
    let server = NetServer::new();

    let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
    server.events().connection.listen(move |stream: &NetStream| {
        quiet_errors(stream);
        let echo = stream.clone();
        let frame_tx = frame_tx.clone();
        stream.events().data_received.listen(move |(data, eof)| {
            let _ = frame_tx.send((data.clone(), *eof));
            let _ = echo.write_async(data.clone());
        });
        stream.set_read_mode(ReadMode::Newline);
        stream.read_async().expect("read_async failed");
    });

    let addr = given_listening_server(&server);
    let mut client = TcpStream::connect(addr).expect("connect failed");
    client.write_all(b"hi\n").expect("client write failed");

    let (frame, eof) = frame_rx.recv_timeout(TIMEOUT).expect("no frame");
    assert_eq!(&frame[..], b"hi\n");
    assert!(!eof);

    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut echoed = [0u8; 3];
    client.read_exact(&mut echoed).expect("no echo");
    assert_eq!(&echoed, b"hi\n");
}

#[test]
fn double_newline_waits_for_the_full_head() {
    ensure_reactor();
    let server = NetServer::new();

    let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
    server.events().connection.listen(move |stream: &NetStream| {
        quiet_errors(stream);
        let frame_tx = frame_tx.clone();
        stream.events().data_received.listen(move |(data, _)| {
            let _ = frame_tx.send(data.clone());
        });
        stream.set_read_mode(ReadMode::DoubleNewline);
        stream.read_async().expect("read_async failed");
    });

    let addr = given_listening_server(&server);
    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    // One segment: exactly one delivery with all 26 bytes.
    let mut client = TcpStream::connect(addr).expect("connect failed");
    client.write_all(request).expect("client write failed");
    let frame = frame_rx.recv_timeout(TIMEOUT).expect("no frame");
    assert_eq!(&frame[..], request);

    // Split into 10 + 16 bytes: still exactly one delivery.
    let mut client = TcpStream::connect(addr).expect("connect failed");
    client.write_all(&request[..10]).expect("client write failed");
    thread::sleep(Duration::from_millis(200));
    assert!(
        frame_rx.try_recv().is_err(),
        "partial head must not deliver"
    );
    client.write_all(&request[10..]).expect("client write failed");
    let frame = frame_rx.recv_timeout(TIMEOUT).expect("no frame");
    assert_eq!(&frame[..], request);
}

#[test]
fn write_coalescing_signals_quiescence_once() {
    ensure_reactor();
    let server = NetServer::new();

    let completions = std::sync::Arc::new(AtomicUsize::new(0));
    let quiescence = std::sync::Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = crossbeam_channel::unbounded();

    {
        let completions = completions.clone();
        let quiescence = quiescence.clone();
        server.events().connection.listen(move |stream: &NetStream| {
            quiet_errors(stream);
            {
                let completions = completions.clone();
                stream.events().write_completion.listen(move |_| {
                    completions.fetch_add(1, Ordering::SeqCst);
                });
            }
            {
                let quiescence = quiescence.clone();
                let done_tx = done_tx.clone();
                stream.events().all_writes_completed.listen(move |_| {
                    quiescence.fetch_add(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                });
            }
            stream.write_async(Bytes::from_static(b"A")).unwrap();
            stream.write_async(Bytes::from_static(b"B")).unwrap();
            stream.write_async(Bytes::from_static(b"C")).unwrap();
        });
    }

    let addr = given_listening_server(&server);
    let mut client = TcpStream::connect(addr).expect("connect failed");
    client.set_read_timeout(Some(TIMEOUT)).unwrap();

    let mut received = [0u8; 3];
    client.read_exact(&mut received).expect("no data");
    assert_eq!(&received, b"ABC");

    done_rx.recv_timeout(TIMEOUT).expect("no quiescence signal");
    assert_eq!(completions.load(Ordering::SeqCst), 3);
    assert_eq!(quiescence.load(Ordering::SeqCst), 1);
}

#[test]
fn pre_subscription_data_is_drained_once() {
    ensure_reactor();
    let server = NetServer::new();

    let (stream_tx, stream_rx) = crossbeam_channel::unbounded();
    server.events().connection.listen(move |stream: &NetStream| {
        quiet_errors(stream);
        stream.set_read_mode(ReadMode::Newline);
        stream.read_async().expect("read_async failed");
        let _ = stream_tx.send(stream.clone());
    });

    let addr = given_listening_server(&server);
    let mut client = TcpStream::connect(addr).expect("connect failed");
    let stream = stream_rx.recv_timeout(TIMEOUT).expect("no connection");

    // Data arrives before any data_received listener exists.
    client.write_all(b"one\n").expect("client write failed");
    thread::sleep(Duration::from_millis(300));

    let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
    stream.events().data_received.listen(move |(data, eof)| {
        let _ = frame_tx.send((data.clone(), *eof));
    });

    client.write_all(b"two\n").expect("client write failed");

    let (first, first_eof) = frame_rx.recv_timeout(TIMEOUT).expect("no drain");
    assert_eq!(&first[..], b"one\n");
    assert!(!first_eof);

    let (second, _) = frame_rx.recv_timeout(TIMEOUT).expect("no fresh frame");
    assert_eq!(&second[..], b"two\n");

    assert_eq!(stream.bytes_read(), 8);
}

#[test]
fn writes_after_close_fail_with_a_state_error() {
    ensure_reactor();
    let server = NetServer::new();

    let (stream_tx, stream_rx) = crossbeam_channel::unbounded();
    server.events().connection.listen(move |stream: &NetStream| {
        quiet_errors(stream);
        let _ = stream_tx.send(stream.clone());
    });

    let addr = given_listening_server(&server);
    let _client = TcpStream::connect(addr).expect("connect failed");
    let stream = stream_rx.recv_timeout(TIMEOUT).expect("no connection");

    let (closed_tx, closed_rx) = crossbeam_channel::unbounded();
    stream.events().closed.listen(move |()| {
        let _ = closed_tx.send(());
    });

    stream.close(true);
    closed_rx.recv_timeout(TIMEOUT).expect("no closed event");
    assert!(stream.is_closed());
    assert!(!stream.can_write());

    let error = stream
        .write_async(Bytes::from_static(b"x"))
        .expect_err("write on closed stream must fail");
    assert_eq!(error.get("category"), Some("state"));
}

#[test]
fn connect_emits_connect_event() {
    ensure_reactor();
    let server = NetServer::new();
    server.events().connection.listen(|stream: &NetStream| {
        quiet_errors(stream);
    });
    let addr = given_listening_server(&server);

    let client = NetStream::new();
    quiet_errors(&client);
    let (connect_tx, connect_rx) = crossbeam_channel::unbounded();
    client.events().connect.listen(move |stream: &NetStream| {
        let _ = connect_tx.send(stream.remote_addr().ok());
    });

    client.connect("127.0.0.1", addr.port());
    let remote = connect_rx.recv_timeout(TIMEOUT).expect("no connect event");
    assert_eq!(remote, Some(addr));
}

#[test]
fn tls_streams_handshake_and_echo() {
    ensure_reactor();

    let config = self_signed_config();
    let server = NetServer::with_tls(&config).expect("server TLS config");
    assert!(server.using_tls());

    server.events().connection.listen(|stream: &NetStream| {
        quiet_errors(stream);
        assert!(stream.is_encrypted());
        let echo = stream.clone();
        stream.events().data_received.listen(move |(data, _)| {
            let _ = echo.write_async(data.clone());
        });
        stream.set_read_mode(ReadMode::Newline);
        stream.read_async().expect("read_async failed");
    });
    let addr = given_listening_server(&server);

    let client = NetStream::with_tls(&config).expect("client TLS config");
    quiet_errors(&client);

    let handshake = client.clone();
    client.events().connect.listen_once(move |_| {
        handshake
            .handshake_async(tether_mio::net::HandshakeRole::Client)
            .expect("handshake_async failed");
    });

    let ping = client.clone();
    client.events().secured.listen_once(move |_| {
        ping.set_read_mode(ReadMode::Newline);
        ping.read_async().expect("read_async failed");
        ping.write_async(Bytes::from_static(b"ping\n")).unwrap();
    });

    let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
    client.events().data_received.listen(move |(data, _)| {
        let _ = frame_tx.send(data.clone());
    });

    client.connect("127.0.0.1", addr.port());

    let frame = frame_rx.recv_timeout(TIMEOUT).expect("no TLS echo");
    assert_eq!(&frame[..], b"ping\n");
}

/// Self-signed certificate written to temp files, trusted by both sides.
fn self_signed_config() -> tether_mio::TlsConfig {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("generate cert");

    let dir = std::env::temp_dir().join(format!("tether-tls-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).expect("write cert");
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).expect("write key");

    tether_mio::TlsConfig {
        ca_verify_file: Some(cert_path.clone()),
        certificate_chain_file: Some(cert_path),
        private_key_file: Some(key_path),
        dh_file: None,
    }
}
