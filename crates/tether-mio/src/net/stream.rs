use std::{
    collections::VecDeque,
    fmt,
    fs::File,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, ToSocketAddrs},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use mio::{net::TcpStream, Interest};
use parking_lot::{Condvar, Mutex};
use regex::bytes::Regex;
use tether::{Anchor, Emitter, Error, Event, Semaphore};
use tracing::{event, Level};

use crate::{
    reactor::{IoToken, Reactor, Ready},
    tls::{TlsConfig, TlsSession},
};

const READ_CHUNK: usize = 8 * 1024;
const DEFAULT_MAX_READ_SIZE: usize = 8 * 1024;
const WRITE_WAIT: Duration = Duration::from_millis(100);

/// When a buffered read completes and delivers data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Deliver on the first `\n`.
    Newline,
    /// Deliver on the first blank line (`(\r\n|\n){2}`).
    DoubleNewline,
    /// Deliver every `max_read_size` bytes.
    BufferFull,
    /// Reserved; not implemented.
    NextByte,
    /// Deliver when the registered predicate reports a match.
    Predicate,
    /// Deliver on the first match of the registered pattern.
    Regex,
    /// Deliver on the first occurrence of a literal value.
    Values,
}

/// Role taken during a TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Accepting side.
    Server,
    /// Connecting side.
    Client,
}

/// User-supplied read terminator.
///
/// Receives the buffered bytes, returns the position one past the matched
/// frame and whether a match was found.
pub type MatchPredicate = Box<dyn Fn(&[u8]) -> (usize, bool) + Send>;

/// The events a [`NetStream`] emits.
pub struct StreamEvents {
    /// A `connect` initiated by [`NetStream::connect`] succeeded.
    pub connect: Event<NetStream>,
    /// A TLS handshake started by [`NetStream::handshake_async`] completed.
    pub secured: Event<NetStream>,
    /// A read-mode frame was delivered; the flag reports end-of-file.
    pub data_received: Event<(Bytes, bool)>,
    /// One asynchronous write finished.
    pub write_completion: Event<NetStream>,
    /// The outstanding-write count returned to zero.
    pub all_writes_completed: Event<NetStream>,
    /// Terminal event; releases the stream's self-reference.
    pub closed: Event<()>,
    /// Reserved for timeout support.
    pub timeout: Event<()>,
    /// A transport or protocol failure. Fatal when unhandled.
    pub error: Event<Error>,
}

impl StreamEvents {
    fn new(emitter: &Emitter) -> Self {
        Self {
            connect: emitter.event("connect"),
            secured: emitter.event("secured"),
            data_received: emitter.event("data_received"),
            write_completion: emitter.event("write_completion"),
            all_writes_completed: emitter.event("all_writes_completed"),
            closed: emitter.event("closed"),
            timeout: emitter.event("timeout"),
            error: emitter.fatal_event("error"),
        }
    }
}

/// Bidirectional framed socket stream over plain TCP or TLS.
///
/// Cheap to clone; all clones share one underlying stream. The stream holds
/// a reference to itself from creation until its `closed` event fires, so it
/// survives as long as reactor callbacks can still reach it.
#[derive(Clone)]
pub struct NetStream {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`NetStream`].
#[derive(Clone)]
pub struct WeakNetStream {
    inner: Weak<Inner>,
}

impl WeakNetStream {
    /// Upgrade to a strong handle if the stream is still alive.
    pub fn upgrade(&self) -> Option<NetStream> {
        self.inner.upgrade().map(|inner| NetStream { inner })
    }
}

struct Inner {
    io: Mutex<Io>,
    events: StreamEvents,
    emitter: Emitter,
    pending_writes: Semaphore,
    bytes_read: AtomicUsize,
    bytes_written: AtomicUsize,
    anchor: Arc<Anchor<NetStream>>,
    writable: Condvar,
}

#[derive(Default)]
struct StreamState {
    end: bool,
    closed: bool,
}

struct ReadOptions {
    mode: ReadMode,
    max_read_size: usize,
    predicate: Option<MatchPredicate>,
    until_values: Vec<u8>,
    pattern: Option<Regex>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            mode: ReadMode::Newline,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            predicate: None,
            until_values: Vec::new(),
            pattern: None,
        }
    }
}

struct Io {
    socket: Option<TcpStream>,
    token: Option<IoToken>,
    state: StreamState,
    connecting: bool,
    shutdown_on_drain: bool,
    read: ReadOptions,
    read_armed: bool,
    eof_seen: bool,
    /// Raw received bytes not yet framed.
    recv: BytesMut,
    /// Frames extracted before any `data_received` listener attached.
    backlog: BytesMut,
    write_queue: VecDeque<WriteOp>,
    tls: Option<TlsSession>,
    tls_server: Option<Arc<rustls::ServerConfig>>,
    tls_client: Option<Arc<rustls::ClientConfig>>,
    peer_host: Option<String>,
}

struct WriteOp {
    data: WriteData,
    offset: usize,
    counted: bool,
}

enum WriteData {
    Bytes(Bytes),
    // The mapping must outlive the async completion.
    Mapped(Arc<Mmap>),
}

impl WriteOp {
    fn remaining(&self) -> &[u8] {
        match &self.data {
            WriteData::Bytes(bytes) => &bytes[self.offset..],
            WriteData::Mapped(map) => &map[self.offset..],
        }
    }
}

enum Emission {
    Connect,
    Secured,
    Data(Bytes, bool),
    WriteDone,
    AllWritesDone,
    Closed,
    Error(Error),
}

fn closed_stream_error() -> Error {
    let mut error = Error::new("attempted use of a closed stream");
    error.add("category", "state");
    error
}

fn cancelled_error(context: &str) -> Error {
    let mut error = Error::new("operation cancelled");
    error
        .add("category", "system")
        .add("error_code", "125")
        .add("where", context);
    error
}

fn double_newline() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\r\n|\n){2}").expect("valid pattern"))
}

impl NetStream {
    /// Create an unconnected plain stream; use [`NetStream::connect`] next.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Create an unconnected stream that will speak TLS after
    /// [`NetStream::handshake_async`].
    pub fn with_tls(config: &TlsConfig) -> Result<Self, Error> {
        let client = config.client_config()?;
        Ok(Self::build(None, Some(client)))
    }

    /// Wrap a freshly accepted socket, optionally pre-wired for server TLS.
    pub(crate) fn from_accepted(
        mut socket: TcpStream,
        tls_server: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self, Error> {
        let stream = Self::build(tls_server, None);

        // Registered under the io lock so the first readiness dispatch
        // cannot observe the stream without its socket.
        let mut io = stream.inner.io.lock();
        let token = stream.register(&mut socket)?;
        io.socket = Some(socket);
        io.token = Some(token);
        drop(io);

        Ok(stream)
    }

    fn build(
        tls_server: Option<Arc<rustls::ServerConfig>>,
        tls_client: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        let emitter = Emitter::new();
        let events = StreamEvents::new(&emitter);

        let inner = Arc::new(Inner {
            io: Mutex::new(Io {
                socket: None,
                token: None,
                state: StreamState::default(),
                connecting: false,
                shutdown_on_drain: false,
                read: ReadOptions::default(),
                read_armed: false,
                eof_seen: false,
                recv: BytesMut::new(),
                backlog: BytesMut::new(),
                write_queue: VecDeque::new(),
                tls: None,
                tls_server,
                tls_client,
                peer_host: None,
            }),
            events,
            emitter,
            pending_writes: Semaphore::new(),
            bytes_read: AtomicUsize::new(0),
            bytes_written: AtomicUsize::new(0),
            anchor: Arc::new(Anchor::new()),
            writable: Condvar::new(),
        });

        let stream = Self { inner };
        stream
            .inner
            .anchor
            .clone()
            .arm(&stream.inner.events.closed, stream.clone());
        stream
    }

    fn register(&self, socket: &mut TcpStream) -> Result<IoToken, Error> {
        let weak = self.downgrade();
        let handler = Arc::new(move |ready: Ready| {
            if let Some(stream) = weak.upgrade() {
                stream.on_ready(ready);
            }
        });
        Reactor::global()
            .register(socket, Interest::READABLE.add(Interest::WRITABLE), handler)
            .map_err(|err| Error::with_exception("failed to register socket", err.into()))
    }

    /// The events this stream emits.
    pub fn events(&self) -> &StreamEvents {
        &self.inner.events
    }

    /// The emitter behind [`NetStream::events`].
    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// Downgrade to a non-owning handle.
    pub fn downgrade(&self) -> WeakNetStream {
        WeakNetStream {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Resolve `host` and start an asynchronous connect.
    ///
    /// Emits `connect` on success and `error` on failure.
    pub fn connect(&self, host: &str, port: u16) {
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(Error::from)
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    let mut error = Error::new("host resolved to no addresses");
                    error.add("category", "system");
                    error
                })
            });

        let addr = match resolved {
            Ok(addr) => addr,
            Err(mut error) => {
                error.add("where", "net_stream::connect");
                self.deliver(vec![Emission::Error(error)]);
                return;
            }
        };

        let result = {
            let mut io = self.inner.io.lock();
            TcpStream::connect(addr)
                .map_err(Error::from)
                .and_then(|mut socket| {
                    let token = self.register(&mut socket)?;
                    io.peer_host = Some(host.to_string());
                    io.socket = Some(socket);
                    io.token = Some(token);
                    io.connecting = true;
                    Ok(())
                })
        };

        if let Err(mut error) = result {
            error.add("where", "net_stream::connect");
            self.deliver(vec![Emission::Error(error)]);
        }
    }

    /// Begin the TLS handshake for the given role.
    ///
    /// Must be called before any read or write on an encrypted stream, after
    /// accept or connect. Emits `secured` once the handshake completes.
    pub fn handshake_async(&self, role: HandshakeRole) -> Result<(), Error> {
        {
            let mut io = self.inner.io.lock();
            if io.state.closed {
                return Err(closed_stream_error());
            }
            if io.tls.is_some() {
                return Ok(());
            }

            let session = match role {
                HandshakeRole::Server => {
                    let config = io.tls_server.clone().ok_or_else(|| {
                        let mut error = Error::new("stream has no TLS context");
                        error.add("category", "state");
                        error
                    })?;
                    TlsSession::server(config)?
                }
                HandshakeRole::Client => {
                    let config = io.tls_client.clone().ok_or_else(|| {
                        let mut error = Error::new("stream has no TLS context");
                        error.add("category", "state");
                        error
                    })?;
                    let host = io.peer_host.clone().unwrap_or_default();
                    TlsSession::client(config, &host)?
                }
            };
            io.tls = Some(session);
        }

        // The handshake may already have bytes to send.
        self.schedule_ready(Ready {
            readable: true,
            writable: true,
        });
        Ok(())
    }

    /// Whether this stream passes data through a TLS layer.
    pub fn is_encrypted(&self) -> bool {
        let io = self.inner.io.lock();
        io.tls.is_some() || io.tls_server.is_some() || io.tls_client.is_some()
    }

    /// Set how buffered reads complete.
    pub fn set_read_mode(&self, mode: ReadMode) {
        self.inner.io.lock().read.mode = mode;
    }

    /// The current read mode.
    pub fn current_read_mode(&self) -> ReadMode {
        self.inner.io.lock().read.mode
    }

    /// Cap for `buffer_full` frames; also the read chunk granularity.
    pub fn set_max_read_size(&self, max_read_size: usize) {
        self.inner.io.lock().read.max_read_size = max_read_size;
    }

    /// Install a user predicate and switch to [`ReadMode::Predicate`].
    pub fn set_read_predicate(
        &self,
        predicate: impl Fn(&[u8]) -> (usize, bool) + Send + 'static,
    ) {
        let mut io = self.inner.io.lock();
        io.read.predicate = Some(Box::new(predicate));
        io.read.mode = ReadMode::Predicate;
    }

    /// Drop any predicate or until-values and fall back to newline framing.
    pub fn clear_read_predicate(&self) {
        let mut io = self.inner.io.lock();
        if matches!(io.read.mode, ReadMode::Predicate) {
            io.read.mode = ReadMode::Newline;
        }
        io.read.until_values.clear();
        io.read.predicate = None;
    }

    /// Terminate reads on a literal value, or on a regular expression.
    pub fn set_read_until_values(&self, values: &str, is_regex: bool) -> Result<(), Error> {
        let mut io = self.inner.io.lock();
        if is_regex {
            let pattern = Regex::new(values).map_err(|err| {
                let mut error = Error::with_exception("invalid read pattern", err.into());
                error.add("category", "state");
                error
            })?;
            io.read.pattern = Some(pattern);
            io.read.mode = ReadMode::Regex;
        } else {
            io.read.until_values = values.as_bytes().to_vec();
            io.read.mode = ReadMode::Values;
        }
        io.read.predicate = None;
        Ok(())
    }

    /// Arm the continuous read loop.
    ///
    /// Frames are delivered through `data_received` until end-of-file or
    /// [`NetStream::close`]; the reader re-arms automatically in between.
    pub fn read_async(&self) -> Result<(), Error> {
        {
            let mut io = self.inner.io.lock();
            if io.state.closed {
                return Ok(());
            }
            if matches!(io.read.mode, ReadMode::NextByte) {
                return Err(Error::not_implemented("read mode next_byte"));
            }
            io.read_armed = true;
        }

        // Bytes may already be buffered from before arming.
        self.schedule_ready(Ready {
            readable: true,
            writable: false,
        });
        Ok(())
    }

    /// Drain and return bytes accumulated before any listener attached.
    pub fn read(&self) -> Bytes {
        self.inner.io.lock().backlog.split().freeze()
    }

    /// Read an exact byte count.
    pub fn read_exact(&self, _bytes: usize) -> Result<Bytes, Error> {
        Err(Error::not_implemented("read_exact"))
    }

    /// Write synchronously, blocking the caller until the transport accepts
    /// the whole chunk.
    ///
    /// Must not be called from a reactor callback when the reactor runs
    /// single-threaded; the flush it waits on would never happen.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        let data: Bytes = chunk.into();
        let mut io = self.inner.io.lock();
        if io.state.end || io.state.closed {
            return Err(closed_stream_error());
        }
        self.inner
            .bytes_written
            .fetch_add(data.len(), Ordering::Relaxed);
        self.write_blocking(&mut io, &data)
    }

    fn write_blocking(
        &self,
        io: &mut parking_lot::MutexGuard<'_, Io>,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut offset = 0;
        while offset < data.len() {
            if io.state.closed {
                return Err(closed_stream_error());
            }
            let inner = &mut **io;
            let Some(socket) = inner.socket.as_mut() else {
                return Err(closed_stream_error());
            };

            let result = match inner.tls.as_mut() {
                Some(tls) => tls.write(socket, &data[offset..]),
                None => socket.write(&data[offset..]),
            };
            match result {
                Ok(0) => {
                    self.inner.writable.wait_for(io, WRITE_WAIT);
                }
                Ok(written) => offset += written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.inner.writable.wait_for(io, WRITE_WAIT);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let mut error = Error::from(err);
                    error.add("where", "net_stream::write");
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Queue an asynchronous write.
    ///
    /// Increments the outstanding-write count; completion emits
    /// `write_completion`, and `all_writes_completed` when the count returns
    /// to zero. `bytes_written` is counted at submission.
    pub fn write_async(&self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        let data: Bytes = chunk.into();
        {
            let mut io = self.inner.io.lock();
            if io.state.end || io.state.closed {
                return Err(closed_stream_error());
            }
            self.inner
                .bytes_written
                .fetch_add(data.len(), Ordering::Relaxed);
            self.inner.pending_writes.inc();
            io.write_queue.push_back(WriteOp {
                data: WriteData::Bytes(data),
                offset: 0,
                counted: true,
            });
        }
        self.schedule_ready(Ready {
            readable: false,
            writable: true,
        });
        Ok(())
    }

    /// Memory-map a file and write it synchronously.
    pub fn write_from_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let map = map_file(path.as_ref())?;
        let mut io = self.inner.io.lock();
        if io.state.end || io.state.closed {
            return Err(closed_stream_error());
        }
        self.inner
            .bytes_written
            .fetch_add(map.len(), Ordering::Relaxed);
        self.write_blocking(&mut io, &map[..])
    }

    /// Memory-map a file and queue it as a single asynchronous write.
    ///
    /// The mapping is held by the write queue until the write completes.
    pub fn write_from_file_async(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let map = map_file(path.as_ref())?;
        {
            let mut io = self.inner.io.lock();
            if io.state.end || io.state.closed {
                return Err(closed_stream_error());
            }
            self.inner
                .bytes_written
                .fetch_add(map.len(), Ordering::Relaxed);
            self.inner.pending_writes.inc();
            io.write_queue.push_back(WriteOp {
                data: WriteData::Mapped(Arc::new(map)),
                offset: 0,
                counted: true,
            });
        }
        self.schedule_ready(Ready {
            readable: false,
            writable: true,
        });
        Ok(())
    }

    /// Half-close the stream for writing. Reads may continue.
    pub fn end(&self) {
        let mut emissions = Vec::new();
        {
            let mut io = self.inner.io.lock();
            io.state.end = true;
            if io.write_queue.is_empty() {
                shutdown_write(&mut io, &mut emissions);
            } else {
                io.shutdown_on_drain = true;
            }
        }
        self.deliver(emissions);
    }

    /// Queue a final chunk, then half-close for writing.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        self.write_async(chunk)?;
        self.end();
        Ok(())
    }

    /// Close the stream, cancelling outstanding operations.
    ///
    /// Queued writes that cannot be flushed immediately complete with a
    /// cancellation `error` event. Emits `closed` unless `emit` is false.
    pub fn close(&self, emit: bool) {
        let mut emissions = Vec::new();
        {
            let mut io = self.inner.io.lock();
            io.state.closed = true;
            io.state.end = true;
            io.read_armed = false;

            // Best effort: drain what the transport will take right now.
            self.flush_writes(&mut io, &mut emissions);
            cancel_queue(&self.inner, &mut io, &mut emissions, "net_stream::close");

            if let (Some(mut socket), Some(token)) = (io.socket.take(), io.token.take()) {
                let _ = Reactor::global().deregister(&mut socket, token);
            }
            io.tls = None;
        }
        if emit {
            emissions.push(Emission::Closed);
        }
        self.inner.writable.notify_all();
        self.deliver(emissions);
    }

    /// Cancel outstanding operations without changing stream state.
    pub fn cancel(&self) {
        let mut emissions = Vec::new();
        {
            let mut io = self.inner.io.lock();
            io.read_armed = false;
            cancel_queue(&self.inner, &mut io, &mut emissions, "net_stream::cancel");
        }
        self.deliver(emissions);
    }

    /// Whether the transport exists and the stream is not closed.
    pub fn is_open(&self) -> bool {
        let io = self.inner.io.lock();
        io.socket.is_some() && !io.state.closed
    }

    /// Whether [`NetStream::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.io.lock().state.closed
    }

    /// Whether writes are still allowed.
    pub fn can_write(&self) -> bool {
        !self.inner.io.lock().state.end
    }

    /// Total bytes delivered (or queued for delivery) through reads.
    pub fn bytes_read(&self) -> usize {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes submitted through writes.
    pub fn bytes_written(&self) -> usize {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> Result<SocketAddr, Error> {
        let io = self.inner.io.lock();
        let socket = io.socket.as_ref().ok_or_else(closed_stream_error)?;
        socket.peer_addr().map_err(|err| {
            let mut error = Error::from(err);
            error.add("where", "net_stream::remote_addr");
            error
        })
    }

    /// The local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let io = self.inner.io.lock();
        let socket = io.socket.as_ref().ok_or_else(closed_stream_error)?;
        socket.local_addr().map_err(|err| {
            let mut error = Error::from(err);
            error.add("where", "net_stream::local_addr");
            error
        })
    }

    /// Kernel buffer size control; part of the surface, not implemented.
    pub fn buffer_size(&self) -> Result<usize, Error> {
        Err(Error::not_implemented("buffer_size"))
    }

    /// Inactivity timeout; part of the surface, not implemented.
    pub fn set_timeout(&self, _milliseconds: u32) -> Result<(), Error> {
        Err(Error::not_implemented("set_timeout"))
    }

    /// `TCP_NODELAY` control; part of the surface, not implemented.
    pub fn set_no_delay(&self, _no_delay: bool) -> Result<(), Error> {
        Err(Error::not_implemented("set_no_delay"))
    }

    /// Keep-alive control; part of the surface, not implemented.
    pub fn set_keep_alive(&self, _keep_alive: bool, _initial_delay: u32) -> Result<(), Error> {
        Err(Error::not_implemented("set_keep_alive"))
    }

    /// Close this stream the next time the outstanding-write count reaches
    /// zero.
    pub fn close_when_writes_completed(&self) {
        self.inner
            .events
            .all_writes_completed
            .listen_once(|stream: &NetStream| {
                stream.close(false);
            });
    }

    /// Forward every delivered frame to `target` as an asynchronous write.
    pub fn delegate_data_received_to(&self, target: WeakNetStream) {
        self.inner.events.data_received.listen(move |(data, _eof)| {
            if let Some(target) = target.upgrade() {
                if let Err(error) = target.write_async(data.clone()) {
                    event!(Level::DEBUG, %error, "data delegation failed");
                }
            }
        });
    }

    fn schedule_ready(&self, ready: Ready) {
        let weak = self.downgrade();
        Reactor::global().spawn(move || {
            if let Some(stream) = weak.upgrade() {
                stream.on_ready(ready);
            }
        });
    }

    fn on_ready(&self, ready: Ready) {
        let mut emissions = Vec::new();
        {
            let mut io = self.inner.io.lock();
            if io.state.closed {
                return;
            }

            if ready.writable {
                if io.connecting {
                    self.check_connect(&mut io, &mut emissions);
                }
                self.flush_writes(&mut io, &mut emissions);
                self.inner.writable.notify_all();
            }
            if ready.readable {
                self.pump_reads(&mut io, &mut emissions);
            }
        }
        self.deliver(emissions);
    }

    fn check_connect(&self, io: &mut Io, emissions: &mut Vec<Emission>) {
        let Some(socket) = io.socket.as_ref() else {
            return;
        };
        match socket.take_error() {
            Ok(Some(err)) => {
                io.connecting = false;
                let mut error = Error::from(err);
                error.add("where", "net_stream::connect");
                emissions.push(Emission::Error(error));
            }
            Ok(None) => match socket.peer_addr() {
                Ok(_) => {
                    io.connecting = false;
                    emissions.push(Emission::Connect);
                }
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => {
                    io.connecting = false;
                    let mut error = Error::from(err);
                    error.add("where", "net_stream::connect");
                    emissions.push(Emission::Error(error));
                }
            },
            Err(err) => {
                io.connecting = false;
                let mut error = Error::from(err);
                error.add("where", "net_stream::connect");
                emissions.push(Emission::Error(error));
            }
        }
    }

    fn flush_writes(&self, io: &mut Io, emissions: &mut Vec<Emission>) {
        loop {
            let Io {
                socket,
                tls,
                write_queue,
                ..
            } = io;
            let Some(socket) = socket.as_mut() else {
                return;
            };

            // TLS records from a handshake or earlier writes flush first.
            if let Some(tls) = tls.as_mut() {
                if let Err(err) = tls.flush_records(socket) {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        let mut error = Error::from(err);
                        error.add("where", "net_stream::flush_writes");
                        emissions.push(Emission::Error(error));
                    }
                    break;
                }
            }

            let Some(op) = write_queue.front_mut() else {
                break;
            };

            let result = match tls.as_mut() {
                Some(tls) => tls.write(socket, op.remaining()),
                None => socket.write(op.remaining()),
            };
            match result {
                Ok(0) => break,
                Ok(written) => {
                    op.offset += written;
                    if op.remaining().is_empty() {
                        let counted = op.counted;
                        write_queue.pop_front();
                        if counted {
                            emissions.push(Emission::WriteDone);
                            if self.inner.pending_writes.dec() {
                                emissions.push(Emission::AllWritesDone);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let mut error = Error::from(err);
                    error.add("where", "net_stream::flush_writes");
                    emissions.push(Emission::Error(error));
                    let counted = op.counted;
                    write_queue.pop_front();
                    if counted && self.inner.pending_writes.dec() {
                        emissions.push(Emission::AllWritesDone);
                    }
                }
            }
        }

        if io.write_queue.is_empty() && io.shutdown_on_drain {
            io.shutdown_on_drain = false;
            shutdown_write(io, emissions);
        }
    }

    fn pump_reads(&self, io: &mut Io, emissions: &mut Vec<Emission>) {
        if io.connecting {
            return;
        }
        // An encrypted stream must not consume handshake records as
        // plaintext before handshake_async installs the session.
        if io.tls.is_none() && (io.tls_server.is_some() || io.tls_client.is_some()) {
            return;
        }

        let was_handshaking = io.tls.as_ref().is_some_and(TlsSession::is_handshaking);
        let mut eof = io.eof_seen;

        {
            let Io {
                socket, tls, recv, ..
            } = io;
            let Some(socket) = socket.as_mut() else {
                return;
            };

            match tls.as_mut() {
                Some(tls) => match tls.read(socket, recv) {
                    Ok(saw_eof) => eof |= saw_eof,
                    Err(err) => {
                        let mut error = Error::from(err);
                        error.add("where", "net_stream::pump_reads");
                        emissions.push(Emission::Error(error));
                        return;
                    }
                },
                None => {
                    let mut chunk = [0u8; READ_CHUNK];
                    loop {
                        match socket.read(&mut chunk) {
                            Ok(0) => {
                                eof = true;
                                break;
                            }
                            Ok(count) => recv.extend_from_slice(&chunk[..count]),
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                let mut error = Error::from(err);
                                error.add("where", "net_stream::pump_reads");
                                emissions.push(Emission::Error(error));
                                return;
                            }
                        }
                    }
                }
            }
        }
        io.eof_seen = eof;

        {
            let Io { socket, tls, .. } = io;
            if let (Some(tls), Some(socket)) = (tls.as_mut(), socket.as_mut()) {
                // The read pump may have produced records to send back,
                // handshake replies included.
                let _ = tls.flush_records(socket);
                if was_handshaking && !tls.is_handshaking() {
                    emissions.push(Emission::Secured);
                }
            }
        }

        if io.read_armed {
            while let Some(frame) = extract_frame(&mut io.read, &mut io.recv) {
                self.inner
                    .bytes_read
                    .fetch_add(frame.len(), Ordering::Relaxed);
                emissions.push(Emission::Data(frame, false));
            }
        }

        if eof {
            if io.read_armed && !io.recv.is_empty() {
                let rest = io.recv.split().freeze();
                self.inner
                    .bytes_read
                    .fetch_add(rest.len(), Ordering::Relaxed);
                emissions.push(Emission::Data(rest, true));
            }
            // The read loop re-arms on anything but close and end-of-file.
            io.read_armed = false;
        }
    }

    fn deliver(&self, emissions: Vec<Emission>) {
        for emission in emissions {
            match emission {
                Emission::Connect => self.inner.events.connect.emit(self),
                Emission::Secured => self.inner.events.secured.emit(self),
                Emission::WriteDone => self.inner.events.write_completion.emit(self),
                Emission::AllWritesDone => self.inner.events.all_writes_completed.emit(self),
                Emission::Closed => self.inner.events.closed.emit(&()),
                Emission::Error(error) => {
                    event!(Level::DEBUG, %error, "stream error");
                    self.inner.events.error.emit(&error);
                }
                Emission::Data(bytes, eof) => {
                    if self.inner.events.data_received.count() == 0 {
                        // No listener yet; queue until one attaches.
                        self.inner.io.lock().backlog.extend_from_slice(&bytes);
                        continue;
                    }
                    let backlog = {
                        let mut io = self.inner.io.lock();
                        if io.backlog.is_empty() {
                            None
                        } else {
                            Some(io.backlog.split().freeze())
                        }
                    };
                    if let Some(backlog) = backlog {
                        self.inner.events.data_received.emit(&(backlog, false));
                    }
                    self.inner.events.data_received.emit(&(bytes, eof));
                }
            }
        }
    }
}

impl Default for NetStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let io = self.inner.io.lock();
        f.debug_struct("NetStream")
            .field("closed", &io.state.closed)
            .field("end", &io.state.end)
            .field("encrypted", &io.tls.is_some())
            .finish_non_exhaustive()
    }
}

fn shutdown_write(io: &mut Io, emissions: &mut Vec<Emission>) {
    let Io { socket, tls, .. } = io;
    let Some(socket) = socket.as_mut() else {
        return;
    };
    if let Some(tls) = tls.as_mut() {
        tls.send_close_notify();
        let _ = tls.flush_records(socket);
    }
    if let Err(err) = socket.shutdown(Shutdown::Write) {
        if err.kind() != io::ErrorKind::NotConnected {
            let mut error = Error::from(err);
            error.add("where", "net_stream::end");
            emissions.push(Emission::Error(error));
        }
    }
}

fn cancel_queue(inner: &Inner, io: &mut Io, emissions: &mut Vec<Emission>, context: &str) {
    while let Some(op) = io.write_queue.pop_front() {
        emissions.push(Emission::Error(cancelled_error(context)));
        if op.counted && inner.pending_writes.dec() {
            emissions.push(Emission::AllWritesDone);
        }
    }
}

#[allow(unsafe_code)]
fn map_file(path: &Path) -> Result<Mmap, Error> {
    let resource_error = |err: io::Error| {
        let mut error = Error::from(err);
        error.add("category", "resource");
        error.add("where", "net_stream::map_file");
        error
    };
    let file = File::open(path).map_err(resource_error)?;
    // Safety: the mapping is read-only and held for the duration of the
    // write; concurrent truncation of the source file is on the caller.
    unsafe { Mmap::map(&file) }.map_err(resource_error)
}

fn extract_frame(read: &mut ReadOptions, recv: &mut BytesMut) -> Option<Bytes> {
    if recv.is_empty() {
        return None;
    }

    let split_at = match read.mode {
        ReadMode::Newline => recv.iter().position(|byte| *byte == b'\n').map(|pos| pos + 1),
        ReadMode::DoubleNewline => double_newline().find(&recv[..]).map(|found| found.end()),
        ReadMode::BufferFull => (recv.len() >= read.max_read_size).then_some(read.max_read_size),
        ReadMode::Values => {
            let needle = &read.until_values;
            if needle.is_empty() {
                None
            } else {
                recv.windows(needle.len())
                    .position(|window| window == needle)
                    .map(|pos| pos + needle.len())
            }
        }
        ReadMode::Regex => read
            .pattern
            .as_ref()
            .and_then(|pattern| pattern.find(&recv[..]))
            .map(|found| found.end()),
        ReadMode::Predicate => read.predicate.as_ref().and_then(|predicate| {
            let (position, matched) = predicate(&recv[..]);
            matched.then_some(position)
        }),
        ReadMode::NextByte => None,
    }?;

    Some(recv.split_to(split_at).freeze())
}
