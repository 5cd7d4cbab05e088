use std::{fmt, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tether::{Anchor, Emitter, Error, Event};
use tether_mio::{
    net::{IpVersion, NetServer, NetStream},
    TlsConfig,
};
use thunderdome::Arena;
use tracing::{event, instrument, Level};

use crate::connection::HttpServerConnection;

/// The events an [`HttpServer`] emits.
pub struct HttpServerEvents {
    /// A connection was accepted and started.
    pub client_connected: Event<HttpServerConnection>,
    /// The acceptor is bound and listening, forwarded from it.
    pub listening: Event<SocketAddr>,
    /// Terminal event; releases the server's self-reference.
    pub closed: Event<()>,
    /// Acceptor or connection failures surfaced up. Fatal when unhandled.
    pub error: Event<Error>,
}

impl HttpServerEvents {
    fn new(emitter: &Emitter) -> Self {
        Self {
            client_connected: emitter.event("client_connected"),
            listening: emitter.event("listening"),
            closed: emitter.event("closed"),
            error: emitter.fatal_event("error"),
        }
    }
}

/// HTTP/1.x server: an acceptor plus the set of live connections.
///
/// Connections are tracked in an arena and removed in O(1) when their
/// `closed` event fires.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

struct Inner {
    netserver: NetServer,
    connections: Mutex<Arena<HttpServerConnection>>,
    events: HttpServerEvents,
    emitter: Emitter,
    anchor: Arc<Anchor<HttpServer>>,
}

impl HttpServer {
    /// Create a plain HTTP server.
    pub fn new() -> Self {
        Self::build(NetServer::new())
    }

    /// Create an HTTPS server; every connection handshakes before surfacing.
    pub fn with_tls(config: &TlsConfig) -> Result<Self, Error> {
        Ok(Self::build(NetServer::with_tls(config)?))
    }

    fn build(netserver: NetServer) -> Self {
        let emitter = Emitter::new();
        let events = HttpServerEvents::new(&emitter);
        let inner = Arc::new(Inner {
            netserver,
            connections: Mutex::new(Arena::new()),
            events,
            emitter,
            anchor: Arc::new(Anchor::new()),
        });

        let server = Self { inner };
        server
            .inner
            .anchor
            .clone()
            .arm(&server.inner.events.closed, server.clone());
        server
    }

    /// The events this server emits.
    pub fn events(&self) -> &HttpServerEvents {
        &self.inner.events
    }

    /// The emitter behind [`HttpServer::events`].
    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// Number of connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Wire the acceptor and listen.
    #[instrument("HttpServer::listen_on", skip(self))]
    pub fn listen_on(&self, port: u16, ip_version: IpVersion, backlog: u16) -> Result<(), Error> {
        let acceptor = &self.inner.netserver;

        let weak = Arc::downgrade(&self.inner);
        acceptor.events().connection.listen(move |socket: &NetStream| {
            if let Some(inner) = weak.upgrade() {
                HttpServer { inner }.handle_connection(socket.clone());
            }
        });

        let weak = Arc::downgrade(&self.inner);
        acceptor.events().listening.listen(move |addr| {
            if let Some(inner) = weak.upgrade() {
                inner.events.listening.emit(addr);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        acceptor.events().closed.listen(move |()| {
            if let Some(inner) = weak.upgrade() {
                inner.events.closed.emit(&());
            }
        });

        let weak = Arc::downgrade(&self.inner);
        acceptor.events().error.listen(move |acceptor_error| {
            if let Some(inner) = weak.upgrade() {
                let mut error = Error::new("error listening");
                error.add("where", "http_server::listen_on");
                error.set_child(acceptor_error.clone());
                inner.events.error.emit(&error);
            }
        });

        acceptor.listen(port, ip_version, backlog)
    }

    fn handle_connection(&self, socket: NetStream) {
        let connection = HttpServerConnection::new(socket);
        let index = self.inner.connections.lock().insert(connection.clone());

        let weak = Arc::downgrade(&self.inner);
        connection.events().closed.listen_once(move |()| {
            if let Some(inner) = weak.upgrade() {
                inner.connections.lock().remove(index);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        connection.events().error.listen(move |connection_error| {
            if let Some(inner) = weak.upgrade() {
                let mut error = Error::new("connection error");
                error.add("where", "http_server::handle_connection");
                error.set_child(connection_error.clone());
                inner.events.error.emit(&error);
            }
        });

        if let Err(error) = connection.start() {
            event!(Level::WARN, %error, "failed to start connection");
            self.inner.events.error.emit(&error);
            return;
        }

        self.inner.events.client_connected.emit(&connection);
    }

    /// Stop accepting; `closed` follows from the acceptor's delegation.
    pub fn close(&self) {
        self.inner.netserver.close();
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("connections", &self.connection_count())
            .field("acceptor", &self.inner.netserver)
            .finish_non_exhaustive()
    }
}
