use std::{fmt, sync::Arc};

use tether::{Anchor, Emitter, Error, Event};
use tether_mio::net::{NetStream, ReadMode};
use tracing::{event, Level};

use crate::{
    request::{parse_request, HttpRequest},
    response::{create_http_server_error_response, HttpServerResponse},
};

/// The events an [`HttpServerConnection`] emits.
pub struct ConnectionEvents {
    /// A request head was parsed; carries the request/response pair.
    pub request_made: Event<(HttpRequest, HttpServerResponse)>,
    /// Terminal event, delegated from the socket's `closed`.
    pub closed: Event<()>,
    /// Failures attributable to the client rather than this server.
    pub client_error: Event<Error>,
    /// A parse or socket failure. Fatal when unhandled.
    pub error: Event<Error>,
}

impl ConnectionEvents {
    fn new(emitter: &Emitter) -> Self {
        Self {
            request_made: emitter.event("request_made"),
            closed: emitter.event("closed"),
            client_error: emitter.event("client_error"),
            error: emitter.fatal_event("error"),
        }
    }
}

/// One accepted HTTP connection over a socket stream.
///
/// [`HttpServerConnection::start`] drives the socket in double-newline read
/// mode; the first framed head is parsed and surfaced through
/// `request_made`, or answered with a 400 when parsing fails.
#[derive(Clone)]
pub struct HttpServerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    socket: NetStream,
    events: ConnectionEvents,
    emitter: Emitter,
    anchor: Arc<Anchor<HttpServerConnection>>,
}

impl HttpServerConnection {
    /// Wrap an accepted socket stream.
    pub fn new(socket: NetStream) -> Self {
        let emitter = Emitter::new();
        let events = ConnectionEvents::new(&emitter);
        let inner = Arc::new(Inner {
            socket,
            events,
            emitter,
            anchor: Arc::new(Anchor::new()),
        });

        let connection = Self { inner };
        connection
            .inner
            .anchor
            .clone()
            .arm(&connection.inner.events.closed, connection.clone());
        connection
    }

    /// The events this connection emits.
    pub fn events(&self) -> &ConnectionEvents {
        &self.inner.events
    }

    /// The emitter behind [`HttpServerConnection::events`].
    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// The underlying socket stream.
    pub fn socket(&self) -> &NetStream {
        &self.inner.socket
    }

    /// Wire up the socket and begin reading the request head.
    pub fn start(&self) -> Result<(), Error> {
        let socket = &self.inner.socket;

        let weak = Arc::downgrade(&self.inner);
        socket.events().data_received.listen_once(move |(data, _eof)| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let connection = HttpServerConnection { inner };
            connection.handle_head(&data[..]);
        });

        let weak = Arc::downgrade(&self.inner);
        socket.events().closed.listen(move |()| {
            if let Some(inner) = weak.upgrade() {
                inner.events.closed.emit(&());
            }
        });

        let weak = Arc::downgrade(&self.inner);
        socket.events().error.listen(move |socket_error| {
            if let Some(inner) = weak.upgrade() {
                let mut error = Error::new("socket error");
                error.add("where", "http_connection::start");
                error.set_child(socket_error.clone());
                inner.events.error.emit(&error);
            }
        });

        socket.set_read_mode(ReadMode::DoubleNewline);
        socket.read_async()
    }

    fn handle_head(&self, head: &[u8]) {
        let response = HttpServerResponse::new(self.inner.socket.downgrade());
        response.start();

        match parse_request(head) {
            Ok(request) => {
                event!(
                    Level::DEBUG,
                    method = %request.method,
                    path = %request.path,
                    "request made"
                );
                self.inner.events.request_made.emit(&(request, response));
            }
            Err(parse_error) => {
                create_http_server_error_response(&response, 400);
                let mut error = Error::new("error parsing http request");
                error.add("where", "http_connection::handle_head");
                error.set_child(parse_error);
                self.inner.events.error.emit(&error);
            }
        }
    }

    /// Close the underlying socket; `closed` follows from its delegation.
    pub fn close(&self) {
        self.inner.socket.close(true);
    }
}

impl fmt::Debug for HttpServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerConnection")
            .field("socket", &self.inner.socket)
            .finish_non_exhaustive()
    }
}
