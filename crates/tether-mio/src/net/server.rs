use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Weak},
};

use mio::{net::TcpListener, Interest};
use socket2::{Domain, Protocol, Socket, Type};
use tether::{Anchor, Emitter, Error, Event};
use tracing::{event, instrument, Level};

use crate::{
    net::{check_io, stream::HandshakeRole, IpVersion, NetStream},
    reactor::{IoToken, Reactor, Ready},
    tls::TlsConfig,
};

/// The events a [`NetServer`] emits.
pub struct ServerEvents {
    /// A stream finished accepting (and, when encrypted, its handshake).
    pub connection: Event<NetStream>,
    /// The acceptor is bound and listening.
    pub listening: Event<SocketAddr>,
    /// Terminal event; releases the acceptor's self-reference.
    pub closed: Event<()>,
    /// An accept or handshake failure. Fatal when unhandled.
    pub error: Event<Error>,
}

impl ServerEvents {
    fn new(emitter: &Emitter) -> Self {
        Self {
            connection: emitter.event("connection"),
            listening: emitter.event("listening"),
            closed: emitter.event("closed"),
            error: emitter.fatal_event("error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptorState {
    Unbound,
    Listening,
    Closed,
}

/// TCP acceptor producing [`NetStream`]s, optionally TLS-wrapped.
///
/// Plain streams surface through the `connection` event as soon as they are
/// accepted; encrypted streams only after their server-side handshake
/// succeeds. The accept loop re-arms after errors until the acceptor is
/// closed.
#[derive(Clone)]
pub struct NetServer {
    inner: Arc<Inner>,
}

struct Inner {
    io: parking_lot::Mutex<Io>,
    events: ServerEvents,
    emitter: Emitter,
    anchor: Arc<Anchor<NetServer>>,
}

struct Io {
    listener: Option<TcpListener>,
    token: Option<IoToken>,
    state: AcceptorState,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl NetServer {
    /// Create a plain TCP acceptor.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an acceptor that wraps every connection in server-side TLS.
    pub fn with_tls(config: &TlsConfig) -> Result<Self, Error> {
        let server_config = config.server_config()?;
        Ok(Self::build(Some(server_config)))
    }

    fn build(tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        let emitter = Emitter::new();
        let events = ServerEvents::new(&emitter);
        let inner = Arc::new(Inner {
            io: parking_lot::Mutex::new(Io {
                listener: None,
                token: None,
                state: AcceptorState::Unbound,
                tls,
            }),
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

    /// The events this acceptor emits.
    pub fn events(&self) -> &ServerEvents {
        &self.inner.events
    }

    /// The emitter behind [`NetServer::events`].
    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// Whether accepted streams will be TLS-wrapped.
    pub fn using_tls(&self) -> bool {
        self.inner.io.lock().tls.is_some()
    }

    /// Open, bind and listen, then start the accept loop.
    ///
    /// `reuse_address` is always set; a plain-V6 listener sets
    /// `IPV6_V6ONLY`. Emits `listening` with the bound address.
    #[instrument("NetServer::listen", skip(self))]
    pub fn listen(&self, port: u16, ip_version: IpVersion, backlog: u16) -> Result<(), Error> {
        let local_addr = {
            let mut io = self.inner.io.lock();
            if io.state != AcceptorState::Unbound {
                let mut error = Error::new("acceptor is already listening or closed");
                error.add("category", "state");
                return Err(error);
            }

            let mut listener = bind_listener(port, ip_version, backlog).map_err(|err| {
                let mut error = Error::from(err);
                error.add("where", "net_server::listen");
                error
            })?;
            let local_addr = listener.local_addr().map_err(Error::from)?;

            let weak = Arc::downgrade(&self.inner);
            let handler = Arc::new(move |ready: Ready| {
                if let Some(inner) = weak.upgrade() {
                    NetServer { inner }.on_ready(ready);
                }
            });
            let token = Reactor::global()
                .register(&mut listener, Interest::READABLE, handler)
                .map_err(|err| Error::with_exception("failed to register listener", err.into()))?;

            io.listener = Some(listener);
            io.token = Some(token);
            io.state = AcceptorState::Listening;
            local_addr
        };

        event!(Level::DEBUG, addr = ?local_addr, "listening");
        self.inner.events.listening.emit(&local_addr);
        Ok(())
    }

    /// Stop accepting and emit `closed`.
    pub fn close(&self) {
        {
            let mut io = self.inner.io.lock();
            if io.state == AcceptorState::Closed {
                return;
            }
            io.state = AcceptorState::Closed;
            if let (Some(mut listener), Some(token)) = (io.listener.take(), io.token.take()) {
                let _ = Reactor::global().deregister(&mut listener, token);
            }
        }
        self.inner.events.closed.emit(&());
    }

    /// Connection-count limiting; part of the surface, not implemented.
    pub fn set_max_connections(&self, _value: u16) -> Result<(), Error> {
        Err(Error::not_implemented("set_max_connections"))
    }

    /// Connection enumeration; part of the surface, not implemented.
    pub fn get_connections(&self) -> Result<Vec<NetStream>, Error> {
        Err(Error::not_implemented("get_connections"))
    }

    fn on_ready(&self, ready: Ready) {
        if !ready.readable {
            return;
        }

        loop {
            let accepted = {
                let mut io = self.inner.io.lock();
                if io.state != AcceptorState::Listening {
                    return;
                }
                let Some(listener) = io.listener.as_mut() else {
                    return;
                };
                match check_io(listener.accept()) {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        drop(io);
                        // The accept loop re-arms unconditionally.
                        let mut error = Error::from(err);
                        error.add("where", "net_server::accept");
                        self.inner.events.error.emit(&error);
                        continue;
                    }
                }
            };
            let Some((socket, remote_addr)) = accepted else {
                return;
            };
            event!(Level::DEBUG, ?remote_addr, "stream accepted");

            let tls = self.inner.io.lock().tls.clone();
            let stream = match NetStream::from_accepted(socket, tls.clone()) {
                Ok(stream) => stream,
                Err(error) => {
                    self.inner.events.error.emit(&error);
                    continue;
                }
            };

            if tls.is_some() {
                self.handshake_then_emit(stream);
            } else {
                self.inner.events.connection.emit(&stream);
            }
        }
    }

    /// Surface an encrypted stream only after its handshake succeeds.
    fn handshake_then_emit(&self, stream: NetStream) {
        let weak = Arc::downgrade(&self.inner);
        let error_listener = {
            let weak = weak.clone();
            stream.events().error.listen(move |error: &Error| {
                if let Some(inner) = weak.upgrade() {
                    let mut wrapped = Error::new("TLS handshake failed");
                    wrapped.add("where", "net_server::handshake");
                    wrapped.set_child(error.clone());
                    inner.events.error.emit(&wrapped);
                }
            })
        };

        stream.events().secured.listen_once(move |accepted: &NetStream| {
            // The application owns error handling from here on.
            accepted.events().error.remove(error_listener);
            if let Some(inner) = weak.upgrade() {
                inner.events.connection.emit(accepted);
            }
        });

        if let Err(error) = stream.handshake_async(HandshakeRole::Server) {
            self.inner.events.error.emit(&error);
        }
    }
}

impl Default for NetServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let io = self.inner.io.lock();
        f.debug_struct("NetServer")
            .field("state", &io.state)
            .field("tls", &io.tls.is_some())
            .finish_non_exhaustive()
    }
}

fn bind_listener(port: u16, ip_version: IpVersion, backlog: u16) -> io::Result<TcpListener> {
    let (domain, addr): (Domain, SocketAddr) = match ip_version {
        IpVersion::V4 => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, port).into()),
        IpVersion::V6 | IpVersion::V4AndV6 => {
            (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, port).into())
        }
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if ip_version != IpVersion::V4 {
        // A plain V6 listener must not double as a dual-stack bind.
        socket.set_only_v6(ip_version == IpVersion::V6)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(i32::from(backlog))?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into()))
}
