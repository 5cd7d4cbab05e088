use std::{fmt, sync::Arc, time::SystemTime};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tether::{Emitter, Error, Event};
use tether_mio::net::WeakNetStream;
use tracing::{event, Level};

use crate::{request::HttpVersion, status::status_message};

/// The events an [`HttpServerResponse`] emits.
///
/// Both are delegated from the underlying socket once
/// [`HttpServerResponse::start`] has run.
pub struct ResponseEvents {
    /// One asynchronous socket write finished.
    pub write_completion: Event<HttpServerResponse>,
    /// The socket's outstanding-write count returned to zero.
    pub all_writes_completed: Event<HttpServerResponse>,
}

impl ResponseEvents {
    fn new(emitter: &Emitter) -> Self {
        Self {
            write_completion: emitter.event("write_completion"),
            all_writes_completed: emitter.event("all_writes_completed"),
        }
    }
}

/// Deferred-send HTTP response bound to a socket it does not own.
///
/// Body writes accumulate until sent. The wire order status → headers →
/// body is enforced: each stage first sends the stages before it, and each
/// is sent at most once per [`HttpServerResponse::reset`] cycle.
#[derive(Clone)]
pub struct HttpServerResponse {
    inner: Arc<Inner>,
}

struct Inner {
    socket: WeakNetStream,
    state: Mutex<State>,
    events: ResponseEvents,
    emitter: Emitter,
}

struct State {
    version: HttpVersion,
    headers: crate::Headers,
    body: BytesMut,
    status_sent: bool,
    headers_sent: bool,
    body_sent: bool,
}

impl HttpServerResponse {
    /// Create a response writing through `socket`.
    pub fn new(socket: WeakNetStream) -> Self {
        let emitter = Emitter::new();
        let events = ResponseEvents::new(&emitter);
        Self {
            inner: Arc::new(Inner {
                socket,
                state: Mutex::new(State {
                    version: HttpVersion::default(),
                    headers: crate::Headers::new(),
                    body: BytesMut::new(),
                    status_sent: false,
                    headers_sent: false,
                    body_sent: false,
                }),
                events,
                emitter,
            }),
        }
    }

    /// Delegate the socket's write events to this response's events.
    pub fn start(&self) {
        let Some(socket) = self.inner.socket.upgrade() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        socket.events().write_completion.listen(move |_| {
            if let Some(inner) = weak.upgrade() {
                let response = HttpServerResponse { inner };
                response.inner.events.write_completion.emit(&response);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        socket.events().all_writes_completed.listen(move |_| {
            if let Some(inner) = weak.upgrade() {
                let response = HttpServerResponse { inner };
                response.inner.events.all_writes_completed.emit(&response);
            }
        });
    }

    /// The events this response emits.
    pub fn events(&self) -> &ResponseEvents {
        &self.inner.events
    }

    /// The emitter behind [`HttpServerResponse::events`].
    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// Set the protocol version used on the status line.
    pub fn set_version(&self, version: HttpVersion) -> &Self {
        self.inner.state.lock().version = version;
        self
    }

    /// Append a header, allowing duplicates.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        self.inner.state.lock().headers.add(name, value);
        self
    }

    /// The first header value with this name.
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner.state.lock().headers.get(name).map(str::to_string)
    }

    /// Buffer body bytes for [`HttpServerResponse::send_body`].
    pub fn write(&self, data: impl AsRef<[u8]>) -> &Self {
        self.inner
            .state
            .lock()
            .body
            .extend_from_slice(data.as_ref());
        self
    }

    /// Snapshot of the buffered body.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.state.lock().body)
    }

    /// Drop the buffered body.
    pub fn clear_body(&self) -> &Self {
        self.inner.state.lock().body.clear();
        self
    }

    /// Write bytes straight to the socket, bypassing the body buffer.
    ///
    /// Blocks like [`tether_mio::net::NetStream::write`].
    pub fn write_raw_body(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let Some(socket) = self.inner.socket.upgrade() else {
            return Err(gone_error());
        };
        socket.write(data)
    }

    /// Queue a memory-mapped file as raw body bytes.
    pub fn write_file_async(&self, path: impl AsRef<std::path::Path>) -> Result<(), Error> {
        let Some(socket) = self.inner.socket.upgrade() else {
            return Err(gone_error());
        };
        socket.write_from_file_async(path)
    }

    /// Send the status line with the default reason phrase.
    pub fn send_status(&self, code: u16) -> Result<(), Error> {
        self.send_status_with(code, status_message(code).unwrap_or("Error"))
    }

    /// Send the status line with an explicit reason phrase.
    pub fn send_status_with(&self, code: u16, message: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.status_sent {
            return Ok(());
        }
        let Some(socket) = self.inner.socket.upgrade() else {
            return Ok(());
        };

        let line = format!("HTTP/{} {code} {message}\r\n", state.version);
        socket.write_async(line)?;
        state.status_sent = true;
        Ok(())
    }

    /// Send the header block, inserting `Date:` if absent.
    ///
    /// Sends the status line first when it has not gone out yet.
    pub fn send_headers(&self) -> Result<(), Error> {
        self.send_status(200)?;

        let mut state = self.inner.state.lock();
        if state.headers_sent {
            return Ok(());
        }
        let Some(socket) = self.inner.socket.upgrade() else {
            return Ok(());
        };

        if !state.headers.contains("Date") {
            let date = httpdate::fmt_http_date(SystemTime::now());
            state.headers.add("Date", date);
        }
        socket.write_async(state.headers.to_string())?;
        state.headers_sent = true;
        Ok(())
    }

    /// Send `Content-Length`, the blank line, and the buffered body.
    ///
    /// Sends status and headers first when they have not gone out yet.
    pub fn send_body(&self) -> Result<(), Error> {
        self.send_headers()?;

        let mut state = self.inner.state.lock();
        if state.body_sent {
            return Ok(());
        }
        let Some(socket) = self.inner.socket.upgrade() else {
            return Ok(());
        };

        let body = state.body.split().freeze();
        socket.write_async(format!("Content-Length: {}\r\n\r\n", body.len()))?;
        socket.write_async(body)?;
        state.body_sent = true;
        Ok(())
    }

    /// Flush status and headers, announce `length` body bytes, and hand the
    /// socket over to the caller for raw streaming writes.
    pub fn prepare_raw_write(&self, length: usize) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            state.body_sent = true;
            state.body.clear();
        }
        self.send_headers()?;

        let Some(socket) = self.inner.socket.upgrade() else {
            return Ok(());
        };
        socket.write_async(format!("Content-Length: {length}\r\n\r\n"))?;
        Ok(())
    }

    /// Send whichever of status, headers and body has not been sent yet.
    ///
    /// Returns whether anything was still unsent.
    pub fn send(&self) -> Result<bool, Error> {
        let outstanding = {
            let state = self.inner.state.lock();
            !(state.status_sent && state.headers_sent && state.body_sent)
        };
        if outstanding {
            self.send_body()?;
        }
        Ok(outstanding)
    }

    /// Send everything outstanding and half-close the socket for writing.
    pub fn end(&self) -> Result<(), Error> {
        self.send()?;
        if let Some(socket) = self.inner.socket.upgrade() {
            socket.end();
        }
        Ok(())
    }

    /// Buffer a final chunk, then [`HttpServerResponse::end`].
    pub fn end_with(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.write(data);
        self.end()
    }

    /// Close the socket, optionally sending the response first.
    pub fn close(&self, send_response: bool) {
        if send_response {
            if let Err(error) = self.send() {
                event!(Level::DEBUG, %error, "response send on close failed");
            }
        }
        if let Some(socket) = self.inner.socket.upgrade() {
            socket.end();
            socket.close(true);
        }
    }

    /// Close the socket the next time its outstanding writes drain.
    pub fn close_when_writes_completed(&self) {
        self.inner
            .events
            .all_writes_completed
            .listen_once(|response: &HttpServerResponse| {
                response.close(false);
            });
    }

    /// Clear flags, headers and body for pipelined reuse.
    pub fn reset(&self) -> &Self {
        let mut state = self.inner.state.lock();
        state.status_sent = false;
        state.headers_sent = false;
        state.body_sent = false;
        state.headers.clear();
        state.body.clear();
        self
    }

    /// Whether the socket is gone or closed.
    pub fn is_closed(&self) -> bool {
        self.inner
            .socket
            .upgrade()
            .is_none_or(|socket| socket.is_closed())
    }

    /// Whether the socket still accepts writes.
    pub fn can_write(&self) -> bool {
        self.inner
            .socket
            .upgrade()
            .is_some_and(|socket| socket.can_write())
    }

    /// Whether the socket exists and is open.
    pub fn is_open(&self) -> bool {
        self.inner
            .socket
            .upgrade()
            .is_some_and(|socket| socket.is_open())
    }
}

impl fmt::Debug for HttpServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HttpServerResponse")
            .field("status_sent", &state.status_sent)
            .field("headers_sent", &state.headers_sent)
            .field("body_sent", &state.body_sent)
            .finish_non_exhaustive()
    }
}

fn gone_error() -> Error {
    let mut error = Error::new("attempted use of a closed stream");
    error.add("category", "state");
    error
}

/// Send a plain-text error response for `code` and close the connection.
pub fn create_http_server_error_response(response: &HttpServerResponse, code: u16) {
    let message = status_message(code).unwrap_or("Error");
    if let Err(error) = response.send_status_with(code, message) {
        event!(Level::DEBUG, %error, "error response status failed");
        return;
    }
    response
        .add_header("Content-Type", "text/plain")
        .add_header("Connection", "close");
    if let Err(error) = response.end_with(format!("{code} {message}\r\n")) {
        event!(Level::DEBUG, %error, "error response body failed");
    }
    response.close(true);
}
