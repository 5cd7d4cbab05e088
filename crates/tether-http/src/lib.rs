//! HTTP/1.x server layer for the tether networking toolkit.
//!
//! An [`HttpServer`] owns a TCP/TLS acceptor; every accepted stream becomes
//! an [`HttpServerConnection`] that drives the socket in double-newline read
//! mode, parses the request head, and emits `request_made` with a paired
//! [`HttpRequest`] and [`HttpServerResponse`].

mod connection;
mod headers;
mod request;
mod response;
mod server;
mod status;
mod url;

pub use self::{
    connection::{ConnectionEvents, HttpServerConnection},
    headers::Headers,
    request::{parse_request, HttpRequest, HttpVersion, Method},
    response::{create_http_server_error_response, HttpServerResponse, ResponseEvents},
    server::{HttpServer, HttpServerEvents},
    status::status_message,
    url::{url_decode, url_encode},
};
