#![deny(unsafe_code)]

//! Reactor, socket streams and acceptors for the tether networking toolkit.
//!
//! A single process-wide [`Reactor`] owns the `mio` poll and dispatches
//! readiness to registered handlers, on one thread or one per core. On top
//! of it, [`net::NetStream`] provides framed, event-emitting socket I/O over
//! plain TCP or TLS, and [`net::NetServer`] accepts connections.

pub mod net;
mod reactor;
mod tls;

pub use self::{
    reactor::{
        start_service, IoToken, Reactor, Ready, ReadyHandler, RegisterError, RunMode, StartError,
        WorkGuard,
    },
    tls::TlsConfig,
};
