//! Non-blocking TCP primitives: the socket stream and the acceptor.

mod server;
mod stream;

pub use self::{
    server::{NetServer, ServerEvents},
    stream::{
        HandshakeRole, MatchPredicate, NetStream, ReadMode, StreamEvents, WeakNetStream,
    },
};

/// Which address family a listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4 only.
    V4,
    /// IPv6 only (`IPV6_V6ONLY` set).
    V6,
    /// Dual-stack IPv6 socket accepting mapped IPv4.
    V4AndV6,
}

/// Default accept backlog.
pub const DEFAULT_BACKLOG: u16 = 511;

/// Separate would-block from real errors on a non-blocking call.
fn check_io<T>(value: Result<T, std::io::Error>) -> Result<Option<T>, std::io::Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(error) => Err(error),
    }
}
