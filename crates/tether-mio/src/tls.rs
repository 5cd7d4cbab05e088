use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::BytesMut;
use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use tether::Error;

/// TLS file configuration for servers and connecting streams.
///
/// All paths are optional; they are resolved to canonical form at accessor
/// time so misconfiguration surfaces as an error rather than a silent
/// handshake failure.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle used by connecting streams to verify the peer.
    pub ca_verify_file: Option<PathBuf>,
    /// PEM certificate chain presented by the server.
    pub certificate_chain_file: Option<PathBuf>,
    /// PEM private key matching the certificate chain.
    pub private_key_file: Option<PathBuf>,
    /// Diffie-Hellman parameter file, carried for config compatibility.
    ///
    /// rustls selects its own key-exchange groups; the file is validated
    /// but not consumed.
    pub dh_file: Option<PathBuf>,
}

fn canonical(path: &Path) -> Result<PathBuf, Error> {
    path.canonicalize().map_err(|err| {
        let mut error = Error::from(err);
        error.add("category", "resource");
        error.add("where", "tls_config::canonical");
        error.add("path", path.display().to_string());
        error
    })
}

fn config_error(description: &str) -> Error {
    let mut error = Error::new(description);
    error.add("category", "resource");
    error.add("where", "tls_config");
    error
}

impl TlsConfig {
    /// Canonicalized CA bundle path, if configured.
    pub fn ca_verify_file(&self) -> Result<Option<PathBuf>, Error> {
        self.ca_verify_file.as_deref().map(canonical).transpose()
    }

    /// Canonicalized certificate chain path, if configured.
    pub fn certificate_chain_file(&self) -> Result<Option<PathBuf>, Error> {
        self.certificate_chain_file
            .as_deref()
            .map(canonical)
            .transpose()
    }

    /// Canonicalized private key path, if configured.
    pub fn private_key_file(&self) -> Result<Option<PathBuf>, Error> {
        self.private_key_file.as_deref().map(canonical).transpose()
    }

    /// Canonicalized DH parameter path, if configured.
    pub fn dh_file(&self) -> Result<Option<PathBuf>, Error> {
        self.dh_file.as_deref().map(canonical).transpose()
    }

    /// Build the server-side rustls configuration.
    ///
    /// Requires the certificate chain and private key. SSLv2/SSLv3 are
    /// unrepresentable in rustls; the defaults negotiate TLS 1.2 or newer.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, Error> {
        let chain = self
            .certificate_chain_file()?
            .ok_or_else(|| config_error("server TLS requires a certificate chain file"))?;
        let key = self
            .private_key_file()?
            .ok_or_else(|| config_error("server TLS requires a private key file"))?;
        // Validated for existence even though rustls does not consume it.
        self.dh_file()?;

        let mut chain_reader = BufReader::new(File::open(&chain).map_err(Error::from)?);
        let certs = rustls_pemfile::certs(&mut chain_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                Error::with_exception("failed to parse certificate chain", err.into())
            })?;
        if certs.is_empty() {
            return Err(config_error("certificate chain file holds no certificates"));
        }

        let mut key_reader = BufReader::new(File::open(&key).map_err(Error::from)?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|err| Error::with_exception("failed to parse private key", err.into()))?
            .ok_or_else(|| config_error("private key file holds no key"))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| Error::with_exception("invalid certificate or key", err.into()))?;
        Ok(Arc::new(config))
    }

    /// Build the connect-side rustls configuration.
    ///
    /// The root store is loaded from `ca_verify_file`; with no CA bundle the
    /// store is empty and verification will reject every peer.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, Error> {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca) = self.ca_verify_file()? {
            let mut reader = BufReader::new(File::open(&ca).map_err(Error::from)?);
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| Error::with_exception("failed to parse CA bundle", err.into()))?;
            roots.add_parsable_certificates(certs);
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// A rustls session pumped by the stream's readiness handler.
pub(crate) struct TlsSession {
    session: rustls::Connection,
}

impl TlsSession {
    pub(crate) fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let session = rustls::ServerConnection::new(config)
            .map_err(|err| Error::with_exception("failed to create TLS session", err.into()))?;
        Ok(Self {
            session: rustls::Connection::Server(session),
        })
    }

    pub(crate) fn client(config: Arc<rustls::ClientConfig>, host: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(host.to_string()).map_err(|err| {
            Error::with_exception("invalid TLS server name", err.into())
        })?;
        let session = rustls::ClientConnection::new(config, name)
            .map_err(|err| Error::with_exception("failed to create TLS session", err.into()))?;
        Ok(Self {
            session: rustls::Connection::Client(session),
        })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    pub(crate) fn send_close_notify(&mut self) {
        self.session.send_close_notify();
    }

    /// Pull TLS records from the transport and decrypt into `out`.
    ///
    /// Returns whether the transport reached end-of-file.
    pub(crate) fn read(&mut self, io: &mut TcpStream, out: &mut BytesMut) -> io::Result<bool> {
        let mut eof = false;

        loop {
            match self.session.read_tls(io) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            let state = self
                .session
                .process_new_packets()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

            let mut pending = state.plaintext_bytes_to_read();
            while pending > 0 {
                let start = out.len();
                out.resize(start + pending, 0);
                let count = self.session.reader().read(&mut out[start..])?;
                out.truncate(start + count);
                if count == 0 {
                    break;
                }
                pending -= count;
            }
            if state.peer_has_closed() {
                eof = true;
                break;
            }
        }

        Ok(eof)
    }

    /// Encrypt `data` into the session and flush what the transport takes.
    ///
    /// The session buffers what the transport will not take; the remainder
    /// flushes on later writable readiness.
    pub(crate) fn write(&mut self, io: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
        self.session.writer().write_all(data)?;
        match self.flush_records(io) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        Ok(data.len())
    }

    /// Write buffered TLS records until done or the transport blocks.
    pub(crate) fn flush_records(&mut self, io: &mut TcpStream) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(io) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
