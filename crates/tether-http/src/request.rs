use std::{fmt, str};

use tether::Error;

use crate::{headers::Headers, url::url_decode};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Patch,
}

impl Method {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "OPTIONS" => Self::Options,
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            "PATCH" => Self::Patch,
            _ => return None,
        })
    }

    /// The method token as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion {
    /// Major version number.
    pub major: u8,
    /// Minor version number.
    pub minor: u8,
}

impl Default for HttpVersion {
    fn default() -> Self {
        Self { major: 1, minor: 1 }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A parsed HTTP request head.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Percent-decoded path component of the request target.
    pub path: String,
    /// Raw query string after `?`, if any.
    pub query: Option<String>,
    /// Protocol version from the request line.
    pub version: HttpVersion,
    /// Request headers in wire order.
    pub headers: Headers,
}

fn protocol_error(description: &str) -> Error {
    let mut error = Error::new(description);
    error.add("category", "protocol");
    error
}

/// Parse a request head terminated by a blank line.
///
/// Accepts both `\r\n` and `\n` line endings. The buffer is expected to
/// hold exactly the head, the way the double-newline read mode frames it.
pub fn parse_request(buffer: &[u8]) -> Result<HttpRequest, Error> {
    let text = str::from_utf8(buffer).map_err(|err| {
        let mut error = protocol_error("request head is not valid UTF-8");
        error.set_child(Error::with_exception("decode failed", err.into()));
        error
    })?;

    let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(protocol)) =
        (parts.next(), parts.next(), parts.next())
    else {
        let mut error = protocol_error("malformed request line");
        error.add("line", request_line);
        return Err(error);
    };
    if parts.next().is_some() {
        let mut error = protocol_error("malformed request line");
        error.add("line", request_line);
        return Err(error);
    }

    let method = Method::parse(method)
        .ok_or_else(|| {
            let mut error = protocol_error("unknown request method");
            error.add("method", method);
            error
        })?;

    let version = parse_version(protocol).ok_or_else(|| {
        let mut error = protocol_error("unsupported protocol version");
        error.add("protocol", protocol);
        error
    })?;

    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (target, None),
    };
    if !raw_path.starts_with('/') && method != Method::Options && method != Method::Connect {
        let mut error = protocol_error("request target must be absolute");
        error.add("target", target);
        return Err(error);
    }
    let path = url_decode(raw_path)?;

    let mut header_block = String::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        header_block.push_str(line);
        header_block.push('\n');
    }
    let headers = Headers::parse(&header_block)?;

    Ok(HttpRequest {
        method,
        path,
        query,
        version,
        headers,
    })
}

fn parse_version(protocol: &str) -> Option<HttpVersion> {
    let version = protocol.strip_prefix("HTTP/")?;
    let (major, minor) = version.split_once('.')?;
    Some(HttpVersion {
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get() {
        let request =
            parse_request(b"GET /index.html?x=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
                .expect("parse failed");

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/index.html");
        assert_eq!(request.query.as_deref(), Some("x=1"));
        assert_eq!(request.version, HttpVersion { major: 1, minor: 1 });
        assert_eq!(request.headers.get("host"), Some("example.test"));
    }

    #[test]
    fn accepts_bare_newline_endings() {
        let request = parse_request(b"POST /submit HTTP/1.0\nContent-Length: 0\n\n")
            .expect("parse failed");
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.version, HttpVersion { major: 1, minor: 0 });
    }

    #[test]
    fn decodes_percent_escapes_in_the_path() {
        let request = parse_request(b"GET /a%20b HTTP/1.1\r\n\r\n").expect("parse failed");
        assert_eq!(request.path, "/a b");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_request(b"NOT-HTTP\r\n\r\n").is_err());
        assert!(parse_request(b"FETCH / HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"GET / HTTP/x\r\n\r\n").is_err());
        assert!(parse_request(b"GET no-slash HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"GET /a%zz HTTP/1.1\r\n\r\n").is_err());
    }
}
