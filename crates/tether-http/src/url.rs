use tether::Error;

fn parse_error(description: &str) -> Error {
    let mut error = Error::new(description);
    error.add("category", "protocol");
    error
}

fn hex_value(byte: u8) -> Result<u8, Error> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(parse_error("invalid hex digit in percent escape")),
    }
}

/// Decode `%XX` escapes.
///
/// A `%` not followed by two hex digits is a parse error, as is a decoded
/// sequence that is not valid UTF-8.
pub fn url_decode(input: &str) -> Result<String, Error> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());

    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' => {
                let (Some(high), Some(low)) = (bytes.get(index + 1), bytes.get(index + 2)) else {
                    return Err(parse_error("truncated percent escape"));
                };
                decoded.push(hex_value(*high)? << 4 | hex_value(*low)?);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded)
        .map_err(|err| {
            let mut error = parse_error("decoded value is not valid UTF-8");
            error.set_child(Error::with_exception("decode failed", err.into()));
            error
        })
}

/// Percent-encode everything outside the unreserved set.
pub fn url_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push(char::from_digit(u32::from(byte >> 4), 16).unwrap().to_ascii_uppercase());
                encoded.push(char::from_digit(u32::from(byte & 0xf), 16).unwrap().to_ascii_uppercase());
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hex_escapes() {
        assert_eq!(url_decode("/a%20b%2Fc").unwrap(), "/a b/c");
        assert_eq!(url_decode("plain").unwrap(), "plain");
    }

    #[test]
    fn rejects_malformed_escapes() {
        assert!(url_decode("%").is_err());
        assert!(url_decode("%2").is_err());
        assert!(url_decode("%zz").is_err());
    }

    #[test]
    fn decode_inverts_encode() {
        for input in ["/path with spaces", "/ünïcode", "/a+b&c=d", "/plain"] {
            assert_eq!(url_decode(&url_encode(input)).unwrap(), input);
        }
    }
}
