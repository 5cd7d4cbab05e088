use std::fmt;

/// Tag describing how a byte buffer should be reinterpreted.
///
/// Carried alongside buffers for future reinterpretation; the core treats
/// all data as bytes. Only values from the allowlist are representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    encoding: &'static str,
}

const VALID_ENCODINGS: &[&str] = &["utf8", "binary", "hex"];

impl Default for Encoding {
    fn default() -> Self {
        Self { encoding: "utf8" }
    }
}

impl Encoding {
    /// Create an encoding tag; `None` when the name is not on the allowlist.
    pub fn new(encoding: &str) -> Option<Self> {
        VALID_ENCODINGS
            .iter()
            .copied()
            .find(|valid| *valid == encoding)
            .map(|valid| Self { encoding: valid })
    }

    /// Whether the name is on the allowlist.
    pub fn is_valid_encoding(encoding: &str) -> bool {
        VALID_ENCODINGS.contains(&encoding)
    }

    /// The encoding name.
    pub fn as_str(&self) -> &str {
        self.encoding
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding)
    }
}
