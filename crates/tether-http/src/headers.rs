use std::fmt;

use tether::Error;

/// Ordered, case-preserving HTTP header collection.
///
/// Names keep the casing they were added with and lookups are
/// case-insensitive. Order is preserved and duplicate names are allowed;
/// serializing and re-parsing a header block reproduces the original
/// sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Replace the first header with this name, or append.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some((_, existing_value)) => *existing_value = value,
            None => self.entries.push((name, value)),
        }
        self
    }

    /// The first value with this name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether any header has this name.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Remove every header.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Parse a serialized header block, one `Name: value` per line.
    ///
    /// Accepts `\r\n` and `\n` endings; stops at the first blank line.
    pub fn parse(block: &str) -> Result<Self, Error> {
        let mut headers = Self::new();
        for line in block.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                let mut error = Error::new("malformed header line");
                error.add("category", "protocol").add("line", line);
                return Err(error);
            };
            if name.is_empty() || name.contains(' ') {
                let mut error = Error::new("malformed header name");
                error.add("category", "protocol").add("line", line);
                return Err(error);
            }
            headers.add(name, value.trim());
        }
        Ok(headers)
    }
}

impl fmt::Display for Headers {
    /// Serialize as `Name: value\r\n` per header, without the blank-line
    /// terminator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}
