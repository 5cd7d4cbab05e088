use std::{fmt, io, sync::Arc};

/// Structured, chainable error value carried by `error` events.
///
/// An `Error` is an ordered sequence of `(name, value)` pairs. Insertion
/// order is preserved and duplicate names are allowed, so context can be
/// layered on as the error travels up through callbacks. A captured foreign
/// error and a nested child error can ride along.
///
/// Once an error has been attached as a child it is *frozen*: further
/// mutation is a programming error and panics.
#[derive(Clone)]
pub struct Error {
    pairs: Vec<(String, String)>,
    exception: Option<Arc<anyhow::Error>>,
    child: Option<Box<Error>>,
    frozen: bool,
}

impl Error {
    /// Create a new error from a description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            pairs: vec![("description".to_string(), description.into())],
            exception: None,
            child: None,
            frozen: false,
        }
    }

    /// Create an error that captures a foreign error in its exception slot.
    pub fn with_exception(description: impl Into<String>, exception: anyhow::Error) -> Self {
        let mut error = Self::new(description);
        error.exception = Some(Arc::new(exception));
        error
    }

    /// Create an error flagged as an intentionally unimplemented surface.
    pub fn not_implemented(what: &str) -> Self {
        let mut error = Self::new(format!("{what} is not implemented"));
        error.pairs
            .push(("category".to_string(), "not_implemented".to_string()));
        error
    }

    /// Append a `(name, value)` context pair.
    ///
    /// # Panics
    ///
    /// Panics when called on a frozen error; mutating a frozen error is a
    /// programming error.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        assert!(!self.frozen, "attempt to change a frozen error");
        self.pairs.push((name.into(), value.into()));
        self
    }

    /// Get the value of the first pair with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The description this error was created with.
    pub fn description(&self) -> &str {
        self.get("description").unwrap_or("")
    }

    /// All context pairs, in insertion order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Freeze this error, disallowing further mutation.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether this error has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Attach a child error, freezing it in the process.
    pub fn set_child(&mut self, mut child: Error) -> &mut Self {
        child.freeze();
        self.child = Some(Box::new(child));
        self
    }

    /// The nested child error, if any.
    pub fn child(&self) -> Option<&Error> {
        self.child.as_deref()
    }

    /// Whether a child error is attached.
    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Drop the child error.
    pub fn clear_child(&mut self) -> &mut Self {
        self.child = None;
        self
    }

    /// Whether this error, or any of its children, captured a foreign error.
    pub fn has_exception(&self) -> bool {
        if self.child().is_some_and(Error::has_exception) {
            return true;
        }
        self.exception.is_some()
    }

    /// The captured foreign error closest to the point of failure.
    pub fn exception(&self) -> Option<&anyhow::Error> {
        if let Some(child) = self.child() {
            if child.has_exception() {
                return child.exception();
            }
        }
        self.exception.as_deref()
    }

    fn render(&self, prefix: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(description) = self.get("description") else {
            return writeln!(f, "{prefix}Invalid Error");
        };
        writeln!(f, "{prefix}Description: {description}")?;
        for (name, value) in &self.pairs {
            if name != "description" {
                writeln!(f, "{prefix}'{name}', '{value}'")?;
            }
        }
        if let Some(exception) = &self.exception {
            writeln!(f, "{prefix}Exception message: {exception}")?;
        }
        if let Some(child) = &self.child {
            child.render(&format!("{prefix}# "), f)?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render("", f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let mut error = Self::new(err.to_string());
        error.pairs.push(("category".to_string(), "system".to_string()));
        error.pairs.push((
            "error_code".to_string(),
            err.raw_os_error()
                .map_or_else(|| format!("{:?}", err.kind()), |code| code.to_string()),
        ));
        error.exception = Some(Arc::new(err.into()));
        error
    }
}
