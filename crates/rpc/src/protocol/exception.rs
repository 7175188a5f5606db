//! Exceptions that cross the network boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Root kind every exception is assignable to.
pub const ROOT_KIND: &str = "Exception";

/// Kind marking an exception as unchecked.
///
/// Unchecked exceptions may escape a method that does not declare them.
pub const RUNTIME_KIND: &str = "RuntimeException";

/// Kind used to wrap an exception the calling method does not declare.
pub const UNDECLARED_KIND: &str = "UndeclaredThrowable";

/// A remotely raised (or locally reconstructed) exception.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Exception {
    kind: String,
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    supertypes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stack_trace: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<Exception>>,
}

impl Exception {
    /// Creates an exception of `kind` with a message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: Some(message.into()),
            supertypes: Vec::new(),
            stack_trace: Vec::new(),
            cause: None,
        }
    }

    /// Creates an exception of `kind` without a message.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: None,
            supertypes: Vec::new(),
            stack_trace: Vec::new(),
            cause: None,
        }
    }

    /// Wraps `cause` in an [`UNDECLARED_KIND`] exception.
    #[must_use]
    pub fn undeclared(cause: Self) -> Self {
        let message = format!("undeclared exception {}", cause.kind);
        Self::new(UNDECLARED_KIND, message)
            .with_supertype(RUNTIME_KIND)
            .with_cause(cause)
    }

    /// Adds a kind this exception is assignable to.
    #[must_use]
    pub fn with_supertype(mut self, kind: impl Into<String>) -> Self {
        self.supertypes.push(kind.into());
        self
    }

    /// Sets the cause.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Appends a stack frame description.
    #[must_use]
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.stack_trace.push(frame.into());
        self
    }

    /// The exception kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Kinds this exception is assignable to besides its own and the root.
    #[must_use]
    pub fn supertypes(&self) -> &[String] {
        &self.supertypes
    }

    /// Local stack frames. Always empty once the exception has crossed the wire.
    #[must_use]
    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }

    /// The cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }

    /// Whether this exception can be caught as `kind`.
    #[must_use]
    pub fn is_assignable_to(&self, kind: &str) -> bool {
        kind == ROOT_KIND || self.kind == kind || self.supertypes.iter().any(|s| s == kind)
    }

    /// Whether this exception may escape a method that does not declare it.
    #[must_use]
    pub fn is_unchecked(&self) -> bool {
        self.kind == RUNTIME_KIND || self.supertypes.iter().any(|s| s == RUNTIME_KIND)
    }

    /// Copy with the stack trace removed here and in every cause.
    #[must_use]
    pub fn without_stack_trace(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            message: self.message.clone(),
            supertypes: self.supertypes.clone(),
            stack_trace: Vec::new(),
            cause: self
                .cause
                .as_ref()
                .map(|cause| Box::new(cause.without_stack_trace())),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

impl std::error::Error for Exception {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignability() {
        let e = Exception::new("FileNotFound", "missing").with_supertype("IoError");

        assert!(e.is_assignable_to("FileNotFound"));
        assert!(e.is_assignable_to("IoError"));
        assert!(e.is_assignable_to(ROOT_KIND));
        assert!(!e.is_assignable_to("ParseError"));
        assert!(!e.is_unchecked());
    }

    #[test]
    fn test_strip_stack_trace_recurses() {
        let e = Exception::new("Outer", "o")
            .with_frame("outer.rs:1")
            .with_cause(Exception::new("Inner", "i").with_frame("inner.rs:2"));

        let stripped = e.without_stack_trace();

        assert!(stripped.stack_trace().is_empty());
        assert!(stripped.cause().unwrap().stack_trace().is_empty());
        assert_eq!(stripped.cause().unwrap().message(), Some("i"));
    }

    #[test]
    fn test_undeclared_wraps_cause() {
        let wrapped = Exception::undeclared(Exception::new("Secret", "boom"));

        assert_eq!(wrapped.kind(), UNDECLARED_KIND);
        assert!(wrapped.is_unchecked());
        assert_eq!(wrapped.cause().unwrap().kind(), "Secret");
    }
}
