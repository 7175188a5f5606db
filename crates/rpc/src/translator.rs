//! Translation between exceptions and wire error descriptors.
//!
//! Framework kinds are registered against a reserved code and travel as the
//! bare code and message; the receiving side rebuilds a fresh instance from
//! the code alone. Every other exception travels under
//! [`codes::APPLICATION`] with the exception itself as payload.

use crate::error::{ConfigError, DispatchError, Error, ProtocolError};
use crate::protocol::exception::{RUNTIME_KIND, UNDECLARED_KIND};
use crate::protocol::message::{ErrorDescriptor, codes};
use crate::protocol::{Exception, Value};

use std::collections::HashMap;

use tracing::debug;

/// Kind used when a registered kind has no way to build itself.
pub const REMOTE_ERROR_KIND: &str = "RemoteError";

/// Constructor taking the wire message.
pub type MessageConstructor = fn(&str) -> Exception;

/// Constructor taking nothing.
pub type BareConstructor = fn() -> Exception;

/// A framework error kind with a reserved code.
#[derive(Clone, Debug)]
pub struct ErrorKind {
    code: i32,
    name: String,
    with_message: Option<MessageConstructor>,
    bare: Option<BareConstructor>,
}

impl ErrorKind {
    /// Kind `name` under `code`, with no constructors.
    pub fn new(code: i32, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            with_message: None,
            bare: None,
        }
    }

    /// Sets the message-carrying constructor.
    #[must_use]
    pub const fn with_message_constructor(mut self, constructor: MessageConstructor) -> Self {
        self.with_message = Some(constructor);
        self
    }

    /// Sets the no-argument constructor.
    #[must_use]
    pub const fn with_bare_constructor(mut self, constructor: BareConstructor) -> Self {
        self.bare = Some(constructor);
        self
    }

    /// Reserved code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Exception kind name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self, message: &str) -> Exception {
        if let Some(constructor) = self.with_message {
            return constructor(message);
        }
        if let Some(constructor) = self.bare {
            return constructor();
        }
        Exception::new(
            REMOTE_ERROR_KIND,
            format!("{} ({}): {message}", self.name, self.code),
        )
        .with_supertype(RUNTIME_KIND)
    }
}

/// Names of the built-in framework kinds.
pub mod kinds {
    /// Unparsable message.
    pub const PARSE_ERROR: &str = "ParseError";
    /// Structurally invalid request.
    pub const INVALID_REQUEST: &str = "InvalidRequest";
    /// Unknown method.
    pub const METHOD_NOT_FOUND: &str = "MethodNotFound";
    /// Bad arguments.
    pub const INVALID_ARGUMENT: &str = "InvalidArgument";
    /// Framework failure.
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// Caller not permitted.
    pub const ACCESS_DENIED: &str = "AccessDenied";
    /// Plain unchecked failure.
    pub const RUNTIME: &str = super::RUNTIME_KIND;
}

fn framework(code: i32, name: &'static str, constructor: MessageConstructor) -> ErrorKind {
    ErrorKind {
        code,
        name: name.to_string(),
        with_message: Some(constructor),
        bare: None,
    }
}

/// Maps exceptions to descriptors and back.
#[derive(Clone, Debug)]
pub struct ErrorTranslator {
    by_code: HashMap<i32, ErrorKind>,
    by_name: HashMap<String, i32>,
}

impl ErrorTranslator {
    /// Translator knowing the built-in framework kinds.
    #[must_use]
    pub fn new() -> Self {
        let builtin = [
            framework(codes::PARSE_ERROR, kinds::PARSE_ERROR, |m| {
                Exception::new(kinds::PARSE_ERROR, m).with_supertype(RUNTIME_KIND)
            }),
            framework(codes::INVALID_REQUEST, kinds::INVALID_REQUEST, |m| {
                Exception::new(kinds::INVALID_REQUEST, m).with_supertype(RUNTIME_KIND)
            }),
            framework(codes::METHOD_NOT_FOUND, kinds::METHOD_NOT_FOUND, |m| {
                Exception::new(kinds::METHOD_NOT_FOUND, m).with_supertype(RUNTIME_KIND)
            }),
            framework(codes::INVALID_ARGUMENT, kinds::INVALID_ARGUMENT, |m| {
                Exception::new(kinds::INVALID_ARGUMENT, m).with_supertype(RUNTIME_KIND)
            }),
            framework(codes::INTERNAL_ERROR, kinds::INTERNAL_ERROR, |m| {
                Exception::new(kinds::INTERNAL_ERROR, m).with_supertype(RUNTIME_KIND)
            }),
            framework(codes::ACCESS_DENIED, kinds::ACCESS_DENIED, |m| {
                Exception::new(kinds::ACCESS_DENIED, m).with_supertype(RUNTIME_KIND)
            }),
            framework(codes::RUNTIME_ERROR, kinds::RUNTIME, |m| {
                Exception::new(kinds::RUNTIME, m)
            }),
        ];

        let mut translator = Self {
            by_code: HashMap::new(),
            by_name: HashMap::new(),
        };
        for kind in builtin {
            translator.by_name.insert(kind.name.clone(), kind.code);
            translator.by_code.insert(kind.code, kind);
        }
        translator
    }

    /// Registers a custom framework kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is the application sentinel, or the code
    /// or name is already registered.
    pub fn register(&mut self, kind: ErrorKind) -> Result<(), ConfigError> {
        let reject = |reason: String| ConfigError::InvalidSetting {
            name: "error_kind",
            reason,
        };
        if kind.code == codes::APPLICATION {
            return Err(reject(format!(
                "{} is the application error code",
                codes::APPLICATION
            )));
        }
        if self.by_code.contains_key(&kind.code) {
            return Err(reject(format!("code {} is already registered", kind.code)));
        }
        if self.by_name.contains_key(&kind.name) {
            return Err(reject(format!("kind {} is already registered", kind.name)));
        }
        self.by_name.insert(kind.name.clone(), kind.code);
        self.by_code.insert(kind.code, kind);
        Ok(())
    }

    /// Registered kind for `code`.
    #[must_use]
    pub fn kind(&self, code: i32) -> Option<&ErrorKind> {
        self.by_code.get(&code)
    }

    /// Descriptor for an exception raised by a service.
    #[must_use]
    pub fn to_wire(&self, exception: &Exception) -> ErrorDescriptor {
        let message = exception.message().unwrap_or_default();
        match self.by_name.get(exception.kind()) {
            Some(code) => ErrorDescriptor::new(*code, message),
            None => ErrorDescriptor::new(codes::APPLICATION, exception.to_string())
                .with_payload(Value::Exception(exception.without_stack_trace())),
        }
    }

    /// Descriptor for a framework error raised while serving a request.
    #[must_use]
    pub fn error_to_wire(&self, error: &Error) -> ErrorDescriptor {
        match error {
            Error::Application(exception) => self.to_wire(exception),
            Error::Dispatch(DispatchError::UnknownMethod(_) | DispatchError::UnknownOrdinal(_)) => {
                ErrorDescriptor::new(codes::METHOD_NOT_FOUND, error.to_string())
            }
            Error::Dispatch(_) | Error::Codec(_) => {
                ErrorDescriptor::new(codes::INVALID_ARGUMENT, error.to_string())
            }
            Error::Protocol(_) => ErrorDescriptor::new(codes::INVALID_REQUEST, error.to_string()),
            _ => ErrorDescriptor::new(codes::INTERNAL_ERROR, error.to_string()),
        }
    }

    /// Rebuilds the error a caller of a method declaring `throws` sees.
    #[must_use]
    pub fn from_wire(&self, descriptor: &ErrorDescriptor, throws: &[String]) -> Error {
        if descriptor.code == codes::APPLICATION {
            return Error::Application(Self::application(descriptor, throws));
        }

        let Some(kind) = self.by_code.get(&descriptor.code) else {
            debug!(code = descriptor.code, "Error code has no registered kind");
            return Error::Application(
                Exception::new(
                    REMOTE_ERROR_KIND,
                    format!("code {}: {}", descriptor.code, descriptor.message),
                )
                .with_supertype(RUNTIME_KIND),
            );
        };

        let exception = kind.instantiate(&descriptor.message);
        match descriptor.code {
            codes::METHOD_NOT_FOUND | codes::INVALID_ARGUMENT => {
                Error::Dispatch(DispatchError::Remote(exception))
            }
            codes::PARSE_ERROR | codes::INVALID_REQUEST => {
                Error::Protocol(ProtocolError::Remote(exception))
            }
            codes::INTERNAL_ERROR => Error::Internal(descriptor.message.clone()),
            _ => Error::Application(exception),
        }
    }

    fn application(descriptor: &ErrorDescriptor, throws: &[String]) -> Exception {
        match &descriptor.payload {
            Some(Value::Exception(cause)) => {
                let declared = throws.iter().any(|kind| cause.is_assignable_to(kind));
                if declared || cause.is_unchecked() {
                    cause.clone()
                } else {
                    Exception::undeclared(cause.clone())
                }
            }
            other => {
                let found = other
                    .as_ref()
                    .map_or_else(|| "no payload".to_string(), Value::describe);
                Exception::new(
                    UNDECLARED_KIND,
                    format!(
                        "application error without an exception payload ({found}): {}",
                        descriptor.message
                    ),
                )
                .with_supertype(RUNTIME_KIND)
            }
        }
    }
}

impl Default for ErrorTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_kind_travels_as_code() {
        let translator = ErrorTranslator::new();
        let denied = Exception::new(kinds::ACCESS_DENIED, "no");

        let descriptor = translator.to_wire(&denied);

        assert_eq!(descriptor.code, codes::ACCESS_DENIED);
        assert_eq!(descriptor.payload, None);

        let error = translator.from_wire(&descriptor, &[]);
        let rebuilt = error.exception().unwrap();
        assert_eq!(rebuilt.kind(), kinds::ACCESS_DENIED);
        assert_eq!(rebuilt.message(), Some("no"));
    }

    #[test]
    fn test_declared_exception_reconstructed() {
        let translator = ErrorTranslator::new();
        let thrown = Exception::new("E", "boom").with_frame("server.rs:7");

        let descriptor = translator.to_wire(&thrown);
        assert_eq!(descriptor.code, codes::APPLICATION);

        let error = translator.from_wire(&descriptor, &["E".to_string()]);
        let Error::Application(exception) = error else {
            panic!("expected application error, got {error:?}");
        };
        assert_eq!(exception.kind(), "E");
        assert_eq!(exception.message(), Some("boom"));
        assert!(exception.stack_trace().is_empty());
    }

    #[test]
    fn test_undeclared_checked_exception_wrapped() {
        let translator = ErrorTranslator::new();
        let descriptor = translator.to_wire(&Exception::new("Secret", "leak"));

        let error = translator.from_wire(&descriptor, &["Other".to_string()]);

        let exception = error.exception().unwrap();
        assert_eq!(exception.kind(), UNDECLARED_KIND);
        assert_eq!(exception.cause().unwrap().kind(), "Secret");
    }

    #[test]
    fn test_supertype_counts_as_declared() {
        let translator = ErrorTranslator::new();
        let descriptor =
            translator.to_wire(&Exception::new("FileNotFound", "x").with_supertype("IoError"));

        let error = translator.from_wire(&descriptor, &["IoError".to_string()]);

        assert_eq!(error.exception().unwrap().kind(), "FileNotFound");
    }

    #[test]
    fn test_unchecked_exception_passes_undeclared() {
        let translator = ErrorTranslator::new();
        let descriptor = translator
            .to_wire(&Exception::new("IllegalState", "bad").with_supertype(RUNTIME_KIND));

        let error = translator.from_wire(&descriptor, &[]);

        assert_eq!(error.exception().unwrap().kind(), "IllegalState");
    }

    #[test]
    fn test_non_exception_payload_described() {
        let translator = ErrorTranslator::new();
        let descriptor = ErrorDescriptor::new(codes::APPLICATION, "weird")
            .with_payload(Value::String("not an exception".to_string()));

        let error = translator.from_wire(&descriptor, &[]);

        let exception = error.exception().unwrap();
        assert_eq!(exception.kind(), UNDECLARED_KIND);
        assert!(exception.message().unwrap().contains("string"));
    }

    #[test]
    fn test_error_categories() {
        let translator = ErrorTranslator::new();

        let not_found = ErrorDescriptor::new(codes::METHOD_NOT_FOUND, "nope");
        assert!(matches!(
            translator.from_wire(&not_found, &[]),
            Error::Dispatch(DispatchError::Remote(_))
        ));

        let parse = ErrorDescriptor::new(codes::PARSE_ERROR, "garbage");
        assert!(matches!(
            translator.from_wire(&parse, &[]),
            Error::Protocol(ProtocolError::Remote(_))
        ));

        let internal = ErrorDescriptor::new(codes::INTERNAL_ERROR, "oops");
        assert!(matches!(translator.from_wire(&internal, &[]), Error::Internal(m) if m == "oops"));
    }

    #[test]
    fn test_custom_kind_constructor_fallbacks() {
        let mut translator = ErrorTranslator::new();
        translator
            .register(ErrorKind::new(-32010, "Throttled").with_bare_constructor(|| {
                Exception::bare("Throttled")
            }))
            .unwrap();
        translator.register(ErrorKind::new(-32011, "Opaque")).unwrap();

        let throttled = translator.from_wire(&ErrorDescriptor::new(-32010, "slow down"), &[]);
        assert_eq!(throttled.exception().unwrap(), &Exception::bare("Throttled"));

        let opaque = translator.from_wire(&ErrorDescriptor::new(-32011, "?"), &[]);
        assert_eq!(opaque.exception().unwrap().kind(), REMOTE_ERROR_KIND);

        assert!(translator.register(ErrorKind::new(codes::APPLICATION, "App")).is_err());
        assert!(translator.register(ErrorKind::new(-32010, "Again")).is_err());
    }
}
