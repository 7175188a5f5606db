//! Binding between local method signatures and wire identifiers.
//!
//! A [`DispatchTable`] is built once per interface. Methods are sorted by
//! their canonical signature so that names and ordinals come out the same on
//! every process that builds the table from the same [`InterfaceDef`].
//! Overloads keep the plain name for the first signature in that order and
//! get `name$1`, `name$2`, ... for the rest.

use crate::error::{ConfigError, DispatchError};
use crate::protocol::TypeDesc;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// Separator between a method name and its overload suffix.
pub const OVERLOAD_SEPARATOR: char = '$';

/// Static description of one interface method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    name: String,
    params: Vec<TypeDesc>,
    returns: TypeDesc,
    throws: Vec<String>,
    asynchronous: bool,
}

impl MethodSignature {
    /// Method `name` taking no arguments and returning `void`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: TypeDesc::Void,
            throws: Vec::new(),
            asynchronous: false,
        }
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, ty: TypeDesc) -> Self {
        self.params.push(ty);
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, ty: TypeDesc) -> Self {
        self.returns = ty;
        self
    }

    /// Declares a checked exception kind.
    #[must_use]
    pub fn throws(mut self, kind: impl Into<String>) -> Self {
        self.throws.push(kind.into());
        self
    }

    /// Marks the method as returning an awaitable result.
    #[must_use]
    pub const fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter types in declaration order.
    #[must_use]
    pub fn params(&self) -> &[TypeDesc] {
        &self.params
    }

    /// Return type.
    #[must_use]
    pub const fn return_type(&self) -> &TypeDesc {
        &self.returns
    }

    /// Declared checked exception kinds.
    #[must_use]
    pub fn declared_exceptions(&self) -> &[String] {
        &self.throws
    }

    /// Whether the method returns an awaitable result.
    #[must_use]
    pub const fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Canonical form, `name(p1,p2)->ret`.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")->{}", self.returns)
    }
}

/// An interface: a name and its methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDef {
    name: String,
    methods: Vec<MethodSignature>,
    require_async: bool,
}

impl InterfaceDef {
    /// Interface with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            require_async: false,
        }
    }

    /// Adds a method.
    #[must_use]
    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }

    /// Requires every method to be asynchronous.
    #[must_use]
    pub const fn require_async(mut self) -> Self {
        self.require_async = true;
        self
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared methods, in declaration order.
    #[must_use]
    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }
}

/// One method's wire binding.
#[derive(Debug, PartialEq, Eq)]
pub struct DispatchEntry {
    wire_name: String,
    ordinal: u16,
    signature: MethodSignature,
}

impl DispatchEntry {
    /// Name used by the text protocol.
    #[must_use]
    pub fn wire_name(&self) -> &str {
        &self.wire_name
    }

    /// Position used by the binary protocol.
    #[must_use]
    pub const fn ordinal(&self) -> u16 {
        self.ordinal
    }

    /// Local signature.
    #[must_use]
    pub const fn signature(&self) -> &MethodSignature {
        &self.signature
    }
}

/// Bidirectional map between signatures and wire identifiers.
#[derive(Debug)]
pub struct DispatchTable {
    interface: InterfaceDef,
    entries: Vec<Arc<DispatchEntry>>,
    by_name: HashMap<String, Arc<DispatchEntry>>,
    by_method: HashMap<String, Arc<DispatchEntry>>,
}

fn is_method_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl DispatchTable {
    /// Builds the table for `interface`.
    ///
    /// # Errors
    ///
    /// Returns an error if a method cannot be exposed: bad name, `void`
    /// parameter or element type, duplicate signature, a synchronous method on an interface
    /// that requires async ones, or more methods than an ordinal can address.
    pub fn for_interface(interface: &InterfaceDef) -> Result<Self, ConfigError> {
        let invalid = |method: &MethodSignature, reason: &str| ConfigError::InvalidMethod {
            interface: interface.name.clone(),
            method: method.name.clone(),
            reason: reason.to_string(),
        };

        if interface.methods.len() > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::TooManyMethods(interface.name.clone()));
        }

        for method in &interface.methods {
            if !is_method_name(&method.name) {
                return Err(invalid(method, "name must be an identifier"));
            }
            if method.params.contains(&TypeDesc::Void) {
                return Err(invalid(method, "parameters cannot be void"));
            }
            if method
                .params
                .iter()
                .chain(std::iter::once(&method.returns))
                .any(TypeDesc::has_void_element)
            {
                return Err(invalid(method, "void cannot be an element type"));
            }
            if interface.require_async && !method.asynchronous {
                return Err(invalid(method, "return type must be awaitable"));
            }
        }

        let mut sorted: Vec<(String, &MethodSignature)> = interface
            .methods
            .iter()
            .map(|method| (method.canonical(), method))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(pair) = sorted.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(ConfigError::DuplicateSignature {
                interface: interface.name.clone(),
                signature: pair[0].0.clone(),
            });
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut entries = Vec::with_capacity(sorted.len());
        let mut by_name = HashMap::with_capacity(sorted.len());
        let mut by_method = HashMap::with_capacity(sorted.len());

        for (ordinal, (canonical, method)) in sorted.into_iter().enumerate() {
            let count = seen.entry(method.name.as_str()).or_insert(0);
            let wire_name = if *count == 0 {
                method.name.clone()
            } else {
                format!("{}{OVERLOAD_SEPARATOR}{count}", method.name)
            };
            *count += 1;

            let ordinal =
                u16::try_from(ordinal).map_err(|_| ConfigError::TooManyMethods(interface.name.clone()))?;
            let entry = Arc::new(DispatchEntry {
                wire_name: wire_name.clone(),
                ordinal,
                signature: method.clone(),
            });
            by_name.insert(wire_name, Arc::clone(&entry));
            by_method.insert(canonical, Arc::clone(&entry));
            entries.push(entry);
        }

        debug!(
            interface = %interface.name,
            methods = entries.len(),
            "Built dispatch table"
        );

        Ok(Self {
            interface: interface.clone(),
            entries,
            by_name,
            by_method,
        })
    }

    /// The interface this table was built from.
    #[must_use]
    pub const fn interface(&self) -> &InterfaceDef {
        &self.interface
    }

    /// Entries in ordinal order.
    #[must_use]
    pub fn entries(&self) -> &[Arc<DispatchEntry>] {
        &self.entries
    }

    /// Entry for a wire name.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownMethod`] if no method has that name.
    pub fn by_name(&self, wire_name: &str) -> Result<&Arc<DispatchEntry>, DispatchError> {
        self.by_name
            .get(wire_name)
            .ok_or_else(|| DispatchError::UnknownMethod(wire_name.to_string()))
    }

    /// Entry for a binary ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownOrdinal`] if the ordinal is out of range.
    pub fn by_ordinal(&self, ordinal: u16) -> Result<&Arc<DispatchEntry>, DispatchError> {
        self.entries
            .get(usize::from(ordinal))
            .ok_or(DispatchError::UnknownOrdinal(ordinal))
    }

    /// Entry for a local signature.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownSignature`] if the signature is not
    /// part of the interface.
    pub fn by_method(&self, method: &MethodSignature) -> Result<&Arc<DispatchEntry>, DispatchError> {
        let canonical = method.canonical();
        self.by_method
            .get(&canonical)
            .ok_or(DispatchError::UnknownSignature(canonical))
    }

    /// Entry for the only method called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownMethod`] if there is no such method or
    /// the name is overloaded.
    pub fn by_method_name(&self, name: &str) -> Result<&Arc<DispatchEntry>, DispatchError> {
        let mut matches = self
            .entries
            .iter()
            .filter(|entry| entry.signature.name == name);
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry),
            _ => Err(DispatchError::UnknownMethod(name.to_string())),
        }
    }
}

/// Tables memoised per interface name.
#[derive(Default)]
pub struct DispatchCache {
    tables: DashMap<String, Arc<DispatchTable>>,
}

impl DispatchCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for `interface`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be built, or a different
    /// interface with the same name was cached earlier.
    pub fn get_or_build(&self, interface: &InterfaceDef) -> Result<Arc<DispatchTable>, ConfigError> {
        if let Some(table) = self.tables.get(&interface.name) {
            return Self::check_same(&table, interface);
        }

        let built = Arc::new(DispatchTable::for_interface(interface)?);
        let table = self
            .tables
            .entry(interface.name.clone())
            .or_insert(built)
            .clone();
        Self::check_same(&table, interface)
    }

    fn check_same(
        table: &Arc<DispatchTable>,
        interface: &InterfaceDef,
    ) -> Result<Arc<DispatchTable>, ConfigError> {
        if table.interface == *interface {
            Ok(Arc::clone(table))
        } else {
            Err(ConfigError::InvalidSetting {
                name: "interface",
                reason: format!("conflicting definitions of {}", interface.name),
            })
        }
    }

    /// Number of cached tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Primitive;

    const INT: TypeDesc = TypeDesc::Primitive(Primitive::Int);

    fn calculator() -> InterfaceDef {
        InterfaceDef::new("Calculator")
            .method(MethodSignature::new("sub").param(INT).param(INT).returns(INT))
            .method(
                MethodSignature::new("add")
                    .param(TypeDesc::Primitive(Primitive::Double))
                    .param(TypeDesc::Primitive(Primitive::Double))
                    .returns(TypeDesc::Primitive(Primitive::Double)),
            )
            .method(MethodSignature::new("add").param(INT).param(INT).returns(INT))
    }

    #[test]
    fn test_overloads_get_suffixes_in_canonical_order() {
        let table = DispatchTable::for_interface(&calculator()).unwrap();

        let names: Vec<_> = table.entries().iter().map(|e| e.wire_name()).collect();
        assert_eq!(names, ["add", "add$1", "sub"]);

        let add_f64 = table.by_name("add").unwrap();
        assert_eq!(add_f64.signature().canonical(), "add(f64,f64)->f64");
        assert_eq!(add_f64.ordinal(), 0);
        assert_eq!(table.by_ordinal(2).unwrap().wire_name(), "sub");
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let mut reversed = InterfaceDef::new("Calculator");
        for method in calculator().methods().iter().rev() {
            reversed = reversed.method(method.clone());
        }

        let a = DispatchTable::for_interface(&calculator()).unwrap();
        let b = DispatchTable::for_interface(&reversed).unwrap();

        for (x, y) in a.entries().iter().zip(b.entries()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn test_by_method_round_trips() {
        let table = DispatchTable::for_interface(&calculator()).unwrap();
        let sig = MethodSignature::new("add").param(INT).param(INT).returns(INT);

        let entry = table.by_method(&sig).unwrap();

        assert_eq!(entry.wire_name(), "add$1");
        assert_eq!(table.by_name("add$1").unwrap().signature(), &sig);
        assert!(matches!(
            table.by_method(&MethodSignature::new("mul")),
            Err(DispatchError::UnknownSignature(_))
        ));
        assert!(table.by_method_name("add").is_err());
        assert_eq!(table.by_method_name("sub").unwrap().ordinal(), 2);
    }

    #[test]
    fn test_rejects_invalid_interfaces() {
        let duplicate = InterfaceDef::new("Dup")
            .method(MethodSignature::new("f").param(INT))
            .method(MethodSignature::new("f").param(INT));
        assert!(matches!(
            DispatchTable::for_interface(&duplicate),
            Err(ConfigError::DuplicateSignature { .. })
        ));

        let void_param = InterfaceDef::new("V").method(MethodSignature::new("f").param(TypeDesc::Void));
        assert!(matches!(
            DispatchTable::for_interface(&void_param),
            Err(ConfigError::InvalidMethod { .. })
        ));

        let void_element = InterfaceDef::new("E")
            .method(MethodSignature::new("f").returns(TypeDesc::list(TypeDesc::Void)));
        assert!(matches!(
            DispatchTable::for_interface(&void_element),
            Err(ConfigError::InvalidMethod { .. })
        ));

        let bad_name = InterfaceDef::new("N").method(MethodSignature::new("f$1"));
        assert!(DispatchTable::for_interface(&bad_name).is_err());
    }

    #[test]
    fn test_async_requirement_checked_eagerly() {
        let sync_method = InterfaceDef::new("Async")
            .require_async()
            .method(MethodSignature::new("ping"));

        let err = DispatchTable::for_interface(&sync_method).unwrap_err();
        assert!(err.to_string().contains("awaitable"));

        let ok = InterfaceDef::new("Async")
            .require_async()
            .method(MethodSignature::new("ping").asynchronous());
        assert!(DispatchTable::for_interface(&ok).is_ok());
    }

    #[test]
    fn test_cache_is_idempotent() {
        let cache = DispatchCache::new();

        let a = cache.get_or_build(&calculator()).unwrap();
        let b = cache.get_or_build(&calculator()).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(cache.get_or_build(&InterfaceDef::new("Calculator")).is_err());
    }
}
