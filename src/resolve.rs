use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::{Error, ErrorCode, Result};
use crate::value::{Symbol, Value};

/// The single boundary between the machine and the host's type universe.
///
/// `import_module` answers whether the module exists at all; `lookup` walks
/// the qualified name inside it. Under protocol >= 4 the name may be dotted;
/// below that only a top-level attribute is legal.
pub trait ClassResolver {
    fn import_module(&self, module: &str) -> Result<()>;
    fn lookup(&self, module: &str, qualname: &str, protocol: u8) -> Result<Value>;
}

/// An in-process resolver backed by an explicit registry.
///
/// With `synthesize` on (the debugger default) unknown names resolve to
/// opaque symbols, so any stream can be stepped without a host environment.
/// Hermetic tests turn it off and register exactly what they expect.
pub struct RegistryResolver {
    modules: BTreeMap<String, BTreeMap<String, Value>>,
    synthesize: bool,
}

impl RegistryResolver {
    /// An empty, strict resolver: every lookup fails until registered.
    pub fn strict() -> Self {
        RegistryResolver {
            modules: BTreeMap::new(),
            synthesize: false,
        }
    }

    /// A resolver that synthesizes opaque symbols for unknown names.
    pub fn synthesizing() -> Self {
        RegistryResolver {
            modules: BTreeMap::new(),
            synthesize: true,
        }
    }

    /// Register a value under `module`.`qualname`. Dotted qualnames are
    /// registered under their full path.
    pub fn register(&mut self, module: &str, qualname: &str, value: Value) -> &mut Self {
        self.modules
            .entry(module.to_owned())
            .or_default()
            .insert(qualname.to_owned(), value);
        self
    }

    /// Convenience: register a plain symbol and return it for later hooks.
    pub fn register_symbol(&mut self, module: &str, qualname: &str) -> Rc<Symbol> {
        let sym = Rc::new(Symbol::new(module, qualname));
        self.register(module, qualname, Value::Global(sym.clone()));
        sym
    }
}

impl Default for RegistryResolver {
    fn default() -> Self {
        RegistryResolver::synthesizing()
    }
}

impl ClassResolver for RegistryResolver {
    fn import_module(&self, module: &str) -> Result<()> {
        if self.synthesize || self.modules.contains_key(module) {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::Resolution(format!(
                "no module named '{module}'"
            ))))
        }
    }

    fn lookup(&self, module: &str, qualname: &str, protocol: u8) -> Result<Value> {
        if protocol >= 4 {
            if qualname.split('.').any(|part| part == "<locals>") {
                return Err(Error::new(ErrorCode::Resolution(format!(
                    "can't get local attribute {qualname:?} on module {module:?}"
                ))));
            }
        } else if qualname.contains('.') {
            return Err(Error::new(ErrorCode::Resolution(format!(
                "module {module:?} has no attribute {qualname:?}"
            ))));
        }
        if let Some(entries) = self.modules.get(module) {
            if let Some(value) = entries.get(qualname) {
                return Ok(value.clone());
            }
        }
        if self.synthesize {
            return Ok(Value::Global(Rc::new(Symbol::new(module, qualname))));
        }
        Err(Error::new(ErrorCode::Resolution(format!(
            "can't get attribute {qualname:?} on module {module:?}"
        ))))
    }
}

/// Process-wide registry mapping extension codes to (module, name) pairs.
/// Append-only in practice; safe for repeated reads.
static EXTENSION_REGISTRY: Lazy<RwLock<BTreeMap<i64, (String, String)>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Register an extension code for EXT1/EXT2/EXT4 resolution.
pub fn register_extension(code: i64, module: &str, name: &str) {
    EXTENSION_REGISTRY
        .write()
        .expect("extension registry poisoned")
        .insert(code, (module.to_owned(), name.to_owned()));
}

/// Look up an extension code in the process-wide registry.
pub fn registered_extension(code: i64) -> Option<(String, String)> {
    EXTENSION_REGISTRY
        .read()
        .expect("extension registry poisoned")
        .get(&code)
        .cloned()
}

/// Cache of resolved extension values. Resolved values are not thread-safe,
/// so the cache is per-machine by default; cloning the handle shares it
/// between machines on the same thread.
#[derive(Clone, Default)]
pub struct ExtensionCache(Rc<RefCell<BTreeMap<i64, Value>>>);

impl ExtensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: i64) -> Option<Value> {
        self.0.borrow().get(&code).cloned()
    }

    pub fn insert(&self, code: i64, value: Value) {
        self.0.borrow_mut().insert(code, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_resolver_fails_unknown_lookups() {
        let resolver = RegistryResolver::strict();
        assert!(resolver.import_module("missing").is_err());
        let err = resolver.lookup("missing", "Thing", 4).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resolution);
    }

    #[test]
    fn synthesizing_resolver_fabricates_symbols() {
        let resolver = RegistryResolver::synthesizing();
        resolver.import_module("anything").unwrap();
        match resolver.lookup("anything", "AtAll", 4).unwrap() {
            Value::Global(sym) => {
                assert_eq!(sym.module(), "anything");
                assert_eq!(sym.qualname(), "AtAll");
            }
            other => panic!("expected symbol, got {other}"),
        }
    }

    #[test]
    fn registered_values_win_over_synthesis() {
        let mut resolver = RegistryResolver::synthesizing();
        let sym = resolver.register_symbol("m", "Klass");
        match resolver.lookup("m", "Klass", 2).unwrap() {
            Value::Global(found) => assert!(Rc::ptr_eq(&found, &sym)),
            other => panic!("expected symbol, got {other}"),
        }
    }

    #[test]
    fn dotted_names_require_protocol_4() {
        let mut resolver = RegistryResolver::strict();
        resolver.register("m", "Outer.Inner", Value::I64(1));
        assert!(resolver.lookup("m", "Outer.Inner", 4).is_ok());
        assert!(resolver.lookup("m", "Outer.Inner", 3).is_err());
    }

    #[test]
    fn locals_are_never_resolvable() {
        let resolver = RegistryResolver::synthesizing();
        assert!(resolver.lookup("m", "f.<locals>.K", 5).is_err());
    }

    #[test]
    fn extension_cache_is_shared_through_clones() {
        let cache = ExtensionCache::new();
        let other = cache.clone();
        cache.insert(7, Value::I64(7));
        assert_eq!(other.get(7), Some(Value::I64(7)));
        assert_eq!(other.get(8), None);
    }
}
