//! Schema identity cache and per-file type libraries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{ExtentSchema, INDEX_SCHEMA_TEXT};
use crate::error::{ExtentError, Result};

// ── TypeRegistry ────────────────────────────────────────────────────

/// Caches schemas by their exact text so that repeated registration
/// returns the same `Arc` (and therefore the same schema identity).
///
/// Created explicitly and shared as `Arc<TypeRegistry>` by every source,
/// sink and pipeline stage that resolves schemas.
#[derive(Debug)]
pub struct TypeRegistry {
    by_text: Mutex<HashMap<String, Arc<ExtentSchema>>>,
    index: Arc<ExtentSchema>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let index = Arc::new(
            ExtentSchema::from_text(INDEX_SCHEMA_TEXT).expect("built-in index schema must parse"),
        );
        let mut by_text = HashMap::new();
        by_text.insert(INDEX_SCHEMA_TEXT.to_string(), Arc::clone(&index));
        Self {
            by_text: Mutex::new(by_text),
            index,
        }
    }

    /// Parse and cache `text`, or return the schema already registered
    /// for byte-identical text.
    pub fn register(&self, text: &str) -> Result<Arc<ExtentSchema>> {
        if let Some(existing) = self.by_text.lock().unwrap().get(text) {
            return Ok(Arc::clone(existing));
        }

        // Parse outside the lock; a concurrent registration of the same
        // text keeps whichever entry landed first.
        let parsed = Arc::new(ExtentSchema::from_text(text)?);
        let mut by_text = self.by_text.lock().unwrap();
        let entry = by_text.entry(text.to_string()).or_insert(parsed);
        Ok(Arc::clone(entry))
    }

    /// Schema of the trailing index extent.
    pub fn index_schema(&self) -> &Arc<ExtentSchema> {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.by_text.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached schema except the built-in index type.
    ///
    /// Schemas already handed out stay valid; text registered afterwards
    /// gets a new identity.
    pub fn clear(&self) {
        let mut by_text = self.by_text.lock().unwrap();
        by_text.clear();
        by_text.insert(INDEX_SCHEMA_TEXT.to_string(), Arc::clone(&self.index));
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── TypeLibrary ─────────────────────────────────────────────────────

/// Name → schema mapping for the types used by one file.
#[derive(Debug, Clone, Default)]
pub struct TypeLibrary {
    types: BTreeMap<String, Arc<ExtentSchema>>,
}

impl TypeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a schema. Re-adding the same identity is a no-op; a different
    /// schema under a name already in use is rejected.
    pub fn add(&mut self, schema: Arc<ExtentSchema>) -> Result<()> {
        if let Some(existing) = self.types.get(schema.name()) {
            if Arc::ptr_eq(existing, &schema) {
                return Ok(());
            }
            return Err(ExtentError::Schema(format!(
                "type '{}' already registered with a different definition",
                schema.name()
            )));
        }
        self.types.insert(schema.name().to_string(), schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ExtentSchema>> {
        self.types.get(name)
    }

    pub fn contains(&self, schema: &Arc<ExtentSchema>) -> bool {
        self.types
            .get(schema.name())
            .is_some_and(|s| Arc::ptr_eq(s, schema))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Schemas in name order.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<ExtentSchema>> {
        self.types.values()
    }

    fn unique_match<F>(&self, what: &str, pattern: &str, pred: F) -> Result<Option<&Arc<ExtentSchema>>>
    where
        F: Fn(&str) -> bool,
    {
        let mut found = None;
        for schema in self.types.values().filter(|s| !s.is_internal()) {
            if pred(schema.name()) {
                if found.is_some() {
                    return Err(ExtentError::UnknownType(format!(
                        "{} '{}' matches more than one type",
                        what, pattern
                    )));
                }
                found = Some(schema);
            }
        }
        Ok(found)
    }

    /// The single user type whose name starts with `prefix`.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Option<&Arc<ExtentSchema>>> {
        self.unique_match("prefix", prefix, |name| name.starts_with(prefix))
    }

    /// The single user type whose name contains `needle`.
    pub fn get_by_substring(&self, needle: &str) -> Result<Option<&Arc<ExtentSchema>>> {
        self.unique_match("substring", needle, |name| name.contains(needle))
    }

    /// Resolve a user-supplied type match: exact name, then unique prefix,
    /// then unique substring. `*` selects the only user type in the file.
    pub fn get_match(&self, pattern: &str) -> Result<&Arc<ExtentSchema>> {
        if pattern == "*" {
            return self
                .unique_match("pattern", pattern, |_| true)?
                .ok_or_else(|| ExtentError::UnknownType("file holds no user types".into()));
        }
        if let Some(schema) = self.get(pattern) {
            return Ok(schema);
        }
        if let Some(schema) = self.get_by_prefix(pattern)? {
            return Ok(schema);
        }
        self.get_by_substring(pattern)?
            .ok_or_else(|| ExtentError::UnknownType(format!("no type matches '{}'", pattern)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text(name: &str) -> String {
        format!(
            "<ExtentType name=\"{}\"><field type=\"int64\" name=\"x\"/></ExtentType>",
            name
        )
    }

    #[test]
    fn test_identical_text_shares_identity() {
        let registry = TypeRegistry::new();
        let a = registry.register(&text("A")).unwrap();
        let b = registry.register(&text("A")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // whitespace difference gives a distinct identity
        let c = registry.register(&format!("{}\n", text("A"))).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_registration_error_is_not_cached() {
        let registry = TypeRegistry::new();
        let before = registry.len();
        assert!(registry.register("<ExtentType/>").is_err());
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_clear_keeps_index_schema() {
        let registry = TypeRegistry::new();
        let a = registry.register(&text("A")).unwrap();
        registry.clear();
        assert_eq!(registry.len(), 1);
        let again = registry.register(&text("A")).unwrap();
        assert!(!Arc::ptr_eq(&a, &again));
        let index = registry.register(INDEX_SCHEMA_TEXT).unwrap();
        assert!(Arc::ptr_eq(&index, registry.index_schema()));
    }

    #[test]
    fn test_library_lookups() {
        let registry = TypeRegistry::new();
        let mut library = TypeLibrary::new();
        library.add(registry.register(&text("Trace::NFS::common")).unwrap()).unwrap();
        library.add(registry.register(&text("Trace::NFS::attr-ops")).unwrap()).unwrap();
        library.add(registry.register(&text("Trace::Disk")).unwrap()).unwrap();
        library.add(Arc::clone(registry.index_schema())).unwrap();

        assert_eq!(library.get_match("Trace::Disk").unwrap().name(), "Trace::Disk");
        assert_eq!(library.get_match("attr").unwrap().name(), "Trace::NFS::attr-ops");
        assert!(library.get_by_prefix("Trace::NFS").is_err());
        assert!(matches!(
            library.get_match("Missing"),
            Err(ExtentError::UnknownType(_))
        ));
        // internal types never match a pattern
        assert!(library.get_by_substring("ExtentIndex").unwrap().is_none());
        assert!(library.get_match("*").is_err());
    }

    #[test]
    fn test_library_rejects_conflicting_definition() {
        let registry = TypeRegistry::new();
        let mut library = TypeLibrary::new();
        let a = registry.register(&text("A")).unwrap();
        library.add(Arc::clone(&a)).unwrap();
        library.add(Arc::clone(&a)).unwrap();

        let other = registry
            .register("<ExtentType name=\"A\"><field type=\"byte\" name=\"y\"/></ExtentType>")
            .unwrap();
        assert!(matches!(library.add(other), Err(ExtentError::Schema(_))));
        assert!(library.contains(&a));
    }
}
