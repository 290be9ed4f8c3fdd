//! `Registry` — the in-process `name -> URI` map a `NameServer` exposes.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;

use pyro_core::error::NamingError;
use pyro_core::uri::Uri;

/// A concurrent name table guarded entry-by-entry rather than behind one
/// coarse lock: `DashMap`'s sharded locking gives "no iteration while
/// mutation occurs" on any single shard for free, the same property
/// `LocationStore` relies on for its AOR table.
#[derive(Debug, Default)]
pub struct Registry {
    names: DashMap<String, Uri>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Insert `name -> uri`. Fails if `name` is already registered.
    pub fn register(&self, name: impl Into<String>, uri: Uri) -> Result<(), NamingError> {
        let name = name.into();
        match self.names.entry(name.clone()) {
            Entry::Occupied(_) => Err(NamingError::NameAlreadyRegistered { name }),
            Entry::Vacant(vacant) => {
                vacant.insert(uri);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Uri, NamingError> {
        self.names
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NamingError::UnknownName { name: name.to_string() })
    }

    /// Idempotent: removing a name that isn't registered is not an error.
    pub fn remove(&self, name: &str) {
        self.names.remove(name);
    }

    /// List entries matching at most one of `prefix` or `regex`. `regex`
    /// is a full match against the whole name, anchored at both ends, not
    /// an unanchored substring search. With neither filter, returns every
    /// entry.
    pub fn list(
        &self,
        prefix: Option<&str>,
        regex: Option<&str>,
    ) -> Result<Vec<(String, Uri)>, NamingError> {
        match (prefix, regex) {
            (Some(_), Some(_)) => Err(NamingError::InvalidRegex {
                pattern: regex.unwrap_or_default().to_string(),
                reason: "at most one of prefix/regex may be given".to_string(),
            }),
            (Some(prefix), None) => Ok(self.snapshot_filtered(|name| name.starts_with(prefix))),
            (None, Some(pattern)) => {
                // Full-match semantics, like Python's `re.match(pattern + "$", name)`:
                // anchored at both ends, not an unanchored substring search.
                let anchored = format!("^(?:{pattern})$");
                let compiled = Regex::new(&anchored).map_err(|err| NamingError::InvalidRegex {
                    pattern: pattern.to_string(),
                    reason: err.to_string(),
                })?;
                Ok(self.snapshot_filtered(|name| compiled.is_match(name)))
            }
            (None, None) => Ok(self.snapshot_filtered(|_| true)),
        }
    }

    /// Used by clients to probe liveness; `Registry` has no internal
    /// state to check, so success just means the call returned.
    pub fn ping(&self) {}

    fn snapshot_filtered(&self, predicate: impl Fn(&str) -> bool) -> Vec<(String, Uri)> {
        self.names
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyro_core::uri::Uri;

    fn uri(object: &str) -> Uri {
        Uri::pyro(object, "127.0.0.1", 9999)
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        let registry = Registry::new();
        registry.register("echo.server", uri("echo")).unwrap();
        assert_eq!(registry.lookup("echo.server").unwrap(), uri("echo"));
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let registry = Registry::new();
        registry.register("echo.server", uri("echo")).unwrap();
        let err = registry.register("echo.server", uri("other")).unwrap_err();
        assert!(matches!(err, NamingError::NameAlreadyRegistered { .. }));
    }

    #[test]
    fn lookup_after_remove_is_unknown_name() {
        let registry = Registry::new();
        registry.register("echo.server", uri("echo")).unwrap();
        registry.remove("echo.server");
        let err = registry.lookup("echo.server").unwrap_err();
        assert!(matches!(err, NamingError::UnknownName { .. }));
    }

    #[test]
    fn remove_of_missing_name_is_not_an_error() {
        let registry = Registry::new();
        registry.remove("never.registered");
    }

    #[test]
    fn list_filters_by_prefix_or_regex_but_not_both() {
        let registry = Registry::new();
        registry.register("echo.server", uri("echo")).unwrap();
        registry.register("echo.client", uri("echoc")).unwrap();
        registry.register("other", uri("other")).unwrap();

        let by_prefix = registry.list(Some("echo."), None).unwrap();
        assert_eq!(by_prefix.len(), 2);

        let by_regex = registry.list(None, Some(r"echo\.\w+")).unwrap();
        assert_eq!(by_regex.len(), 2);

        let all = registry.list(None, None).unwrap();
        assert_eq!(all.len(), 3);

        assert!(registry.list(Some("echo."), Some("echo.*")).is_err());
    }

    #[test]
    fn regex_filter_requires_a_full_match_not_a_suffix_match() {
        let registry = Registry::new();
        registry.register("my.server", uri("echo")).unwrap();

        // "server" only matches "my.server" as a trailing substring, not
        // the whole name, so a full-match regex must reject it.
        let matches = registry.list(None, Some("server")).unwrap();
        assert!(matches.is_empty(), "unanchored suffix match must not count as a list hit");

        let matches = registry.list(None, Some(r".*\.server")).unwrap();
        assert_eq!(matches.len(), 1);
    }
}
