//! Resolved descriptor model: one immutable snapshot of services, methods, parameters,
//! queries and result mappings.

use crate::config::connection::Connection;
use crate::config::interpolate::Tokens;
use crate::sql::{Clauses, ParameterType, SqlValue};
use std::collections::HashMap;

/// Map with case-insensitive keys that remembers the spelling of the last insert.
/// Iteration follows first-insertion order; replacing a value keeps its position.
#[derive(Clone, Debug, PartialEq)]
pub struct NameMap<V> {
    entries: Vec<(String, V)>,
    /// Case-folded name to position in `entries`.
    index: HashMap<String, usize>,
}

impl<V> Default for NameMap<V> {
    fn default() -> Self {
        NameMap {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<V> NameMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_lowercase()
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.index.get(&Self::key(name)).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        let i = *self.index.get(&Self::key(name))?;
        Some(&mut self.entries[i].1)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        let name = name.into();
        match self.index.get(&Self::key(&name)) {
            Some(&i) => {
                let (_, old) = std::mem::replace(&mut self.entries[i], (name, value));
                Some(old)
            }
            None => {
                self.index.insert(Self::key(&name), self.entries.len());
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        let i = self.index.remove(&Self::key(name))?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.index.contains_key(&Self::key(name))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with their latest spelling, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, v)| v)
    }
}

/// Root of one snapshot. Services live in one arena; names and aliases index into it.
#[derive(Clone, Debug, Default)]
pub struct ServiceCollection {
    services: Vec<Service>,
    /// Case-folded service or alias name to arena index.
    index: HashMap<String, usize>,
    /// Registered names (services and aliases) in document order.
    names: Vec<(String, usize)>,
    /// Document-level errors.
    pub errors: Vec<String>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection with no services that only reports `errors`.
    pub fn failed(errors: Vec<String>) -> Self {
        ServiceCollection {
            errors,
            ..Default::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.index_of(name).map(|i| &self.services[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(&name.to_lowercase()).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// Service by arena index.
    pub fn service(&self, index: usize) -> &Service {
        &self.services[index]
    }

    /// Add a service under its own name. The caller guarantees the name is unused.
    pub(crate) fn push(&mut self, service: Service) -> usize {
        let i = self.services.len();
        self.index.insert(service.name.to_lowercase(), i);
        self.names.push((service.name.clone(), i));
        self.services.push(service);
        i
    }

    /// Register `alias` as another name for the service at `index`.
    pub(crate) fn add_alias(&mut self, alias: &str, index: usize) {
        self.index.insert(alias.to_lowercase(), index);
        self.names.push((alias.to_string(), index));
    }

    /// Every registered name (aliases included) with its service, in document order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Service)> {
        self.names.iter().map(|(name, i)| (name.as_str(), &self.services[*i]))
    }

    /// Distinct services in document order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Number of registered names, aliases included.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Service {
    pub name: String,
    /// Arena index of the base service.
    pub base: Option<usize>,
    pub tokens: Tokens,
    pub connection: Option<Connection>,
    pub parameter_types: NameMap<ParameterType>,
    pub methods: NameMap<Method>,
    pub errors: Vec<String>,
}

impl Service {
    /// True if the service or any of its methods has errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.methods.values().any(|m| !m.errors.is_empty())
    }
}

/// Where a method's connection came from. Inherited methods whose connection came from
/// their service follow a derived service's `connection` override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Service,
    Method,
}

#[derive(Clone, Debug)]
pub struct Method {
    /// Arena index of the owning service.
    pub service: usize,
    pub name: String,
    pub description: Option<String>,
    pub deprecated: Option<String>,
    pub parameter_types: NameMap<ParameterType>,
    pub parameters: NameMap<Parameter>,
    pub connection: Option<Connection>,
    pub connection_origin: ConnectionOrigin,
    pub query: Option<Query>,
    pub mapping: Option<MappingNode>,
    pub errors: Vec<String>,
}

impl Method {
    /// Fresh copy for redefinition in `service`: maps copied, errors empty.
    pub fn derive(&self, service: usize) -> Method {
        Method {
            service,
            errors: Vec::new(),
            ..self.clone()
        }
    }

    /// Compiled SQL, if the query compiled.
    pub fn sql(&self) -> Option<&str> {
        self.query.as_ref().and_then(|q| q.sql.as_deref())
    }
}

/// The two mutually exclusive ways a parameter names its type.
#[derive(Clone, Debug, PartialEq)]
pub enum ParameterTypeSource {
    /// Inline `sqlType`.
    SqlType(ParameterType),
    /// `type` referencing a named entry of `parameterTypes`.
    Named(ParameterType),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: String,
    /// Defaults to `@` + name.
    pub sql_name: String,
    pub description: Option<String>,
    pub optional: bool,
    /// Value bound when an optional parameter is absent; `Null` unless `default` is given.
    pub default: SqlValue,
    pub type_source: ParameterTypeSource,
}

impl Parameter {
    pub fn parameter_type(&self) -> &ParameterType {
        match &self.type_source {
            ParameterTypeSource::SqlType(t) | ParameterTypeSource::Named(t) => t,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub clauses: Clauses,
    /// Set only when compilation succeeded.
    pub sql: Option<String>,
    pub errors: Vec<String>,
}

/// A result column, `instance` selecting among duplicate names (0-based).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    pub name: String,
    pub instance: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnMapping {
    Column(ColumnRef),
    Object(MappingNode),
}

/// Reserved key marking the column whose NULL suppresses the enclosing object.
pub const EXISTS_KEY: &str = "<exists>";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingNode {
    pub exists: Option<ColumnRef>,
    /// Output keys in document order.
    pub columns: Vec<(String, ColumnMapping)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_map_is_case_insensitive_and_keeps_latest_spelling() {
        let mut m = NameMap::new();
        m.insert("ByYear", 1);
        assert_eq!(m.get("byyear"), Some(&1));
        assert_eq!(m.insert("BYYEAR", 2), Some(1));
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![("BYYEAR", &2)]);
        assert_eq!(m.remove("byYear"), Some(2));
        assert!(m.is_empty());
    }

    #[test]
    fn name_map_keeps_insertion_order() {
        let mut m = NameMap::new();
        for (i, name) in ["zeta", "Alpha", "mid"].iter().enumerate() {
            m.insert(*name, i);
        }
        m.insert("ALPHA", 9);
        let names: Vec<&str> = m.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "ALPHA", "mid"]);

        assert_eq!(m.remove("zeta"), Some(0));
        m.insert("omega", 3);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![("ALPHA", &9), ("mid", &2), ("omega", &3)]);
        assert_eq!(m.get("Mid"), Some(&2));
    }

    #[test]
    fn aliases_share_the_service() {
        let mut c = ServiceCollection::new();
        let i = c.push(Service {
            name: "Sales".into(),
            base: None,
            tokens: Tokens::new(),
            connection: None,
            parameter_types: NameMap::new(),
            methods: NameMap::new(),
            errors: Vec::new(),
        });
        c.add_alias("Revenue", i);
        assert_eq!(c.get("revenue").map(|s| s.name.as_str()), Some("Sales"));
        assert_eq!(c.len(), 2);
        assert_eq!(c.services().len(), 1);
        let names: Vec<&str> = c.entries().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Sales", "Revenue"]);
    }
}
