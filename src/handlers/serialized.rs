//! JSON views of descriptors for the meta and errors endpoints. Credentials never appear.

use crate::config::*;
use crate::sql::{Clauses, ParameterType, SqlDbType};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Serializes as a JSON object with keys in entry order.
#[derive(Clone, Debug, PartialEq)]
pub struct Ordered<K, V>(pub Vec<(K, V)>);

impl<K, V> Ordered<K, V> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> Default for Ordered<K, V> {
    fn default() -> Self {
        Ordered(Vec::new())
    }
}

impl<K, V> FromIterator<(K, V)> for Ordered<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Ordered(iter.into_iter().collect())
    }
}

impl<K: Serialize, V: Serialize> Serialize for Ordered<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterTypeSerialized<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(rename = "type")]
    pub type_text: String,
    pub sql_db_type: SqlDbType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
}

impl<'a> From<&'a ParameterType> for ParameterTypeSerialized<'a> {
    fn from(t: &'a ParameterType) -> Self {
        ParameterTypeSerialized {
            name: t.name.as_deref(),
            type_text: t.type_text(),
            sql_db_type: t.sql_db_type,
            description: t.description.as_deref(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSerialized<'a> {
    pub name: &'a str,
    pub sql_name: &'a str,
    /// Inline `sqlType`, when the parameter declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_type: Option<String>,
    /// Named parameter type, when the parameter references one.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_ref: Option<ParameterTypeSerialized<'a>>,
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
}

impl<'a> From<&'a Parameter> for ParameterSerialized<'a> {
    fn from(p: &'a Parameter) -> Self {
        let (sql_type, type_ref) = match &p.type_source {
            ParameterTypeSource::SqlType(t) => (Some(t.type_text()), None),
            ParameterTypeSource::Named(t) => (None, Some(ParameterTypeSerialized::from(t))),
        };
        ParameterSerialized {
            name: &p.name,
            sql_name: &p.sql_name,
            sql_type,
            type_ref,
            optional: p.optional,
            default: p.optional.then(|| p.default.to_json()),
            description: p.description.as_deref(),
        }
    }
}

pub fn parameters_map(parameters: &NameMap<Parameter>) -> Ordered<&str, ParameterSerialized<'_>> {
    parameters.iter().map(|(name, p)| (name, p.into())).collect()
}

fn parameter_types_map(types: &NameMap<ParameterType>) -> Ordered<&str, ParameterTypeSerialized<'_>> {
    types.iter().map(|(name, t)| (name, t.into())).collect()
}

fn no_errors(errors: &&[String]) -> bool {
    errors.is_empty()
}

fn column_text(c: &ColumnRef) -> String {
    if c.instance == 0 {
        c.name.clone()
    } else {
        format!("{}`{}", c.name, c.instance + 1)
    }
}

/// Render a mapping back in its configuration form.
pub fn mapping_value(node: &MappingNode) -> Value {
    let mut obj = Map::new();
    if let Some(exists) = &node.exists {
        obj.insert(EXISTS_KEY.to_string(), Value::String(column_text(exists)));
    }
    for (key, mapping) in &node.columns {
        let value = match mapping {
            ColumnMapping::Column(c) => Value::String(column_text(c)),
            ColumnMapping::Object(inner) => mapping_value(inner),
        };
        obj.insert(key.clone(), value);
    }
    Value::Object(obj)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSerialized<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionView<'a>>,
    pub parameters: Ordered<&'a str, ParameterSerialized<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<&'a Clauses>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "no_errors")]
    pub errors: &'a [String],
}

impl<'a> From<&'a Method> for MethodSerialized<'a> {
    fn from(m: &'a Method) -> Self {
        MethodSerialized {
            name: &m.name,
            description: m.description.as_deref(),
            deprecated: m.deprecated.as_deref(),
            connection: m.connection.as_ref().map(Connection::view),
            parameters: parameters_map(&m.parameters),
            query: m.query.as_ref().map(|q| &q.clauses),
            sql: m.sql(),
            result: m.mapping.as_ref().map(mapping_value),
            errors: &m.errors,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSerialized<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<&'a str>,
    pub tokens: Ordered<&'a str, Option<&'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionView<'a>>,
    pub parameter_types: Ordered<&'a str, ParameterTypeSerialized<'a>>,
    pub methods: Ordered<&'a str, MethodSerialized<'a>>,
    #[serde(skip_serializing_if = "no_errors")]
    pub errors: &'a [String],
}

impl<'a> ServiceSerialized<'a> {
    pub fn new(services: &'a ServiceCollection, s: &'a Service) -> Self {
        ServiceSerialized {
            name: &s.name,
            base: s.base.map(|i| services.service(i).name.as_str()),
            tokens: s.tokens.iter().map(|(k, v)| (k, v.as_deref())).collect(),
            connection: s.connection.as_ref().map(Connection::view),
            parameter_types: parameter_types_map(&s.parameter_types),
            methods: s.methods.iter().map(|(name, m)| (name, m.into())).collect(),
            errors: &s.errors,
        }
    }
}

/// `{ "errors": [...] }` for one method.
#[derive(Serialize)]
pub struct MethodErrors<'a> {
    pub errors: &'a [String],
}

/// A failing service: its own errors and those of its failing methods.
#[derive(Serialize)]
pub struct ServiceErrors<'a> {
    pub errors: &'a [String],
    pub methods: Ordered<&'a str, MethodErrors<'a>>,
}

impl<'a> From<&'a Service> for ServiceErrors<'a> {
    fn from(s: &'a Service) -> Self {
        ServiceErrors {
            errors: &s.errors,
            methods: s
                .methods
                .iter()
                .filter(|(_, m)| !m.errors.is_empty())
                .map(|(name, m)| (name, MethodErrors { errors: &m.errors }))
                .collect(),
        }
    }
}

/// Discovery link.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub rel: &'static str,
    pub href: String,
}

impl Link {
    pub fn new(rel: &'static str, href: impl Into<String>) -> Self {
        Link { rel, href: href.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn service_view_hides_credentials_and_renders_mapping() {
        let doc = json!({
            "services": {
                "S": {
                    "$": { "t": "x" },
                    "connection": { "dataSource": "db", "userID": "sa", "password": "hunter2" },
                    "methods": {
                        "M": {
                            "parameters": { "id": { "sqlType": "int", "optional": true, "default": 3 } },
                            "query": { "select": "a.Id, b.Id", "from": "a JOIN b ON a.Id = b.A" },
                            "result": { "id": "Id", "other": { "<exists>": "Id`2", "id": "Id`2" } }
                        }
                    }
                }
            }
        });
        let coll = resolve(&doc).services;
        let view = serde_json::to_value(ServiceSerialized::new(&coll, coll.get("S").unwrap())).unwrap();
        let text = view.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("sa\""));
        assert_eq!(view["connection"], json!({ "dataSource": "db" }));
        let m = &view["methods"]["M"];
        assert_eq!(m["parameters"]["id"], json!({ "name": "id", "sqlName": "@id", "sqlType": "int", "optional": true, "default": 3 }));
        assert_eq!(m["result"], json!({ "id": "Id", "other": { "<exists>": "Id`2", "id": "Id`2" } }));
        assert_eq!(m["query"]["select"], json!("a.Id, b.Id"));
        assert!(m.get("errors").is_none());
    }
}
