//! Resolution engine: builds the descriptor model from a parsed configuration document.
//!
//! Processing is document-order dependent. Root `$` tokens and `parameterTypes` come
//! first, then every service in `services` (a `base` must name an earlier service),
//! then `aliases`. Errors are recorded on the smallest enclosing entity and never stop
//! sibling processing; only a missing `services` section is fatal.

use crate::config::connection::parse_connection;
use crate::config::interpolate::{interpolate, Tokens};
use crate::config::types::*;
use crate::sql::{
    compile, from_json_default, is_positional_name, is_variable_name, parse_sql_type, Clauses, ParameterType, SqlDbType,
    SqlValue,
};
use serde_json::{Map, Value};

/// Result of one resolution pass.
#[derive(Debug)]
pub struct Resolution {
    pub services: ServiceCollection,
    /// True when the document could not be resolved at all.
    pub fatal: bool,
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "Null",
        Value::Bool(_) => "Boolean",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Integer",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Optional interpolated string property. Wrong types are reported and read as absent.
fn string_field(obj: &Map<String, Value>, key: &str, tokens: &Tokens, errors: &mut Vec<String>) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(interpolate(s, tokens)),
        Some(other) => {
            errors.push(format!(
                "The `{}` property is expected to be of type string, not {}",
                key,
                json_type_name(other)
            ));
            None
        }
    }
}

fn bool_field(obj: &Map<String, Value>, key: &str, errors: &mut Vec<String>) -> Option<bool> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(other) => {
            errors.push(format!(
                "The `{}` property is expected to be of type boolean, not {}",
                key,
                json_type_name(other)
            ));
            None
        }
    }
}

/// Token values are scalars and are never interpolated themselves.
fn token_value(name: &str, v: &Value) -> Result<Option<String>, String> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(format!(
            "Token '{}' is expected to be a string, not {}",
            name,
            json_type_name(other)
        )),
    }
}

/// Apply a `$` property: `null` clears inherited tokens, an object merges over them.
fn apply_tokens(value: &Value, tokens: &mut Tokens, errors: &mut Vec<String>) {
    match value {
        Value::Null => tokens.clear(),
        Value::Object(entries) => {
            for (name, v) in entries {
                match token_value(name, v) {
                    Ok(value) => {
                        tokens.insert(name.clone(), value);
                    }
                    Err(e) => errors.push(e),
                }
            }
        }
        _ => errors.push("The `$` property is expected to be of type object".into()),
    }
}

/// Apply a `parameterTypes` property at any scope: `null` clears, an object merges
/// (a `null` entry removes that type).
fn apply_parameter_types(
    value: &Value,
    tokens: &Tokens,
    types: &mut NameMap<ParameterType>,
    errors: &mut Vec<String>,
) {
    let entries = match value {
        Value::Null => {
            types.clear();
            return;
        }
        Value::Object(entries) => entries,
        _ => {
            errors.push("The `parameterTypes` property is expected to be of type object".into());
            return;
        }
    };
    for (name, v) in entries {
        let obj = match v {
            Value::Null => {
                types.remove(name);
                continue;
            }
            Value::Object(obj) => obj,
            _ => {
                errors.push(format!("ParameterType property '{}' is expected to be of type object", name));
                continue;
            }
        };
        let Some(type_text) = string_field(obj, "type", tokens, errors) else {
            errors.push(format!("ParameterType '{}' requires a `type`", name));
            continue;
        };
        let (type_base, length, scale) = match parse_sql_type(&type_text) {
            Ok(parts) => parts,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        let Some(sql_db_type) = SqlDbType::from_type_base(&type_base) else {
            errors.push(format!("Unrecognized SQL type name '{}'", type_base));
            continue;
        };
        let description = string_field(obj, "description", tokens, errors);
        types.insert(
            name.clone(),
            ParameterType {
                name: Some(name.clone()),
                type_base,
                sql_db_type,
                length,
                scale,
                description,
            },
        );
    }
}

/// Resolve a whole configuration document.
pub fn resolve(document: &Value) -> Resolution {
    let mut coll = ServiceCollection::new();
    let Some(root) = document.as_object() else {
        coll.errors.push("The configuration document is expected to be a JSON object".into());
        return Resolution {
            services: coll,
            fatal: true,
        };
    };

    let mut root_tokens = Tokens::new();
    if let Some(v) = root.get("$") {
        apply_tokens(v, &mut root_tokens, &mut coll.errors);
    }

    let mut root_types = NameMap::new();
    if let Some(v) = root.get("parameterTypes") {
        apply_parameter_types(v, &root_tokens, &mut root_types, &mut coll.errors);
    }

    let services = match root.get("services") {
        Some(Value::Object(services)) => services,
        Some(_) => {
            coll.errors.push("The 'services' section is expected to be of type object".into());
            return Resolution {
                services: coll,
                fatal: true,
            };
        }
        None => {
            coll.errors.push("A 'services' section is required".into());
            return Resolution {
                services: coll,
                fatal: true,
            };
        }
    };

    for (name, value) in services {
        if name == "$" {
            continue;
        }
        let Some(obj) = value.as_object() else {
            coll.errors.push(format!("Service '{}' is expected to be of type object", name));
            continue;
        };
        if coll.contains(name) {
            coll.errors.push(format!("A service named '{}' is already defined", name));
            continue;
        }
        match resolve_service(&coll, name, obj, &root_tokens, &root_types) {
            Ok(service) => {
                coll.push(service);
            }
            Err(e) => coll.errors.push(e),
        }
    }

    if let Some(aliases) = root.get("aliases") {
        resolve_aliases(&mut coll, aliases);
    }

    Resolution {
        services: coll,
        fatal: false,
    }
}

fn resolve_aliases(coll: &mut ServiceCollection, aliases: &Value) {
    let Some(aliases) = aliases.as_object() else {
        coll.errors.push("The `aliases` property is expected to be of type object".into());
        return;
    };
    for (alias, target) in aliases {
        let Some(target) = target.as_str() else {
            coll.errors.push(format!("Alias '{}' is expected to name a service", alias));
            continue;
        };
        let Some(index) = coll.index_of(target) else {
            coll.errors.push(format!("Unknown service name '{}' for alias '{}'", target, alias));
            continue;
        };
        if coll.contains(alias) {
            coll.errors.push(format!(
                "Cannot add alias name '{}' because that name is already in use",
                alias
            ));
            continue;
        }
        coll.add_alias(alias, index);
    }
}

/// Resolve one service. `Err` is a document-level error; the service is skipped.
fn resolve_service(
    coll: &ServiceCollection,
    name: &str,
    obj: &Map<String, Value>,
    root_tokens: &Tokens,
    root_types: &NameMap<ParameterType>,
) -> Result<Service, String> {
    // The index this service will get once pushed.
    let index = coll.services().len();

    let mut service = match obj.get("base") {
        Some(base) => {
            let base_name = base.as_str().ok_or_else(|| {
                format!(
                    "The `base` property of service '{}' is expected to be of type string, not {}",
                    name,
                    json_type_name(base)
                )
            })?;
            let base_index = coll.index_of(base_name).ok_or_else(|| {
                format!(
                    "Unknown base service name '{}' for service '{}'; services must be declared in document order",
                    base_name, name
                )
            })?;
            let base = coll.service(base_index);
            let mut methods = base.methods.clone();
            for m in methods.values_mut() {
                m.service = index;
            }
            Service {
                name: name.to_string(),
                base: Some(base_index),
                tokens: base.tokens.clone(),
                connection: base.connection.clone(),
                parameter_types: base.parameter_types.clone(),
                methods,
                errors: Vec::new(),
            }
        }
        None => Service {
            name: name.to_string(),
            base: None,
            tokens: root_tokens.clone(),
            connection: None,
            parameter_types: root_types.clone(),
            methods: NameMap::new(),
            errors: Vec::new(),
        },
    };

    if let Some(v) = obj.get("$") {
        apply_tokens(v, &mut service.tokens, &mut service.errors);
    }

    if let Some(v) = obj.get("connection") {
        service.connection = match parse_connection(v, &service.tokens) {
            Ok(c) => Some(c),
            Err(e) => {
                service.errors.push(e);
                None
            }
        };
        for m in service.methods.values_mut() {
            if m.connection_origin == ConnectionOrigin::Service {
                m.connection = service.connection.clone();
            }
        }
    }

    if let Some(v) = obj.get("parameterTypes") {
        apply_parameter_types(v, &service.tokens, &mut service.parameter_types, &mut service.errors);
    }

    match obj.get("methods") {
        None => {}
        Some(Value::Object(methods)) => {
            for (method_name, v) in methods {
                match v {
                    Value::Null => {
                        service.methods.remove(method_name);
                    }
                    Value::Object(method_obj) => {
                        let method = resolve_method(&service, index, method_name, method_obj);
                        service.methods.insert(method_name.clone(), method);
                    }
                    _ => service.errors.push(format!(
                        "The method property `{}` is expected to be of type object",
                        method_name
                    )),
                }
            }
        }
        Some(_) => service
            .errors
            .push("The `methods` property is expected to be of type object".into()),
    }

    Ok(service)
}

fn resolve_method(service: &Service, index: usize, name: &str, obj: &Map<String, Value>) -> Method {
    let mut method = match service.methods.get(name) {
        Some(inherited) => inherited.derive(index),
        None => Method {
            service: index,
            name: name.to_string(),
            description: None,
            deprecated: None,
            parameter_types: service.parameter_types.clone(),
            parameters: NameMap::new(),
            connection: service.connection.clone(),
            connection_origin: ConnectionOrigin::Service,
            query: None,
            mapping: None,
            errors: Vec::new(),
        },
    };
    method.name = name.to_string();
    let errors = &mut method.errors;

    let mut tokens = service.tokens.clone();
    if let Some(v) = obj.get("$") {
        apply_tokens(v, &mut tokens, errors);
    }

    if obj.contains_key("description") {
        method.description = string_field(obj, "description", &tokens, errors);
    }
    if obj.contains_key("deprecated") {
        method.deprecated = string_field(obj, "deprecated", &tokens, errors);
    }

    if let Some(v) = obj.get("connection") {
        method.connection_origin = ConnectionOrigin::Method;
        method.connection = match parse_connection(v, &tokens) {
            Ok(c) => Some(c),
            Err(e) => {
                errors.push(e);
                None
            }
        };
    }

    if let Some(v) = obj.get("parameterTypes") {
        apply_parameter_types(v, &tokens, &mut method.parameter_types, errors);
    }

    if let Some(v) = obj.get("parameters") {
        apply_parameters(v, &tokens, &method.parameter_types, &mut method.parameters, errors);
    }

    match obj.get("query") {
        Some(Value::Null) => method.query = None,
        Some(Value::Object(query_obj)) => method.query = Some(parse_query(query_obj, &tokens, errors)),
        Some(_) => errors.push("The `query` property is expected to be an object".into()),
        // A method may also carry its clauses directly.
        None if obj.contains_key("select") => method.query = Some(parse_query(obj, &tokens, errors)),
        None => {}
    }
    match &method.query {
        None => errors.push("No query specified".into()),
        Some(q) => errors.extend(q.errors.iter().cloned()),
    }

    match obj.get("result") {
        None => {}
        Some(Value::Null) => method.mapping = None,
        Some(Value::Object(mapping)) => method.mapping = Some(parse_mapping(mapping, &tokens, errors)),
        Some(other) => errors.push(format!(
            "The `result` property is expected to be of type object, not {}",
            json_type_name(other)
        )),
    }

    method
}

/// Apply a `parameters` property: `null` clears inherited parameters, an object merges.
fn apply_parameters(
    value: &Value,
    tokens: &Tokens,
    types: &NameMap<ParameterType>,
    parameters: &mut NameMap<Parameter>,
    errors: &mut Vec<String>,
) {
    let entries = match value {
        Value::Null => {
            parameters.clear();
            return;
        }
        Value::Object(entries) => entries,
        _ => {
            errors.push("The `parameters` property is expected to be of type object".into());
            return;
        }
    };
    for (name, v) in entries {
        match v {
            Value::Null => {
                parameters.remove(name);
            }
            Value::Object(obj) => {
                if let Some(p) = parse_parameter(name, obj, tokens, types, parameters, errors) {
                    parameters.insert(name.clone(), p);
                }
            }
            _ => errors.push(format!("Parameter property '{}' is expected to be of type object", name)),
        }
    }
}

fn parse_parameter(
    name: &str,
    obj: &Map<String, Value>,
    tokens: &Tokens,
    types: &NameMap<ParameterType>,
    existing: &NameMap<Parameter>,
    errors: &mut Vec<String>,
) -> Option<Parameter> {
    let sql_name = string_field(obj, "sqlName", tokens, errors).unwrap_or_else(|| format!("@{}", name));
    let sql_type = string_field(obj, "sqlType", tokens, errors);
    let type_name = string_field(obj, "type", tokens, errors);
    let optional = bool_field(obj, "optional", errors).unwrap_or(false);
    let description = string_field(obj, "description", tokens, errors);

    if !is_variable_name(&sql_name) {
        errors.push(format!(
            "Invalid SQL parameter name (`sqlName`) '{}' for parameter '{}'",
            sql_name, name
        ));
        return None;
    }
    if is_positional_name(&sql_name) {
        errors.push(format!(
            "SQL parameter name (`sqlName`) '{}' for parameter '{}' is reserved",
            sql_name, name
        ));
        return None;
    }

    let duplicate = existing
        .iter()
        .any(|(other, p)| !other.eq_ignore_ascii_case(name) && p.sql_name.eq_ignore_ascii_case(&sql_name));
    if duplicate {
        errors.push(format!("Duplicate SQL parameter name (`sqlName`): '{}'", sql_name));
        return None;
    }

    let type_source = match (sql_type, type_name) {
        (Some(_), Some(_)) => {
            errors.push(format!(
                "Parameter '{}' cannot specify both `sqlType` and `type`",
                name
            ));
            return None;
        }
        (Some(text), None) => {
            let (type_base, length, scale) = match parse_sql_type(&text) {
                Ok(parts) => parts,
                Err(e) => {
                    errors.push(format!("{} for parameter '{}'", e, name));
                    return None;
                }
            };
            let Some(sql_db_type) = SqlDbType::from_type_base(&type_base) else {
                errors.push(format!("Unknown SQL type name '{}' for parameter '{}'", type_base, name));
                return None;
            };
            ParameterTypeSource::SqlType(ParameterType {
                name: None,
                type_base,
                sql_db_type,
                length,
                scale,
                description: None,
            })
        }
        (None, Some(type_name)) => match types.get(&type_name) {
            Some(t) => ParameterTypeSource::Named(t.clone()),
            None => {
                errors.push(format!(
                    "Could not find parameter type '{}' for parameter '{}'",
                    type_name, name
                ));
                return None;
            }
        },
        (None, None) => {
            errors.push(format!("Parameter '{}' must specify either `sqlType` or `type`", name));
            return None;
        }
    };

    let mut parameter = Parameter {
        name: name.to_string(),
        sql_name,
        description,
        optional,
        default: SqlValue::Null,
        type_source,
    };
    if optional {
        if let Some(v) = obj.get("default") {
            match from_json_default(v, parameter.parameter_type()) {
                Ok(value) => parameter.default = value,
                Err(e) => {
                    errors.push(format!("Invalid default value for parameter '{}': {}", name, e));
                    return None;
                }
            }
        }
    }
    Some(parameter)
}

fn parse_query(obj: &Map<String, Value>, tokens: &Tokens, errors: &mut Vec<String>) -> Query {
    let mut clauses = Clauses {
        with_cte_identifier: string_field(obj, "withCTEidentifier", tokens, errors),
        with_cte_expression: string_field(obj, "withCTEexpression", tokens, errors),
        select: string_field(obj, "select", tokens, errors),
        from: string_field(obj, "from", tokens, errors),
        where_: string_field(obj, "where", tokens, errors),
        group_by: string_field(obj, "groupBy", tokens, errors),
        having: string_field(obj, "having", tokens, errors),
        order_by: string_field(obj, "orderBy", tokens, errors),
        xml_namespaces: Vec::new(),
    };
    match obj.get("xmlns") {
        None | Some(Value::Null) => {}
        Some(Value::Object(namespaces)) => {
            for (prefix, uri) in namespaces {
                match uri.as_str() {
                    Some(uri) => clauses
                        .xml_namespaces
                        .push((prefix.clone(), interpolate(uri, tokens))),
                    None => errors.push(format!("XML namespace '{}' is expected to be a string", prefix)),
                }
            }
        }
        Some(_) => errors.push("The `xmlns` property is expected to be of type object".into()),
    }

    match compile(&clauses) {
        Ok(sql) => Query {
            clauses,
            sql: Some(sql),
            errors: Vec::new(),
        },
        Err(compile_errors) => Query {
            clauses,
            sql: None,
            errors: compile_errors,
        },
    }
}

fn parse_column_ref(text: &str, key: &str, errors: &mut Vec<String>) -> Option<ColumnRef> {
    match text.rsplit_once('`') {
        None => Some(ColumnRef {
            name: text.to_string(),
            instance: 0,
        }),
        Some((name, occurrence)) => match occurrence.trim().parse::<usize>() {
            Ok(n) if n >= 1 => Some(ColumnRef {
                name: name.to_string(),
                instance: n - 1,
            }),
            _ => {
                errors.push(format!(
                    "Invalid column instance '{}' for mapping property '{}'",
                    occurrence, key
                ));
                None
            }
        },
    }
}

fn parse_mapping(obj: &Map<String, Value>, tokens: &Tokens, errors: &mut Vec<String>) -> MappingNode {
    let mut node = MappingNode::default();
    for (key, v) in obj {
        match v {
            Value::String(s) if key == EXISTS_KEY => {
                node.exists = parse_column_ref(&interpolate(s, tokens), key, errors);
            }
            Value::String(s) => {
                if let Some(column) = parse_column_ref(&interpolate(s, tokens), key, errors) {
                    node.columns.push((key.clone(), ColumnMapping::Column(column)));
                }
            }
            Value::Object(inner) if key != EXISTS_KEY => {
                node.columns
                    .push((key.clone(), ColumnMapping::Object(parse_mapping(inner, tokens, errors))));
            }
            other => errors.push(format!(
                "Unhandled token type {} for mapping property '{}'",
                json_type_name(other),
                key
            )),
        }
    }
    node
}
