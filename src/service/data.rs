//! Execution of one `data` request against a resolved method.

use crate::config::{Method, NameMap, Snapshot};
use crate::error::AppError;
use crate::handlers::serialized::{Ordered, ParameterSerialized};
use crate::service::executor::SqlExecutor;
use crate::service::mapping::RowMapper;
use crate::sql::{execution_batch, from_text};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

/// Per-phase timings in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Timings {
    pub open: f64,
    pub exec: f64,
    pub read: f64,
    pub total: f64,
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 100_000.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterValue {
    pub is_valid: bool,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMeta {
    pub config_hash: String,
    pub service: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    /// Declaration order.
    #[serde(skip_serializing_if = "Ordered::is_empty")]
    pub parameters: Ordered<String, ParameterValue>,
    pub timings: Timings,
}

#[derive(Debug, Clone)]
pub struct DataResult {
    pub rows: Vec<Value>,
    pub meta: DataMeta,
}

pub struct DataService;

impl DataService {
    /// Validate the query string against `method`, run its SQL and shape the rows.
    ///
    /// Query-string keys match parameter names case-insensitively; the first occurrence
    /// of a key wins.
    pub async fn execute(
        executor: &dyn SqlExecutor,
        snapshot: &Snapshot,
        service_name: &str,
        method: &Method,
        query: &[(String, String)],
    ) -> Result<DataResult, AppError> {
        let describe = |errors: &[String]| {
            json!({
                "configHash": snapshot.hash,
                "service": service_name,
                "method": method.name,
                "errors": errors,
            })
        };
        if !method.errors.is_empty() {
            return Err(AppError::BadDescriptor(describe(method.errors.as_slice())));
        }
        let Some(sql) = method.sql() else {
            return Err(AppError::BadDescriptor(describe(&["No query specified".to_string()][..])));
        };
        let Some(connection) = method.connection.as_ref() else {
            return Err(AppError::BadDescriptor(describe(&["No connection specified".to_string()][..])));
        };

        let mut supplied: NameMap<&str> = NameMap::new();
        for (key, value) in query.iter().rev() {
            supplied.insert(key.as_str(), value.as_str());
        }

        let missing: Map<String, Value> = method
            .parameters
            .iter()
            .filter(|(name, p)| !p.optional && !supplied.contains_key(name))
            .map(|(name, p)| {
                let view = serde_json::to_value(ParameterSerialized::from(p)).unwrap_or(Value::Null);
                (name.to_string(), view)
            })
            .collect();
        if !missing.is_empty() {
            return Err(AppError::bad_request_with(
                "Missing required parameters",
                json!({ "parameters": missing }),
            ));
        }

        let mut declarations = Vec::with_capacity(method.parameters.len());
        let mut values = Vec::with_capacity(method.parameters.len());
        let mut parameters = Ordered::default();
        for (name, p) in method.parameters.iter() {
            let value = match supplied.get(name) {
                Some(text) => from_text(p.parameter_type().sql_db_type, text).map_err(|message| {
                    AppError::bad_request_with(
                        "Invalid parameter value",
                        json!({ "parameter": name, "message": message, "attemptedValue": text }),
                    )
                })?,
                None => p.default.clone(),
            };
            parameters.0.push((
                name.to_string(),
                ParameterValue {
                    is_valid: true,
                    value: value.to_json(),
                },
            ));
            declarations.push((p.sql_name.as_str(), p.parameter_type().declared_type()));
            values.push(value);
        }
        let batch = execution_batch(&declarations, sql);

        let start = Instant::now();
        let mut session = executor.open(connection).await?;
        let opened = Instant::now();
        let columns = session.execute(&batch, &values).await?;
        let executed = Instant::now();
        let mapper = RowMapper::new(method.mapping.as_ref(), &columns).map_err(AppError::Internal)?;
        let mut rows = Vec::new();
        while let Some(row) = session.next_row().await? {
            rows.push(mapper.map_row(&row));
        }
        let done = Instant::now();

        let timings = Timings {
            open: millis(opened - start),
            exec: millis(executed - opened),
            read: millis(done - executed),
            total: millis(done - start),
        };
        tracing::debug!(
            service = %service_name,
            method = %method.name,
            sql = %batch,
            rows = rows.len(),
            open_ms = timings.open,
            exec_ms = timings.exec,
            read_ms = timings.read,
            "data request executed"
        );

        Ok(DataResult {
            rows,
            meta: DataMeta {
                config_hash: snapshot.hash.clone(),
                service: service_name.to_string(),
                method: method.name.clone(),
                deprecated: method.deprecated.clone(),
                parameters,
                timings,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_to_two_places() {
        assert_eq!(millis(Duration::from_micros(1234)), 1.23);
        assert_eq!(millis(Duration::from_micros(1500)), 1.5);
        assert_eq!(millis(Duration::ZERO), 0.0);
    }
}
