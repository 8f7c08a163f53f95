//! Row shaping: flat objects by column name, or nested objects from a result mapping.

use crate::config::{ColumnMapping, ColumnRef, MappingNode};
use serde_json::{Map, Value};

enum Slot {
    Column(usize),
    Object(CompiledNode),
}

struct CompiledNode {
    exists: Option<usize>,
    fields: Vec<(String, Slot)>,
}

/// Turns rows of one result set into JSON objects. Column positions are resolved once
/// against the result set's columns.
pub struct RowMapper {
    shape: Shape,
}

enum Shape {
    /// Output key and column index; later duplicates of a name (ignoring case) are dropped.
    Flat(Vec<(String, usize)>),
    Mapped(CompiledNode),
}

/// Position of the `instance`-th column named `name` (case-insensitive).
fn find_column(columns: &[String], column: &ColumnRef) -> Result<usize, String> {
    columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.eq_ignore_ascii_case(&column.name))
        .nth(column.instance)
        .map(|(i, _)| i)
        .ok_or_else(|| {
            if column.instance == 0 {
                format!("Column '{}' not found in result set", column.name)
            } else {
                format!(
                    "Column '{}' occurrence {} not found in result set",
                    column.name,
                    column.instance + 1
                )
            }
        })
}

fn compile_node(node: &MappingNode, columns: &[String]) -> Result<CompiledNode, String> {
    let exists = node
        .exists
        .as_ref()
        .map(|c| find_column(columns, c))
        .transpose()?;
    let fields = node
        .columns
        .iter()
        .map(|(key, mapping)| {
            let slot = match mapping {
                ColumnMapping::Column(c) => Slot::Column(find_column(columns, c)?),
                ColumnMapping::Object(inner) => Slot::Object(compile_node(inner, columns)?),
            };
            Ok((key.clone(), slot))
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(CompiledNode { exists, fields })
}

impl RowMapper {
    pub fn new(mapping: Option<&MappingNode>, columns: &[String]) -> Result<Self, String> {
        let shape = match mapping {
            Some(node) => Shape::Mapped(compile_node(node, columns)?),
            None => {
                let mut seen = std::collections::HashSet::new();
                Shape::Flat(
                    columns
                        .iter()
                        .enumerate()
                        .filter(|(_, name)| seen.insert(name.to_ascii_lowercase()))
                        .map(|(i, name)| (name.clone(), i))
                        .collect(),
                )
            }
        };
        Ok(RowMapper { shape })
    }

    pub fn map_row(&self, row: &[Value]) -> Value {
        let cell = |i: usize| row.get(i).cloned().unwrap_or(Value::Null);
        match &self.shape {
            Shape::Flat(columns) => Value::Object(columns.iter().map(|(name, i)| (name.clone(), cell(*i))).collect()),
            Shape::Mapped(node) => map_node(node, &cell),
        }
    }
}

fn map_node(node: &CompiledNode, cell: &dyn Fn(usize) -> Value) -> Value {
    if let Some(i) = node.exists {
        if cell(i).is_null() {
            return Value::Null;
        }
    }
    let mut obj = Map::new();
    for (key, slot) in &node.fields {
        let value = match slot {
            Slot::Column(i) => cell(*i),
            Slot::Object(inner) => map_node(inner, cell),
        };
        obj.insert(key.clone(), value);
    }
    Value::Object(obj)
}
