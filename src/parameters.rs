//! Expansion of `config.parameters` into one variable set per run.
//!
//! Each key names one or more variables joined with `-` (or `,`); its
//! value is a list of rows, or an expression such as
//! `${parameterize(accounts.csv)}` producing one. The runs are the
//! cartesian product of all keys, first key outermost.

use crate::error::{EngineError, EngineResult};
use crate::functions::FunctionRegistry;
use crate::model::Variables;
use crate::resolver::resolve_value;
use serde_json::Value;
use tracing::debug;

pub fn expand_parameters(
    parameters: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<Vec<Variables>> {
    let mut runs = vec![Variables::new()];

    for (key, raw) in parameters {
        let names: Vec<&str> = key
            .split(['-', ','])
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err(EngineError::params(format!(
                "parameter key '{key}' names no variables"
            )));
        }

        let rows = match resolve_value(raw, &Variables::new(), functions)? {
            Value::Array(rows) => rows,
            other => {
                return Err(EngineError::params(format!(
                    "parameter '{key}' must be a list of rows, got {other}"
                )))
            }
        };
        let rows = rows
            .iter()
            .map(|row| bind_row(key, &names, row))
            .collect::<EngineResult<Vec<_>>>()?;
        debug!("Parameter '{}' has {} row(s)", key, rows.len());

        let mut product = Vec::with_capacity(runs.len() * rows.len());
        for run in &runs {
            for row in &rows {
                let mut combined = run.clone();
                combined.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
                product.push(combined);
            }
        }
        runs = product;
    }

    Ok(runs)
}

fn bind_row(key: &str, names: &[&str], row: &Value) -> EngineResult<Variables> {
    let mut bound = Variables::new();
    match row {
        Value::Object(map) => {
            for name in names {
                let value = map.get(*name).ok_or_else(|| {
                    EngineError::params(format!("parameter row {row} has no column '{name}'"))
                })?;
                bound.insert((*name).to_string(), value.clone());
            }
        }
        Value::Array(values) if names.len() > 1 => {
            if values.len() != names.len() {
                return Err(EngineError::params(format!(
                    "parameter '{key}' expects {} values per row, got {row}",
                    names.len()
                )));
            }
            for (name, value) in names.iter().zip(values) {
                bound.insert((*name).to_string(), value.clone());
            }
        }
        value if names.len() == 1 => {
            bound.insert(names[0].to_string(), value.clone());
        }
        other => {
            return Err(EngineError::params(format!(
                "parameter '{key}' expects {} values per row, got {other}",
                names.len()
            )))
        }
    }
    Ok(bound)
}
