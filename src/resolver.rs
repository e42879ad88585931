//! Resolve `$` notation inside strings and arbitrarily nested values.

use crate::error::{EngineError, EngineResult};
use crate::functions::{FunctionRegistry, Kwargs};
use crate::model::Variables;
use crate::parser::{scan, FunctionArgs, Fragment};
use serde_json::{Map, Value};

/// Text form of a value when it is embedded in a larger string: strings
/// as their raw text, everything else in JSON notation.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve every string inside `value`, mapping keys included. Numbers,
/// booleans and null are returned unchanged.
pub fn resolve_value(
    value: &Value,
    variables: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<Value> {
    match value {
        Value::String(s) => resolve_string(s, variables, functions),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, variables, functions))
            .collect::<EngineResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                let key = stringify(&resolve_string(key, variables, functions)?);
                resolved.insert(key, resolve_value(item, variables, functions)?);
            }
            Ok(Value::Object(resolved))
        }
        scalar => Ok(scalar.clone()),
    }
}

/// Resolve a single string.
///
/// A string that is exactly one reference or one call keeps the native
/// type of its value; otherwise every fragment is spliced back as text.
pub fn resolve_string(
    raw: &str,
    variables: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<Value> {
    let trimmed = raw.trim_matches(|c| c == ' ' || c == '\t');
    if trimmed.is_empty() {
        return Ok(Value::String(raw.to_string()));
    }

    let fragments = scan(trimmed);
    if let [single] = fragments.as_slice() {
        return match single {
            Fragment::Literal(text) => Ok(Value::String(text.clone())),
            Fragment::Variable(name) => lookup(name, variables),
            Fragment::Function { name, args } => call(name, args, variables, functions),
        };
    }

    let mut out = String::with_capacity(trimmed.len());
    for fragment in &fragments {
        match fragment {
            Fragment::Literal(text) => out.push_str(text),
            Fragment::Variable(name) => out.push_str(&stringify(&lookup(name, variables)?)),
            Fragment::Function { name, args } => {
                out.push_str(&stringify(&call(name, args, variables, functions)?))
            }
        }
    }
    Ok(Value::String(out))
}

fn lookup(name: &str, variables: &Variables) -> EngineResult<Value> {
    variables
        .get(name)
        .cloned()
        .ok_or_else(|| EngineError::VariableNotFound(vec![name.to_string()]))
}

fn call(
    name: &str,
    args: &FunctionArgs,
    variables: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<Value> {
    let positional = args
        .args
        .iter()
        .map(|arg| resolve_arg(arg, variables, functions))
        .collect::<EngineResult<Vec<_>>>()?;
    let mut kwargs = Kwargs::with_capacity(args.kwargs.len());
    for (key, arg) in &args.kwargs {
        kwargs.insert(key.clone(), resolve_arg(arg, variables, functions)?);
    }
    functions.call(name, &positional, &kwargs)
}

fn resolve_arg(
    arg: &Value,
    variables: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<Value> {
    match arg {
        Value::String(s) if s.contains('$') => resolve_string(s, variables, functions),
        other => Ok(other.clone()),
    }
}
