//! Comparator vocabulary used by validators.

use crate::builtins::{length_of, type_name};
use crate::resolver::stringify;
use regex::Regex;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Canonical comparator names.
pub const COMPARATORS: &[&str] = &[
    "equals",
    "not_equals",
    "less_than",
    "less_than_or_equals",
    "greater_than",
    "greater_than_or_equals",
    "string_equals",
    "length_equals",
    "length_greater_than",
    "length_greater_than_or_equals",
    "length_less_than",
    "length_less_than_or_equals",
    "contains",
    "contained_by",
    "regex_match",
    "startswith",
    "endswith",
    "type_match",
];

/// Map an alias to its canonical name. Unknown names come back
/// unchanged so custom comparators can be looked up as functions.
pub fn uniform_comparator(name: &str) -> String {
    let canonical = match name {
        "eq" | "==" | "is" | "equals" => "equals",
        "ne" | "not_equal" | "not_equals" => "not_equals",
        "lt" | "less_than" => "less_than",
        "le" | "less_or_equals" | "less_than_or_equals" => "less_than_or_equals",
        "gt" | "greater_than" => "greater_than",
        "ge" | "greater_or_equals" | "greater_than_or_equals" => {
            "greater_than_or_equals"
        }
        "str_eq" | "string_equals" => "string_equals",
        "len_eq" | "count_eq" | "length_equal" | "length_equals" => "length_equals",
        "len_gt" | "count_gt" | "length_greater_than" => "length_greater_than",
        "len_ge" | "count_ge" | "length_greater_than_or_equals" => {
            "length_greater_than_or_equals"
        }
        "len_lt" | "count_lt" | "length_less_than" => "length_less_than",
        "len_le" | "count_le" | "length_less_than_or_equals" => {
            "length_less_than_or_equals"
        }
        other => other,
    };
    canonical.to_string()
}

pub fn is_builtin(name: &str) -> bool {
    COMPARATORS.contains(&name)
}

/// Ordering of two values: numbers numerically, strings
/// lexicographically. `None` for anything else.
pub fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Integers compare exactly; f64 only once a float is involved.
fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    match (as_integer(x), as_integer(y)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Apply the canonical comparator `name` to `(actual, expected)`.
/// `Err` carries a human readable description of the violation.
pub fn compare(name: &str, actual: &Value, expected: &Value) -> Result<(), String> {
    let holds = match name {
        "equals" => values_equal(actual, expected),
        "not_equals" => !values_equal(actual, expected),
        "less_than" => ordered(actual, expected)?.is_lt(),
        "less_than_or_equals" => ordered(actual, expected)?.is_le(),
        "greater_than" => ordered(actual, expected)?.is_gt(),
        "greater_than_or_equals" => ordered(actual, expected)?.is_ge(),
        "string_equals" => stringify(actual) == stringify(expected),
        "length_equals" => length(actual)? == count(expected)?,
        "length_greater_than" => length(actual)? > count(expected)?,
        "length_greater_than_or_equals" => length(actual)? >= count(expected)?,
        "length_less_than" => length(actual)? < count(expected)?,
        "length_less_than_or_equals" => length(actual)? <= count(expected)?,
        "contains" => contains(actual, expected)?,
        "contained_by" => contains(expected, actual)?,
        "regex_match" => regex_match(actual, expected)?,
        "startswith" => stringify(actual).starts_with(&stringify(expected)),
        "endswith" => stringify(actual).ends_with(&stringify(expected)),
        "type_match" => type_match(actual, expected)?,
        other => return Err(format!("unknown comparator '{other}'")),
    };

    if holds {
        Ok(())
    } else {
        Err(format!("{actual} {name} {expected} does not hold"))
    }
}

fn ordered(actual: &Value, expected: &Value) -> Result<Ordering, String> {
    order(actual, expected).ok_or_else(|| {
        format!(
            "cannot order {} ({}) against {} ({})",
            actual,
            type_name(actual),
            expected,
            type_name(expected)
        )
    })
}

fn length(actual: &Value) -> Result<usize, String> {
    length_of(actual)
        .ok_or_else(|| format!("{actual} ({}) has no length", type_name(actual)))
}

fn count(expected: &Value) -> Result<usize, String> {
    match expected {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .map(|n| n as usize)
            .ok_or_else(|| format!("expected length must be a non-negative integer, got {n}")),
        Value::String(s) => s
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("expected length must be an integer, got '{s}'")),
        other => Err(format!("expected length must be an integer, got {other}")),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match container {
        Value::String(s) => Ok(s.contains(&stringify(item))),
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::Object(map) => Ok(map.contains_key(&stringify(item))),
        other => Err(format!(
            "{other} ({}) is not a string, list or dict",
            type_name(other)
        )),
    }
}

fn regex_match(actual: &Value, expected: &Value) -> Result<bool, String> {
    let (Value::String(text), Value::String(pattern)) = (actual, expected) else {
        return Err(format!(
            "regex_match needs two strings, got {actual} and {expected}"
        ));
    };
    // anchored at the start, like a match (not a search)
    let re = Regex::new(&format!("^(?:{pattern})"))
        .map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
    Ok(re.is_match(text))
}

fn type_match(actual: &Value, expected: &Value) -> Result<bool, String> {
    let name = match expected {
        Value::Null => return Ok(actual.is_null()),
        Value::String(s) => s.as_str(),
        other => return Err(format!("type_match expects a type name, got {other}")),
    };
    let matched = match name {
        "int" | "integer" => actual.is_i64() || actual.is_u64(),
        "float" => actual.is_f64(),
        "number" => actual.is_number(),
        "str" | "string" => actual.is_string(),
        "bool" | "boolean" => actual.is_boolean(),
        "list" | "array" | "tuple" => actual.is_array(),
        "dict" | "object" | "map" => actual.is_object(),
        "None" | "NoneType" | "null" => actual.is_null(),
        other => return Err(format!("unknown type name '{other}'")),
    };
    Ok(matched)
}
