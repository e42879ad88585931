//! Scanner for `$$`, `$name`, `${name}` and `${name(args)}` notation.
//!
//! Scanning is left to right; at every `$` the escape is tried first,
//! then a function call, then a variable reference. A `$` matching none
//! of them is kept as literal text.

use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([a-zA-Z_]\w*)\(([\$\w\.\-/\s=,]*)\)\}")
        .expect("failed to compile function regex")
});

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\$\{([a-zA-Z_]\w*)\}|\$([a-zA-Z_]\w*))")
        .expect("failed to compile variable regex")
});

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_]\w*$").expect("failed to compile identifier regex")
});

/// One piece of a scanned string.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Literal(String),
    Variable(String),
    Function { name: String, args: FunctionArgs },
}

/// Arguments of a function call after scalar coercion. String arguments
/// may still hold `$` references; the resolver substitutes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionArgs {
    pub args: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

/// Split `raw` into literal text, variable references and function
/// calls. Consecutive literal text is merged into one fragment.
pub fn scan(raw: &str) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut literal = String::new();
    let mut cursor = 0;

    while cursor < raw.len() {
        let rest = &raw[cursor..];

        if !rest.starts_with('$') {
            let next = rest.find('$').unwrap_or(rest.len());
            literal.push_str(&rest[..next]);
            cursor += next;
            continue;
        }

        if rest.starts_with("$$") {
            literal.push('$');
            cursor += 2;
            continue;
        }

        if let Some(caps) = FUNCTION_RE.captures(rest) {
            flush(&mut literal, &mut fragments);
            fragments.push(Fragment::Function {
                name: caps[1].to_string(),
                args: parse_function_args(&caps[2]),
            });
            cursor += caps[0].len();
            continue;
        }

        if let Some(caps) = VARIABLE_RE.captures(rest) {
            flush(&mut literal, &mut fragments);
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            fragments.push(Fragment::Variable(name.to_string()));
            cursor += caps[0].len();
            continue;
        }

        literal.push('$');
        cursor += 1;
    }

    flush(&mut literal, &mut fragments);
    fragments
}

fn flush(literal: &mut String, fragments: &mut Vec<Fragment>) {
    if !literal.is_empty() {
        fragments.push(Fragment::Literal(std::mem::take(literal)));
    }
}

/// Names of every variable referenced in `raw`, including references
/// inside function arguments. Escaped `$$name` is not a reference.
pub fn find_all_variable_names(raw: &str) -> IndexSet<String> {
    let mut names = IndexSet::new();
    collect_names(raw, &mut names);
    names
}

fn collect_names(raw: &str, names: &mut IndexSet<String>) {
    for fragment in scan(raw) {
        match fragment {
            Fragment::Variable(name) => {
                names.insert(name);
            }
            Fragment::Function { args, .. } => {
                for value in args.args.iter().chain(args.kwargs.values()) {
                    if let Value::String(s) = value {
                        collect_names(s, names);
                    }
                }
            }
            Fragment::Literal(_) => {}
        }
    }
}

/// Variable names referenced anywhere inside `value`, keys included.
pub fn find_variable_names_in_value(value: &Value) -> IndexSet<String> {
    let mut names = IndexSet::new();
    walk_value(value, &mut names);
    names
}

fn walk_value(value: &Value, names: &mut IndexSet<String>) {
    match value {
        Value::String(s) => collect_names(s, names),
        Value::Array(items) => items.iter().for_each(|v| walk_value(v, names)),
        Value::Object(map) => {
            for (key, v) in map {
                collect_names(key, names);
                walk_value(v, names);
            }
        }
        _ => {}
    }
}

/// `(name, raw args)` for every function call in `raw`, in order.
pub fn find_all_function_calls(raw: &str) -> Vec<(String, String)> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = raw[cursor..].find('$') {
        let start = cursor + offset;
        let rest = &raw[start..];
        if rest.starts_with("$$") {
            cursor = start + 2;
        } else if let Some(caps) = FUNCTION_RE.captures(rest) {
            calls.push((caps[1].to_string(), caps[2].to_string()));
            cursor = start + caps[0].len();
        } else {
            cursor = start + 1;
        }
    }

    calls
}

/// Parse the raw argument list of a function call.
///
/// `a, b=2` gives one positional and one keyword argument. A value that
/// starts with `$` is left as a string for the resolver; anything else
/// is coerced with [`coerce_scalar`].
pub fn parse_function_args(raw: &str) -> FunctionArgs {
    let mut parsed = FunctionArgs::default();
    let raw = raw.trim();
    if raw.is_empty() {
        return parsed;
    }

    for item in raw.split(',') {
        let item = item.trim();
        match item.split_once('=') {
            Some((key, value)) if IDENT_RE.is_match(key.trim()) => {
                parsed
                    .kwargs
                    .insert(key.trim().to_string(), arg_value(value.trim()));
            }
            _ => parsed.args.push(arg_value(item)),
        }
    }

    parsed
}

fn arg_value(raw: &str) -> Value {
    if raw.starts_with('$') {
        Value::String(raw.to_string())
    } else {
        coerce_scalar(raw)
    }
}

/// Integer, then float, otherwise the string itself.
pub fn coerce_scalar(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn var(name: &str) -> Fragment {
        Fragment::Variable(name.to_string())
    }

    fn lit(text: &str) -> Fragment {
        Fragment::Literal(text.to_string())
    }

    #[test]
    fn test_plain_text_is_one_literal() {
        assert_eq!(scan("hello world"), vec![lit("hello world")]);
        assert!(scan("").is_empty());
    }

    #[test]
    fn test_escape() {
        assert_eq!(scan("a$$b"), vec![lit("a$b")]);
        assert_eq!(scan("a$$$$b"), vec![lit("a$$b")]);
        // escaped dollar never starts a reference
        assert_eq!(scan("$$name"), vec![lit("$name")]);
    }

    #[test]
    fn test_variable_forms() {
        assert_eq!(scan("$n"), vec![var("n")]);
        assert_eq!(scan("${n}"), vec![var("n")]);
        assert_eq!(scan("x$n"), vec![lit("x"), var("n")]);
        assert_eq!(
            scan("${a}b$c/d"),
            vec![var("a"), lit("b"), var("c"), lit("/d")]
        );
    }

    #[test]
    fn test_stray_dollars_are_literal() {
        assert_eq!(scan("$}"), vec![lit("$}")]);
        assert_eq!(scan("cost $"), vec![lit("cost $")]);
        assert_eq!(scan("$1name"), vec![lit("$1name")]);
        assert_eq!(scan("${unclosed"), vec![lit("${unclosed")]);
    }

    #[test]
    fn test_function_call() {
        let fragments = scan("${add(1, b=2.5, $x, word)}");
        assert_eq!(fragments.len(), 1);
        match &fragments[0] {
            Fragment::Function { name, args } => {
                assert_eq!(name, "add");
                assert_eq!(args.args, vec![json!(1), json!("$x"), json!("word")]);
                assert_eq!(args.kwargs["b"], json!(2.5));
            }
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn test_function_without_args() {
        assert_eq!(
            scan("id-${gen()}"),
            vec![
                lit("id-"),
                Fragment::Function {
                    name: "gen".to_string(),
                    args: FunctionArgs::default(),
                }
            ]
        );
    }

    #[test]
    fn test_nested_call_is_not_a_function() {
        // braces are outside the argument character class
        let fragments = scan("${f(${g()})}");
        assert!(!fragments
            .iter()
            .any(|f| matches!(f, Fragment::Function { name, .. } if name == "f")));
    }

    #[test]
    fn test_find_all_variable_names() {
        let names = find_all_variable_names(
            "/users/$uid/training/$data?userId=$uid&x=${f($token, k=$key)}$$skip",
        );
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["uid", "data", "token", "key"]);
    }

    #[test]
    fn test_find_variable_names_in_value() {
        let value = json!({"$hdr": ["$a", {"k": "${b}"}], "n": 1});
        let names = find_variable_names_in_value(&value);
        assert!(names.contains("hdr"));
        assert!(names.contains("a"));
        assert!(names.contains("b"));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_find_all_function_calls() {
        let calls =
            find_all_function_calls("${sleep(1)} and ${add(1, $x)} $$${no}");
        assert_eq!(
            calls,
            vec![
                ("sleep".to_string(), "1".to_string()),
                ("add".to_string(), "1, $x".to_string()),
            ]
        );
    }

    #[test]
    fn test_coerce_scalar() {
        assert_eq!(coerce_scalar("12"), json!(12));
        assert_eq!(coerce_scalar("-3"), json!(-3));
        assert_eq!(coerce_scalar("1.5"), json!(1.5));
        assert_eq!(coerce_scalar("abc"), json!("abc"));
        assert_eq!(coerce_scalar(""), json!(""));
    }
}
