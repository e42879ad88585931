//! Build a fully resolved variable scope from raw definitions that may
//! reference each other.

use crate::error::{EngineError, EngineResult};
use crate::functions::FunctionRegistry;
use crate::model::Variables;
use crate::parser::find_variable_names_in_value;
use crate::resolver::resolve_value;
use tracing::debug;

/// Resolve `raw` on its own.
pub fn build_scope(raw: &Variables, functions: &FunctionRegistry) -> EngineResult<Variables> {
    build_scope_over(&Variables::new(), raw, functions)
}

/// Resolve `raw` on top of an already resolved `base`. Keys in `raw`
/// shadow keys in `base`; the result keeps base entries first, then the
/// raw entries in declaration order.
///
/// Entries are resolved in dependency order. Self references, names
/// defined nowhere, and cycles are reported instead of looping.
pub fn build_scope_over(
    base: &Variables,
    raw: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<Variables> {
    let mut scope: Variables = base
        .iter()
        .filter(|(name, _)| !raw.contains_key(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut pending: Vec<&String> = raw.keys().collect();
    let mut resolved = Variables::with_capacity(raw.len());

    while !pending.is_empty() {
        let mut deferred = Vec::new();

        for name in pending.iter().copied() {
            let value = &raw[name];
            let refs = find_variable_names_in_value(value);

            if refs.contains(name) {
                return Err(EngineError::VariableNotFound(vec![name.clone()]));
            }

            let missing: Vec<String> = refs
                .iter()
                .filter(|r| !scope.contains_key(*r) && !raw.contains_key(*r))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(EngineError::VariableNotFound(missing));
            }

            if refs.iter().any(|r| !scope.contains_key(r)) {
                deferred.push(name);
                continue;
            }

            let value = resolve_value(value, &scope, functions)?;
            scope.insert(name.clone(), value.clone());
            resolved.insert(name.clone(), value);
        }

        if deferred.len() == pending.len() {
            let names: Vec<String> = deferred.into_iter().cloned().collect();
            debug!("Unresolvable variables: {names:?}");
            return Err(EngineError::CyclicVariableReference(names));
        }
        pending = deferred;
    }

    // declaration order for the raw layer
    let mut ordered: Variables = scope
        .into_iter()
        .filter(|(name, _)| !raw.contains_key(name))
        .collect();
    for name in raw.keys() {
        if let Some(value) = resolved.shift_remove(name) {
            ordered.insert(name.clone(), value);
        }
    }
    Ok(ordered)
}

/// `overrides` layered over `base`; overriding keys keep base position.
pub fn merge_variables(base: &Variables, overrides: &Variables) -> Variables {
    let mut merged = base.clone();
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn vars(value: Value) -> Variables {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_dependency_chain() {
        let raw = vars(json!({
            "url": "$host/api/$version",
            "version": "v$major",
            "major": 2,
            "host": "http://h",
        }));
        let scope = build_scope(&raw, &FunctionRegistry::default()).unwrap();
        assert_eq!(scope["url"], json!("http://h/api/v2"));
        assert_eq!(scope["major"], json!(2));
        let order: Vec<&str> = scope.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["url", "version", "major", "host"]);
    }

    #[test]
    fn test_base_layer() {
        let base = vars(json!({"token": "abc", "uid": 1}));
        let raw = vars(json!({"uid": 2, "auth": "Bearer $token"}));
        let scope = build_scope_over(&base, &raw, &FunctionRegistry::default()).unwrap();
        assert_eq!(scope["uid"], json!(2));
        assert_eq!(scope["auth"], json!("Bearer abc"));
        let order: Vec<&str> = scope.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["token", "uid", "auth"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let raw = vars(json!({"a": "$b", "b": "$c", "c": "${a}", "d": 1}));
        match build_scope(&raw, &FunctionRegistry::default()) {
            Err(EngineError::CyclicVariableReference(names)) => {
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_self_reference() {
        let raw = vars(json!({"a": "x$a"}));
        assert!(matches!(
            build_scope(&raw, &FunctionRegistry::default()),
            Err(EngineError::VariableNotFound(names)) if names == vec!["a"]
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let raw = vars(json!({"a": "$b", "c": 1}));
        assert!(matches!(
            build_scope(&raw, &FunctionRegistry::default()),
            Err(EngineError::VariableNotFound(names)) if names == vec!["b"]
        ));
    }

    #[test]
    fn test_merge_variables() {
        let merged = merge_variables(&vars(json!({"a": 1, "b": 2})), &vars(json!({"b": 3, "c": 4})));
        assert_eq!(merged, vars(json!({"a": 1, "b": 3, "c": 4})));
    }
}
