//! Apply `{check, comparator, expect}` validators to a response view.

use crate::comparators::{self, uniform_comparator};
use crate::error::{EngineError, EngineResult};
use crate::functions::{FunctionRegistry, Kwargs};
use crate::model::{ValidationOutcome, ValidatorDefinition, Variables};
use crate::resolver::{resolve_string, resolve_value};
use crate::response::ResponseView;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationMode {
    /// Stop at the first validator that does not hold.
    #[default]
    FailFast,
    /// Evaluate every validator.
    CollectAll,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub outcomes: Vec<ValidationOutcome>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn first_failure(&self) -> Option<&ValidationOutcome> {
        self.outcomes.iter().find(|o| !o.passed)
    }

    /// `Err(ValidationFailure)` for the first failed validator.
    pub fn into_result(self) -> EngineResult<Vec<ValidationOutcome>> {
        match self.first_failure() {
            Some(failed) => Err(failed.to_error()),
            None => Ok(self.outcomes),
        }
    }
}

pub struct Validator<'a> {
    functions: &'a FunctionRegistry,
    mode: ValidationMode,
}

impl<'a> Validator<'a> {
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        Self {
            functions,
            mode: ValidationMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Evaluate `validators` in declared order.
    ///
    /// A comparator that does not hold is recorded in the report; a
    /// check that cannot be evaluated at all (unknown path, unresolvable
    /// expression, unknown comparator) is returned as an error.
    pub fn validate(
        &self,
        validators: &[ValidatorDefinition],
        variables: &Variables,
        view: &ResponseView,
    ) -> EngineResult<ValidationReport> {
        let mut report = ValidationReport::default();

        for validator in validators {
            let actual = self.check_value(&validator.check, variables, view)?;
            let expect = resolve_value(&validator.expect, variables, self.functions)?;
            let comparator = uniform_comparator(&validator.comparator);

            let verdict = self.apply(&comparator, &actual, &expect)?;
            let passed = verdict.is_ok();
            if passed {
                debug!("Validator passed: {} {} {}", validator.check, comparator, expect);
            } else {
                warn!(
                    "Validator failed: {} {} {} (actual: {})",
                    validator.check, comparator, expect, actual
                );
            }

            report.outcomes.push(ValidationOutcome {
                check: validator.check.clone(),
                comparator,
                expect,
                actual,
                passed,
                message: match verdict {
                    Ok(()) => validator.message.clone(),
                    Err(detail) => Some(validator.message.clone().unwrap_or(detail)),
                },
            });

            if !passed && self.mode == ValidationMode::FailFast {
                break;
            }
        }

        Ok(report)
    }

    /// Bound variable names and `$` expressions read from the scope;
    /// everything else is a response path.
    fn check_value(
        &self,
        check: &str,
        variables: &Variables,
        view: &ResponseView,
    ) -> EngineResult<Value> {
        if check.contains('$') {
            return resolve_string(check, variables, self.functions);
        }
        if let Some(value) = variables.get(check) {
            return Ok(value.clone());
        }
        view.search(check)
    }

    /// `Ok(Err(detail))` when the comparator does not hold.
    fn apply(
        &self,
        comparator: &str,
        actual: &Value,
        expect: &Value,
    ) -> EngineResult<Result<(), String>> {
        if comparators::is_builtin(comparator) {
            return Ok(comparators::compare(comparator, actual, expect));
        }

        let args = [actual.clone(), expect.clone()];
        match self.functions.call(comparator, &args, &Kwargs::new()) {
            Ok(Value::Bool(false)) => Ok(Err(format!(
                "{comparator}({actual}, {expect}) returned false"
            ))),
            Ok(_) => Ok(Ok(())),
            Err(EngineError::FunctionCall { reason, .. }) => Ok(Err(reason)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{callable, FunctionMap};
    use serde_json::json;

    fn view() -> ResponseView {
        let fields: Variables = serde_json::from_value(json!({
            "status_code": 200,
            "headers": {"content-type": "application/json"},
            "body": {"token": "abc123", "items": [1, 2, 3]}
        }))
        .unwrap();
        ResponseView::from_fields(fields)
    }

    fn validator(comparator: &str, check: &str, expect: Value) -> ValidatorDefinition {
        ValidatorDefinition {
            check: check.into(),
            comparator: comparator.into(),
            expect,
            message: None,
        }
    }

    #[test]
    fn test_equals_passes_and_fails() {
        let fns = FunctionRegistry::default();
        let v = Validator::new(&fns);

        let report = v
            .validate(&[validator("eq", "status_code", json!(200))], &Variables::new(), &view())
            .unwrap();
        assert!(report.passed());
        assert_eq!(report.outcomes[0].comparator, "equals");

        let report = v
            .validate(&[validator("equals", "status_code", json!(201))], &Variables::new(), &view())
            .unwrap();
        let failed = report.first_failure().unwrap();
        assert_eq!(failed.actual, json!(200));
        assert_eq!(failed.expect, json!(201));
        match report.into_result() {
            Err(EngineError::ValidationFailure { actual, expected, .. }) => {
                assert_eq!(actual, json!(200));
                assert_eq!(expected, json!(201));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_fail_fast_and_collect_all() {
        let fns = FunctionRegistry::default();
        let validators = [
            validator("eq", "status_code", json!(500)),
            validator("len_eq", "body.items", json!(3)),
            validator("eq", "body.token", json!("nope")),
        ];

        let strict = Validator::new(&fns)
            .validate(&validators, &Variables::new(), &view())
            .unwrap();
        assert_eq!(strict.outcomes.len(), 1);

        let all = Validator::new(&fns)
            .with_mode(ValidationMode::CollectAll)
            .validate(&validators, &Variables::new(), &view())
            .unwrap();
        let passed: Vec<bool> = all.outcomes.iter().map(|o| o.passed).collect();
        assert_eq!(passed, vec![false, true, false]);
    }

    #[test]
    fn test_check_from_variables() {
        let fns = FunctionRegistry::default();
        let vars: Variables = serde_json::from_value(json!({"token": "abc123", "n": 3})).unwrap();
        let report = Validator::new(&fns)
            .validate(
                &[
                    validator("eq", "token", json!("abc123")),
                    validator("eq", "${len(abc)}", json!(3)),
                ],
                &vars,
                &view(),
            )
            .unwrap();
        assert!(report.passed());

        let report = Validator::new(&fns)
            .validate(&[validator("gt", "$n", json!("$n"))], &vars, &view())
            .unwrap();
        assert!(!report.passed());
    }

    #[test]
    fn test_expect_is_resolved() {
        let fns = FunctionRegistry::default();
        let vars: Variables = serde_json::from_value(json!({"expected": "abc123"})).unwrap();
        let report = Validator::new(&fns)
            .validate(&[validator("eq", "body.token", json!("$expected"))], &vars, &view())
            .unwrap();
        assert!(report.passed());
    }

    #[test]
    fn test_bad_check_path_is_an_error() {
        let fns = FunctionRegistry::default();
        let result = Validator::new(&fns).validate(
            &[validator("eq", "body.missing", json!(1))],
            &Variables::new(),
            &view(),
        );
        assert!(matches!(result, Err(EngineError::ExtractFailure { .. })));
    }

    #[test]
    fn test_custom_comparator() {
        let mut map = FunctionMap::new();
        map.insert(
            "is_even".into(),
            callable(|args, _| Ok(json!(args[0].as_i64().unwrap_or(1) % 2 == 0))),
        );
        let fns = FunctionRegistry::default().with_project_functions(map);

        let report = Validator::new(&fns)
            .with_mode(ValidationMode::CollectAll)
            .validate(
                &[
                    validator("is_even", "status_code", Value::Null),
                    validator("is_even", "body.items[0]", Value::Null),
                ],
                &Variables::new(),
                &view(),
            )
            .unwrap();
        assert!(report.outcomes[0].passed);
        assert!(!report.outcomes[1].passed);

        let unknown = Validator::new(&fns).validate(
            &[validator("no_such_comparator", "status_code", json!(1))],
            &Variables::new(),
            &view(),
        );
        assert!(matches!(unknown, Err(EngineError::FunctionNotFound(_))));
    }

    #[test]
    fn test_user_message_is_kept() {
        let fns = FunctionRegistry::default();
        let mut v = validator("eq", "status_code", json!(404));
        v.message = Some("expected a 404".into());
        let report = Validator::new(&fns).validate(&[v], &Variables::new(), &view()).unwrap();
        assert_eq!(report.outcomes[0].message.as_deref(), Some("expected a 404"));
    }
}
