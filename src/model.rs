//! Testcase definitions, the fluent builder API and run results.

use crate::error::{EngineError, EngineResult};
use crate::functions::{Callable, FunctionMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordered name to value mapping used for every variable layer.
pub type Variables = IndexMap<String, Value>;

/// A testcase: config plus ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseDefinition {
    pub config: TestcaseConfig,
    #[serde(default, alias = "teststeps")]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseConfig {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Verify TLS certificates.
    #[serde(default = "default_verify")]
    pub verify: bool,
    #[serde(default)]
    pub variables: Variables,
    /// Parameter sets, one run per row (see [`crate::parameters`]).
    #[serde(default)]
    pub parameters: Variables,
    /// Default headers merged under each request's own headers.
    #[serde(default)]
    pub headers: IndexMap<String, Value>,
    /// Session variables surfaced to the caller after the run.
    #[serde(default)]
    pub export: Vec<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Stop at the first step that does not succeed.
    #[serde(default)]
    pub fail_fast: bool,
    /// Testcase-local function overrides; highest lookup precedence.
    #[serde(skip)]
    pub functions: LocalFunctions,
}

fn default_verify() -> bool {
    true
}

fn default_timeout() -> f64 {
    30.0
}

/// Function overrides attached to a testcase through the builder.
#[derive(Clone, Default)]
pub struct LocalFunctions(pub FunctionMap);

impl fmt::Debug for LocalFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub request: Option<RequestDescriptor>,
    /// Reference to another testcase, by path or inline.
    #[serde(default)]
    pub testcase: Option<TestcaseRef>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub setup_hooks: Vec<Hook>,
    #[serde(default)]
    pub teardown_hooks: Vec<Hook>,
    /// Variable name to response path.
    #[serde(default)]
    pub extract: IndexMap<String, String>,
    #[serde(default, alias = "validators")]
    pub validate: Vec<ValidatorDefinition>,
    /// Renames/prunes the exports of a referenced testcase.
    #[serde(default)]
    pub export: Vec<String>,
    #[serde(default)]
    pub retry_times: u32,
    /// Seconds between retries.
    #[serde(default)]
    pub retry_interval: f64,
}

/// What a step does once its variables are resolved.
#[derive(Debug, Clone, Copy)]
pub enum StepAction<'a> {
    Request(&'a RequestDescriptor),
    Testcase(&'a TestcaseRef),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestcaseRef {
    Path(String),
    Inline(Box<TestcaseDefinition>),
}

/// Setup/teardown hook: either a bare expression evaluated for its side
/// effects, or a single-key mapping binding the result to a name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Hook {
    Call(String),
    Assign(IndexMap<String, Value>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub cookies: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Form mapping or raw text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Multipart fields; values naming files under the project root
    /// are sent as file parts.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub upload: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_redirects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
}

/// One `{check, comparator, expect}` triple.
///
/// Accepts both the explicit form and the short form
/// `{eq: ["status_code", 200]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawValidator")]
pub struct ValidatorDefinition {
    pub check: String,
    pub comparator: String,
    pub expect: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValidator {
    Explicit {
        check: String,
        #[serde(alias = "assert")]
        comparator: String,
        #[serde(alias = "expected")]
        expect: Value,
        #[serde(default)]
        message: Option<String>,
    },
    Short(IndexMap<String, Vec<Value>>),
}

impl TryFrom<RawValidator> for ValidatorDefinition {
    type Error = String;

    fn try_from(raw: RawValidator) -> Result<Self, Self::Error> {
        match raw {
            RawValidator::Explicit {
                check,
                comparator,
                expect,
                message,
            } => Ok(Self {
                check,
                comparator,
                expect,
                message,
            }),
            RawValidator::Short(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "validator must have exactly one comparator key, got {}",
                        map.len()
                    ));
                }
                let Some((comparator, mut items)) = map.into_iter().next()
                else {
                    return Err("empty validator".to_string());
                };
                if items.len() < 2 || items.len() > 3 {
                    return Err(format!(
                        "validator '{comparator}' expects [check, expect] \
                         or [check, expect, message]"
                    ));
                }
                let message = if items.len() == 3 {
                    items.pop().map(|m| match m {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                } else {
                    None
                };
                let expect = items.pop().unwrap_or(Value::Null);
                let check = match items.pop() {
                    Some(Value::String(s)) => s,
                    Some(other) => {
                        return Err(format!(
                            "validator check must be a string, got {other}"
                        ))
                    }
                    None => return Err("missing check".to_string()),
                };
                Ok(Self {
                    check,
                    comparator,
                    expect,
                    message,
                })
            }
        }
    }
}

impl TestcaseDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: TestcaseConfig::new(name),
            steps: Vec::new(),
        }
    }

    /// Deserialize a testcase from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Deserialize a testcase from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.verify = verify;
        self
    }

    pub fn variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.config.variables.insert(name.into(), value.into());
        self
    }

    pub fn parameter(
        mut self,
        names: impl Into<String>,
        rows: impl Into<Value>,
    ) -> Self {
        self.config.parameters.insert(names.into(), rows.into());
        self
    }

    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    pub fn export<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.export.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.config.timeout = seconds;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// Register a testcase-local function.
    pub fn function(mut self, name: impl Into<String>, f: Callable) -> Self {
        self.config.functions.0.insert(name.into(), f);
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }
}

impl TestcaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            verify: default_verify(),
            variables: Variables::new(),
            parameters: Variables::new(),
            headers: IndexMap::new(),
            export: Vec::new(),
            timeout: default_timeout(),
            fail_fast: false,
            functions: LocalFunctions::default(),
        }
    }
}

impl StepDefinition {
    fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request: None,
            testcase: None,
            variables: Variables::new(),
            setup_hooks: Vec::new(),
            teardown_hooks: Vec::new(),
            extract: IndexMap::new(),
            validate: Vec::new(),
            export: Vec::new(),
            retry_times: 0,
            retry_interval: 0.0,
        }
    }

    /// A step issuing `request`.
    pub fn request(name: impl Into<String>, request: RequestDescriptor) -> Self {
        Self {
            request: Some(request),
            ..Self::empty(name)
        }
    }

    /// A step running another testcase inline.
    pub fn testcase(name: impl Into<String>, testcase: TestcaseDefinition) -> Self {
        Self {
            testcase: Some(TestcaseRef::Inline(Box::new(testcase))),
            ..Self::empty(name)
        }
    }

    /// A step running the testcase file at `path` (relative to the
    /// project root).
    pub fn testcase_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            testcase: Some(TestcaseRef::Path(path.into())),
            ..Self::empty(name)
        }
    }

    pub fn variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn extract(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.extract.insert(name.into(), path.into());
        self
    }

    pub fn validate(
        mut self,
        comparator: impl Into<String>,
        check: impl Into<String>,
        expect: impl Into<Value>,
    ) -> Self {
        self.validate.push(ValidatorDefinition {
            check: check.into(),
            comparator: comparator.into(),
            expect: expect.into(),
            message: None,
        });
        self
    }

    pub fn setup_hook(mut self, hook: Hook) -> Self {
        self.setup_hooks.push(hook);
        self
    }

    pub fn teardown_hook(mut self, hook: Hook) -> Self {
        self.teardown_hooks.push(hook);
        self
    }

    pub fn export<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.export.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn retry(mut self, times: u32, interval_secs: f64) -> Self {
        self.retry_times = times;
        self.retry_interval = interval_secs;
        self
    }

    /// Exactly one of `request` / `testcase` must be set.
    pub fn action(&self) -> EngineResult<StepAction<'_>> {
        match (&self.request, &self.testcase) {
            (Some(request), None) => Ok(StepAction::Request(request)),
            (None, Some(testcase)) => Ok(StepAction::Testcase(testcase)),
            (Some(_), Some(_)) => Err(EngineError::params(format!(
                "step '{}' has both a request and a testcase reference",
                self.name
            ))),
            (None, None) => Err(EngineError::params(format!(
                "step '{}' has neither a request nor a testcase reference",
                self.name
            ))),
        }
    }
}

impl Hook {
    pub fn call(expr: impl Into<String>) -> Self {
        Self::Call(expr.into())
    }

    pub fn assign(name: impl Into<String>, expr: impl Into<Value>) -> Self {
        let mut map = IndexMap::new();
        map.insert(name.into(), expr.into());
        Self::Assign(map)
    }
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new("PUT", url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new("PATCH", url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn cookie(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, body: impl Into<Value>) -> Self {
        self.json = Some(body.into());
        self
    }

    pub fn data(mut self, body: impl Into<Value>) -> Self {
        self.data = Some(body.into());
        self
    }

    pub fn upload(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.upload.insert(field.into(), value.into());
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = Some(allow);
        self
    }
}

// ── results ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    /// A comparator did not hold.
    Failed,
    /// Resolution, transport or definition error.
    Errored,
}

/// Result of running a single testcase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseResult {
    pub name: String,
    pub success: bool,
    pub steps: Vec<StepResult>,
    pub export_vars: Variables,
    pub duration_ms: u64,
}

impl TestcaseResult {
    /// The first step that errored, as opposed to merely failing an
    /// assertion.
    pub fn first_errored(&self) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Errored)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
    }
}

/// Result of running a single step within a testcase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    pub export_vars: Variables,
    /// Request/response pairs, redirect hops first.
    pub records: Vec<RequestResponseRecord>,
    pub validators: Vec<ValidationOutcome>,
    /// Result of the referenced testcase, for testcase steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcase: Option<Box<TestcaseResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResponseRecord {
    pub request: RequestRecord,
    pub response: ResponseRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status_code: u16,
    pub headers: IndexMap<String, String>,
    pub cookies: IndexMap<String, String>,
    pub body: Value,
    pub elapsed_ms: u64,
}

/// Outcome of one validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub check: String,
    pub comparator: String,
    pub expect: Value,
    pub actual: Value,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationOutcome {
    pub fn to_error(&self) -> EngineError {
        EngineError::ValidationFailure {
            check: self.check.clone(),
            comparator: self.comparator.clone(),
            expected: self.expect.clone(),
            actual: self.actual.clone(),
            message: self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TESTCASE_YAML: &str = r#"
config:
  name: login flow
  base_url: http://example.com
  variables:
    user: alice
  export: [token]
teststeps:
  - name: login
    request:
      method: POST
      url: /login
      json:
        user: $user
    extract:
      token: body.token
    validate:
      - eq: ["status_code", 200]
      - check: body.token
        assert: length_greater_than
        expect: 0
        message: token must not be empty
  - name: reuse
    testcase: other.yml
    export: [token]
    retry_times: 2
    retry_interval: 0.5
"#;

    #[test]
    fn test_testcase_from_yaml() {
        let tc = TestcaseDefinition::from_yaml(TESTCASE_YAML).unwrap();
        assert_eq!(tc.config.name, "login flow");
        assert!(tc.config.verify);
        assert_eq!(tc.config.timeout, 30.0);
        assert_eq!(tc.config.export, vec!["token"]);
        assert_eq!(tc.steps.len(), 2);

        let login = &tc.steps[0];
        assert!(matches!(login.action().unwrap(), StepAction::Request(_)));
        assert_eq!(login.extract["token"], "body.token");
        assert_eq!(login.validate[0].comparator, "eq");
        assert_eq!(login.validate[0].check, "status_code");
        assert_eq!(login.validate[0].expect, json!(200));
        assert_eq!(login.validate[1].comparator, "length_greater_than");
        assert_eq!(
            login.validate[1].message.as_deref(),
            Some("token must not be empty")
        );

        let reuse = &tc.steps[1];
        assert!(matches!(
            reuse.action().unwrap(),
            StepAction::Testcase(TestcaseRef::Path(p)) if p == "other.yml"
        ));
        assert_eq!(reuse.retry_times, 2);
    }

    #[test]
    fn test_short_validator_with_message() {
        let v: ValidatorDefinition =
            serde_json::from_value(json!({"len_eq": ["body.items", 3, "three items"]}))
                .unwrap();
        assert_eq!(v.check, "body.items");
        assert_eq!(v.expect, json!(3));
        assert_eq!(v.message.as_deref(), Some("three items"));
    }

    #[test]
    fn test_short_validator_rejects_bad_shape() {
        let result: Result<ValidatorDefinition, _> =
            serde_json::from_value(json!({"eq": ["status_code"]}));
        assert!(result.is_err());
    }

    #[test]
    fn test_step_action_requires_exactly_one() {
        let mut step = StepDefinition::request("s", RequestDescriptor::get("/"));
        step.testcase = Some(TestcaseRef::Path("x.yml".into()));
        assert!(matches!(step.action(), Err(EngineError::Params(_))));

        step.request = None;
        step.testcase = None;
        assert!(matches!(step.action(), Err(EngineError::Params(_))));
    }

    #[test]
    fn test_builder() {
        let tc = TestcaseDefinition::new("built")
            .base_url("http://localhost")
            .variable("uid", 100)
            .export(["token"])
            .step(
                StepDefinition::request(
                    "get user",
                    RequestDescriptor::get("/users/$uid").header("X-Trace", "1"),
                )
                .extract("token", "body.token")
                .validate("eq", "status_code", 200)
                .retry(2, 1.0),
            );
        assert_eq!(tc.config.variables["uid"], json!(100));
        assert_eq!(tc.steps[0].validate.len(), 1);
        assert_eq!(tc.steps[0].retry_times, 2);

        // survives a YAML round trip through the loader format
        let yaml = tc.to_yaml().unwrap();
        let parsed = TestcaseDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.steps[0].name, "get user");
        assert_eq!(parsed.steps[0].validate[0].comparator, "eq");
    }
}
