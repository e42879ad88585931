//! Testcase execution logic

use crate::config::{ProjectContext, RunnerOptions, TestcaseLoader};
use crate::error::{EngineError, EngineResult};
use crate::functions::FunctionRegistry;
use crate::model::{TestcaseDefinition, TestcaseResult, Variables};
use crate::parameters::expand_parameters;
use crate::resolver::{resolve_string, resolve_value, stringify};
use crate::scope::build_scope_over;
use crate::step::StepContext;
use crate::transport::{ReqwestTransport, Transport};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Referenced testcases deeper than this are rejected, which also cuts
/// testcases that reference themselves.
pub const MAX_NESTING: usize = 32;

type TestcaseFuture<'a> = Pin<Box<dyn Future<Output = EngineResult<TestcaseResult>> + Send + 'a>>;

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute a testcase with no seed variables
    async fn run(&self, testcase: &TestcaseDefinition) -> EngineResult<TestcaseResult> {
        self.run_with_variables(testcase, &Variables::new()).await
    }

    /// Execute a testcase; `seed` takes precedence over its config
    /// variables
    async fn run_with_variables(
        &self,
        testcase: &TestcaseDefinition,
        seed: &Variables,
    ) -> EngineResult<TestcaseResult>;
}

/// Depth and inherited fail-fast policy of a testcase run.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Nesting {
    depth: usize,
    fail_fast: bool,
}

impl Nesting {
    pub(crate) fn child(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }
}

/// Default test runner
pub struct DefaultTestRunner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) loader: TestcaseLoader,
    pub(crate) options: RunnerOptions,
}

impl DefaultTestRunner {
    /// Runner over a fresh reqwest transport and the current directory
    /// as project root
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_transport(Arc::new(ReqwestTransport::new()?)))
    }

    /// Runner over a custom transport
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            functions: FunctionRegistry::default(),
            loader: TestcaseLoader::default(),
            options: RunnerOptions::default(),
        }
    }

    /// Use `project` for function lookups and testcase references.
    pub fn with_project(mut self, project: ProjectContext) -> Self {
        self.loader = TestcaseLoader::new(project.clone());
        self.functions = FunctionRegistry::new(project);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.loader = TestcaseLoader::new(functions.project().clone());
        self.functions = functions;
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn loader(&self) -> &TestcaseLoader {
        &self.loader
    }

    /// One run per row of `config.parameters`; a single run when there
    /// are none.
    pub async fn run_parameterized(
        &self,
        testcase: &TestcaseDefinition,
    ) -> EngineResult<Vec<TestcaseResult>> {
        let functions = self.functions.with_overrides(&testcase.config.functions.0);
        let rows = expand_parameters(&testcase.config.parameters, &functions)?;
        if rows.len() > 1 {
            info!(
                "Testcase '{}' expands to {} parameterized runs",
                testcase.config.name,
                rows.len()
            );
        }

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(self.run_with_variables(testcase, row).await?);
        }
        Ok(results)
    }

    pub(crate) fn run_testcase<'a>(
        &'a self,
        testcase: &'a TestcaseDefinition,
        seed: &'a Variables,
        nesting: Nesting,
    ) -> TestcaseFuture<'a> {
        Box::pin(async move {
            if nesting.depth > MAX_NESTING {
                return Err(EngineError::params(format!(
                    "testcase '{}' exceeds the nesting limit of {MAX_NESTING} referenced testcases",
                    testcase.config.name
                )));
            }

            let start_time = Instant::now();
            let config = &testcase.config;
            let functions = self.functions.with_overrides(&config.functions.0);

            let config_vars: Variables = config
                .variables
                .iter()
                .filter(|(name, _)| !seed.contains_key(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            let mut session = build_scope_over(seed, &config_vars, &functions)?;

            let name = stringify(&resolve_string(&config.name, &session, &functions)?);
            info!("Starting testcase: {}", name);

            let base_url = match (&self.options.base_url, nesting.depth) {
                (Some(url), 0) => Some(url.clone()),
                _ => match &config.base_url {
                    Some(url) => Some(stringify(&resolve_string(url, &session, &functions)?)),
                    None => None,
                },
            };
            let headers = resolve_headers(&config.headers, &session, &functions)?;
            let fail_fast = self.options.fail_fast || config.fail_fast || nesting.fail_fast;

            let ctx = StepContext {
                testcase: name.clone(),
                base_url,
                headers,
                verify: config.verify,
                timeout: self.options.timeout.unwrap_or(config.timeout),
                functions,
                nesting: Nesting {
                    depth: nesting.depth,
                    fail_fast,
                },
            };

            let mut steps = Vec::with_capacity(testcase.steps.len());
            for (step_idx, step) in testcase.steps.iter().enumerate() {
                info!(
                    "Running step {}/{}: {}",
                    step_idx + 1,
                    testcase.steps.len(),
                    step.name
                );

                let result = self.execute_step(step, &session, &ctx).await;
                for (key, value) in &result.export_vars {
                    session.insert(key.clone(), value.clone());
                }
                let passed = result.success;
                steps.push(result);

                if !passed && fail_fast {
                    info!("Stopping testcase due to step failure");
                    break;
                }
            }

            let success = steps.iter().all(|s| s.success);
            let mut export_vars = Variables::new();
            for key in &config.export {
                match session.get(key) {
                    Some(value) => {
                        export_vars.insert(key.clone(), value.clone());
                    }
                    None => {
                        if let Some(errored) = steps.iter().find(|s| !s.success) {
                            warn!("Testcase '{}' failed at step '{}'", name, errored.name);
                        }
                        return Err(EngineError::params(format!(
                            "testcase '{name}' exports '{key}' but it was never bound"
                        )));
                    }
                }
            }

            let result = TestcaseResult {
                name,
                success,
                steps,
                export_vars,
                duration_ms: start_time.elapsed().as_millis() as u64,
            };

            info!(
                "Testcase finished: {} ({} ms) - Success: {}",
                result.name, result.duration_ms, result.success
            );
            if let Some(errored) = result.first_errored() {
                warn!("First errored step: {}", errored.name);
            }

            Ok(result)
        })
    }
}

fn resolve_headers(
    headers: &IndexMap<String, Value>,
    session: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<IndexMap<String, String>> {
    let mut resolved = IndexMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = stringify(&resolve_string(name, session, functions)?);
        resolved.insert(name, stringify(&resolve_value(value, session, functions)?));
    }
    Ok(resolved)
}

#[async_trait]
impl TestRunner for DefaultTestRunner {
    #[instrument(skip(self, testcase, seed), fields(name = %testcase.config.name))]
    async fn run_with_variables(
        &self,
        testcase: &TestcaseDefinition,
        seed: &Variables,
    ) -> EngineResult<TestcaseResult> {
        self.run_testcase(testcase, seed, Nesting::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::callable;
    use crate::model::{
        Hook, RequestDescriptor, StepDefinition, StepStatus, TestcaseRef,
    };
    use crate::transport::{HttpRequest, HttpResponse, RequestBody, ResponseBody};
    use anyhow::anyhow;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned responses and records every request it sees.
    #[derive(Default)]
    struct MockTransport {
        responses: Mutex<VecDeque<anyhow::Result<(u16, Value)>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        fn new(responses: Vec<anyhow::Result<(u16, Value)>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: &HttpRequest) -> anyhow::Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok((200, json!({}))));
            let (status_code, body) = next?;
            let mut headers = IndexMap::new();
            headers.insert("content-type".to_string(), "application/json".to_string());
            Ok(HttpResponse {
                status_code,
                reason: String::new(),
                url: request.url.clone(),
                headers,
                cookies: IndexMap::new(),
                body: ResponseBody::Json(body),
                encoding: None,
                elapsed: Duration::from_millis(1),
                history: Vec::new(),
            })
        }
    }

    fn runner(transport: Arc<MockTransport>) -> DefaultTestRunner {
        DefaultTestRunner::with_transport(transport)
    }

    fn ok(body: Value) -> anyhow::Result<(u16, Value)> {
        Ok((200, body))
    }

    #[tokio::test]
    async fn test_token_threads_between_steps() {
        let transport = MockTransport::new(vec![ok(json!({"token": "abc123"})), ok(json!({}))]);
        let testcase = TestcaseDefinition::new("login flow")
            .base_url("http://api.local")
            .step(
                StepDefinition::request("login", RequestDescriptor::post("/login"))
                    .extract("token", "body.token")
                    .validate("eq", "status_code", 200),
            )
            .step(StepDefinition::request(
                "echo",
                RequestDescriptor::post("/echo").json("$token"),
            ));

        let result = runner(transport.clone()).run(&testcase).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps[0].export_vars["token"], json!("abc123"));

        let requests = transport.requests();
        assert_eq!(requests[1].url, "http://api.local/echo");
        assert!(matches!(&requests[1].body, RequestBody::Json(v) if v == &json!("abc123")));
    }

    #[tokio::test]
    async fn test_collect_all_runs_every_step() {
        let transport = MockTransport::new(vec![Ok((500, json!({}))), ok(json!({}))]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .step(
                StepDefinition::request("first", RequestDescriptor::get("/a"))
                    .validate("eq", "status_code", 200),
            )
            .step(StepDefinition::request("second", RequestDescriptor::get("/b")));

        let result = runner(transport).run(&testcase).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert_eq!(result.steps[0].validators[0].actual, json!(500));
        assert!(result.steps[1].success);
        assert!(result.first_errored().is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_stops() {
        let transport = MockTransport::new(vec![Err(anyhow!("connection refused"))]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .fail_fast(true)
            .step(StepDefinition::request("first", RequestDescriptor::get("/a")))
            .step(StepDefinition::request("second", RequestDescriptor::get("/b")));

        let result = runner(transport).run(&testcase).await.unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].status, StepStatus::Errored);
        assert_eq!(result.first_errored().map(|s| s.name.as_str()), Some("first"));
    }

    #[tokio::test]
    async fn test_retry_until_pass() {
        let transport = MockTransport::new(vec![
            Ok((503, json!({}))),
            Err(anyhow!("timed out")),
            ok(json!({})),
        ]);
        let testcase = TestcaseDefinition::new("t").base_url("http://api.local").step(
            StepDefinition::request("flaky", RequestDescriptor::get("/a"))
                .validate("eq", "status_code", 200)
                .retry(2, 0.05),
        );

        let result = runner(transport.clone()).run(&testcase).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps[0].attempts, 3);
        assert!(result.steps[0].elapsed_ms >= 100);
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = MockTransport::new(vec![Ok((500, json!({}))), Ok((500, json!({})))]);
        let testcase = TestcaseDefinition::new("t").base_url("http://api.local").step(
            StepDefinition::request("down", RequestDescriptor::get("/a"))
                .validate("eq", "status_code", 200)
                .retry(1, 0.0),
        );
        let result = runner(transport).run(&testcase).await.unwrap();
        assert_eq!(result.steps[0].attempts, 2);
        assert_eq!(result.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_definition_errors_are_not_retried() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("t").base_url("http://api.local").step(
            StepDefinition::request("bad", RequestDescriptor::get("/users/$missing"))
                .retry(3, 0.0),
        );
        let result = runner(transport.clone()).run(&testcase).await.unwrap();
        assert_eq!(result.steps[0].attempts, 1);
        assert_eq!(result.steps[0].status, StepStatus::Errored);
        assert!(result.steps[0].error.as_deref().unwrap().contains("missing"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unbound_export_is_params_error() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .export(["neverset"])
            .step(StepDefinition::request("s", RequestDescriptor::get("/")));
        match runner(transport).run(&testcase).await {
            Err(EngineError::Params(msg)) => assert!(msg.contains("neverset")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unbound_export_of_failed_run_is_params_error() {
        let transport = MockTransport::new(vec![Err(anyhow!("connection refused"))]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .export(["neverset"])
            .step(StepDefinition::request("s", RequestDescriptor::get("/")));
        match runner(transport).run(&testcase).await {
            Err(EngineError::Params(msg)) => assert!(msg.contains("neverset")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_huge_retry_interval_errors_the_step() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("t").base_url("http://api.local").step(
            StepDefinition::request("s", RequestDescriptor::get("/")).retry(0, 1e20),
        );
        let result = runner(transport.clone()).run(&testcase).await.unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Errored);
        assert!(result.steps[0].error.as_deref().unwrap().contains("retry_interval"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_config_variables_and_seed() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("user $uid")
            .base_url("http://api.local")
            .variable("uid", 1)
            .variable("path", "/users/$uid")
            .export(["path"])
            .step(StepDefinition::request("s", RequestDescriptor::get("$path")));

        let mut seed = Variables::new();
        seed.insert("uid".into(), json!(42));
        let result = runner(transport.clone())
            .run_with_variables(&testcase, &seed)
            .await
            .unwrap();
        assert_eq!(result.name, "user 42");
        assert_eq!(result.export_vars["path"], json!("/users/42"));
        assert_eq!(transport.requests()[0].url, "http://api.local/users/42");
    }

    #[tokio::test]
    async fn test_step_variables_shadow_session() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .variable("who", "config")
            .header("X-Who", "$who")
            .step(
                StepDefinition::request(
                    "s",
                    RequestDescriptor::get("/$who").header("X-Step", "$who"),
                )
                .variable("who", "step"),
            );
        runner(transport.clone()).run(&testcase).await.unwrap();
        let request = &transport.requests()[0];
        assert_eq!(request.url, "http://api.local/step");
        assert_eq!(request.headers["X-Step"], "step");
        assert_eq!(request.headers["X-Who"], "config");
    }

    #[tokio::test]
    async fn test_referenced_testcase_exports() {
        let transport = MockTransport::new(vec![ok(json!({"token": "nested-token"})), ok(json!({}))]);
        let login = TestcaseDefinition::new("login")
            .step(
                StepDefinition::request("login", RequestDescriptor::post("/login").json(json!({"user": "$user"})))
                    .extract("token", "body.token"),
            );
        let testcase = TestcaseDefinition::new("outer")
            .base_url("http://api.local")
            .step(
                StepDefinition::testcase("do login", login)
                    .variable("user", "alice")
                    .export(["token"]),
            )
            .step(StepDefinition::request(
                "use token",
                RequestDescriptor::get("/me").header("Authorization", "Bearer $token"),
            ));

        let result = runner(transport.clone()).run(&testcase).await.unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(result.steps[0].export_vars["token"], json!("nested-token"));
        assert!(result.steps[0].testcase.is_some());

        let requests = transport.requests();
        // base url inherited by the nested testcase
        assert_eq!(requests[0].url, "http://api.local/login");
        assert!(matches!(&requests[0].body, RequestBody::Json(v) if v == &json!({"user": "alice"})));
        assert_eq!(requests[1].headers["Authorization"], "Bearer nested-token");
    }

    #[tokio::test]
    async fn test_failed_referenced_testcase() {
        let transport = MockTransport::new(vec![Ok((401, json!({})))]);
        let inner = TestcaseDefinition::new("inner").step(
            StepDefinition::request("s", RequestDescriptor::get("/x"))
                .validate("eq", "status_code", 200),
        );
        let testcase = TestcaseDefinition::new("outer")
            .base_url("http://api.local")
            .step(StepDefinition::testcase("ref", inner));
        let result = runner(transport).run(&testcase).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        let nested = result.steps[0].testcase.as_ref().unwrap();
        assert_eq!(nested.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_self_referencing_testcase_hits_nesting_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("loop.yml"),
            "config:\n  name: loop\nteststeps:\n  - name: again\n    testcase: loop.yml\n",
        )
        .unwrap();
        let transport = MockTransport::new(vec![]);
        let runner = runner(transport).with_project(ProjectContext::new(dir.path()));
        let testcase = runner.loader().load_testcase("loop.yml").unwrap();

        let result = runner.run(&testcase).await.unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Errored);
        // the innermost failure is the nesting limit
        let mut current = &result;
        while let Some(nested) = current.steps[0].testcase.as_deref() {
            current = nested;
        }
        assert!(current.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("nesting limit"));
    }

    #[tokio::test]
    async fn test_hooks() {
        let transport = MockTransport::new(vec![ok(json!({"items": [1, 2, 3]}))]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .function(
                "sign",
                callable(|args, _| {
                    let mut request = args[0].clone();
                    request["headers"]["X-Signature"] = json!("signed");
                    Ok(request)
                }),
            )
            .function(
                "count_items",
                callable(|args, _| {
                    let n = args[0]["body"]["items"].as_array().map_or(0, Vec::len);
                    Ok(json!(n))
                }),
            )
            .step(
                StepDefinition::request("s", RequestDescriptor::get("/items"))
                    .setup_hook(Hook::assign("request", "${sign($request)}"))
                    .teardown_hook(Hook::assign("total", "${count_items($response)}"))
                    .validate("eq", "total", 3)
                    .validate("eq", "$total", 3),
            );

        let result = runner(transport.clone()).run(&testcase).await.unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(transport.requests()[0].headers["X-Signature"], "signed");
    }

    #[tokio::test]
    async fn test_regex_extraction_and_bad_extract() {
        let transport = MockTransport::new(vec![ok(json!({"id": "us_42"})), ok(json!({}))]);
        let testcase = TestcaseDefinition::new("t")
            .base_url("http://api.local")
            .step(
                StepDefinition::request("a", RequestDescriptor::get("/a"))
                    .extract("num", r#""us_(\d+)""#),
            )
            .step(
                StepDefinition::request("b", RequestDescriptor::get("/b"))
                    .extract("x", "body.nope"),
            );
        let result = runner(transport).run(&testcase).await.unwrap();
        assert_eq!(result.steps[0].export_vars["num"], json!("42"));
        assert_eq!(result.steps[1].status, StepStatus::Errored);
    }

    #[tokio::test]
    async fn test_parameterized_runs() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("param $user")
            .base_url("http://api.local")
            .parameter("user-pass", json!([["a", "1"], ["b", "2"]]))
            .parameter("lang", json!(["en", "fr"]))
            .step(StepDefinition::request(
                "s",
                RequestDescriptor::get("/$user/$pass/$lang"),
            ));

        let results = runner(transport.clone())
            .run_parameterized(&testcase)
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        let urls: Vec<String> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec![
                "http://api.local/a/1/en",
                "http://api.local/a/1/fr",
                "http://api.local/b/2/en",
                "http://api.local/b/2/fr",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_testcase_file() {
        let transport = MockTransport::new(vec![]);
        let testcase = TestcaseDefinition::new("t")
            .step(StepDefinition::testcase_path("ref", "does/not/exist.yml"));
        let result = runner(transport).run(&testcase).await.unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Errored);
        assert!(matches!(
            testcase.steps[0].testcase,
            Some(TestcaseRef::Path(_))
        ));
    }
}
