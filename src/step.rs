//! Step execution: variable merge, request resolution, hooks, sending,
//! extraction and validation, wrapped in the retry policy.

use crate::error::{EngineError, EngineResult};
use crate::functions::{FunctionRegistry, Kwargs};
use crate::model::{
    Hook, RequestDescriptor, RequestResponseRecord, StepAction, StepDefinition, StepResult,
    StepStatus, TestcaseRef, TestcaseResult, ValidationOutcome, Variables,
};
use crate::resolver::{resolve_string, resolve_value, stringify};
use crate::response::ResponseView;
use crate::runner::{DefaultTestRunner, Nesting};
use crate::scope::build_scope_over;
use crate::transport::{HttpRequest, MultipartForm, RequestBody};
use crate::validator::Validator;
use indexmap::IndexMap;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Testcase-level settings a step runs under.
#[derive(Debug, Clone)]
pub(crate) struct StepContext {
    pub testcase: String,
    pub base_url: Option<String>,
    pub headers: IndexMap<String, String>,
    pub verify: bool,
    pub timeout: f64,
    pub functions: FunctionRegistry,
    pub nesting: Nesting,
}

/// What one attempt produced, kept even when the attempt fails.
#[derive(Debug, Default)]
struct Attempt {
    records: Vec<RequestResponseRecord>,
    validators: Vec<ValidationOutcome>,
    testcase: Option<Box<TestcaseResult>>,
}

impl DefaultTestRunner {
    /// Run `step` against the current session, retrying per its policy.
    #[instrument(skip(self, step, session, ctx), fields(step = %step.name))]
    pub(crate) async fn execute_step(
        &self,
        step: &StepDefinition,
        session: &Variables,
        ctx: &StepContext,
    ) -> StepResult {
        let started = Instant::now();

        let interval = match retry_interval(step) {
            Ok(interval) => interval,
            Err(e) => {
                return errored_result(step, e, 0, started, Attempt::default());
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut attempt = Attempt::default();
            let outcome = self.attempt_step(step, session, ctx, &mut attempt).await;

            match outcome {
                Ok(export_vars) => {
                    return StepResult {
                        name: step.name.clone(),
                        status: StepStatus::Success,
                        success: true,
                        error: None,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        attempts,
                        export_vars,
                        records: attempt.records,
                        validators: attempt.validators,
                        testcase: attempt.testcase,
                    };
                }
                Err(e) if e.is_retryable() && attempts <= step.retry_times => {
                    warn!(
                        attempt = attempts,
                        retry_times = step.retry_times,
                        "step '{}' did not pass ({}), retrying in {:?}",
                        step.name,
                        e,
                        interval
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return errored_result(step, e, attempts, started, attempt),
            }
        }
    }

    async fn attempt_step(
        &self,
        step: &StepDefinition,
        session: &Variables,
        ctx: &StepContext,
        attempt: &mut Attempt,
    ) -> EngineResult<Variables> {
        let action = step.action()?;
        let scope = build_scope_over(session, &step.variables, &ctx.functions)?;
        debug!("Step '{}' scope: {:?}", step.name, scope.keys().collect::<Vec<_>>());

        match action {
            StepAction::Request(request) => {
                self.run_request_step(step, request, scope, ctx, attempt).await
            }
            StepAction::Testcase(reference) => {
                self.run_testcase_step(step, reference, &scope, ctx, attempt)
                    .await
            }
        }
    }

    async fn run_request_step(
        &self,
        step: &StepDefinition,
        request: &RequestDescriptor,
        mut scope: Variables,
        ctx: &StepContext,
        attempt: &mut Attempt,
    ) -> EngineResult<Variables> {
        let fns = &ctx.functions;
        let mut descriptor = resolve_request(request, &scope, fns)?;

        for hook in &step.setup_hooks {
            scope.insert("request".into(), serde_json::to_value(&descriptor)?);
            match hook {
                Hook::Call(expr) => {
                    resolve_string(expr, &scope, fns)?;
                }
                Hook::Assign(assignments) => {
                    for (name, expr) in assignments {
                        let value = resolve_value(expr, &scope, fns)?;
                        if name == "request" {
                            descriptor = serde_json::from_value(value)?;
                        } else {
                            scope.insert(name.clone(), value);
                        }
                    }
                }
            }
        }
        scope.shift_remove("request");

        let http = build_http_request(&descriptor, ctx)?;
        info!("{} {}", http.method, http.url);

        let response = self
            .transport
            .send(&http)
            .await
            .map_err(|e| EngineError::Transport(format!("{e:#}")))?;
        debug!(
            "Received {} from {} in {:?}",
            response.status_code, response.url, response.elapsed
        );

        attempt.records.extend(response.history.iter().cloned());
        attempt.records.push(RequestResponseRecord {
            request: http.record(),
            response: response.record(),
        });

        let mut view = ResponseView::new(&response);
        for hook in &step.teardown_hooks {
            scope.insert("response".into(), view.to_value());
            match hook {
                Hook::Call(expr) => {
                    resolve_string(expr, &scope, fns)?;
                }
                Hook::Assign(assignments) => {
                    for (name, expr) in assignments {
                        let value = resolve_value(expr, &scope, fns)?;
                        view.set(name.clone(), value.clone());
                        scope.insert(name.clone(), value);
                    }
                }
            }
        }
        scope.shift_remove("response");

        let mut export_vars = Variables::new();
        for (name, path) in &step.extract {
            let value = view.extract(path)?;
            debug!("Extracted '{}' = {}", name, value);
            scope.insert(name.clone(), value.clone());
            export_vars.insert(name.clone(), value);
        }

        let report = Validator::new(fns).validate(&step.validate, &scope, &view)?;
        attempt.validators = report.outcomes.clone();
        report.into_result()?;

        Ok(export_vars)
    }

    async fn run_testcase_step(
        &self,
        step: &StepDefinition,
        reference: &TestcaseRef,
        scope: &Variables,
        ctx: &StepContext,
        attempt: &mut Attempt,
    ) -> EngineResult<Variables> {
        let mut testcase = match reference {
            TestcaseRef::Path(path) => {
                let path = stringify(&resolve_string(path, scope, &ctx.functions)?);
                self.loader.load_testcase(&path)?
            }
            TestcaseRef::Inline(testcase) => (**testcase).clone(),
        };

        if testcase.config.base_url.is_none() {
            testcase.config.base_url = ctx.base_url.clone();
        }
        for name in &step.export {
            if !testcase.config.export.contains(name) {
                testcase.config.export.push(name.clone());
            }
        }

        info!(
            "Running referenced testcase '{}' from '{}'",
            testcase.config.name, ctx.testcase
        );
        let result = self
            .run_testcase(&testcase, scope, ctx.nesting.child())
            .await?;
        attempt.testcase = Some(Box::new(result.clone()));

        if !result.success {
            return Err(EngineError::ReferencedTestcase {
                name: result.name.clone(),
                errored: result.first_errored().is_some(),
            });
        }

        if step.export.is_empty() {
            return Ok(result.export_vars);
        }
        let mut export_vars = Variables::new();
        for name in &step.export {
            let value = result.export_vars.get(name).ok_or_else(|| {
                EngineError::params(format!(
                    "referenced testcase '{}' did not export '{name}'",
                    result.name
                ))
            })?;
            export_vars.insert(name.clone(), value.clone());
        }
        Ok(export_vars)
    }
}

fn retry_interval(step: &StepDefinition) -> EngineResult<Duration> {
    let secs = step.retry_interval;
    Duration::try_from_secs_f64(secs).map_err(|e| {
        EngineError::params(format!(
            "step '{}': retry_interval must be a non-negative number of seconds, got {secs} ({e})",
            step.name
        ))
    })
}

fn errored_result(
    step: &StepDefinition,
    error: EngineError,
    attempts: u32,
    started: Instant,
    attempt: Attempt,
) -> StepResult {
    let status = if error.is_failure() {
        StepStatus::Failed
    } else {
        StepStatus::Errored
    };
    warn!("Step '{}' {:?}: {}", step.name, status, error);
    StepResult {
        name: step.name.clone(),
        status,
        success: false,
        error: Some(error.to_string()),
        elapsed_ms: started.elapsed().as_millis() as u64,
        attempts,
        export_vars: Variables::new(),
        records: attempt.records,
        validators: attempt.validators,
        testcase: attempt.testcase,
    }
}

/// Resolve every expression in the descriptor.
fn resolve_request(
    request: &RequestDescriptor,
    scope: &Variables,
    functions: &FunctionRegistry,
) -> EngineResult<RequestDescriptor> {
    let raw = serde_json::to_value(request)?;
    let resolved = resolve_value(&raw, scope, functions)?;
    serde_json::from_value(resolved).map_err(|e| {
        EngineError::params(format!("request did not resolve to a valid request: {e}"))
    })
}

/// `base_url` and a relative path are joined with exactly one `/`;
/// absolute URLs are used as is.
pub(crate) fn build_url(base_url: Option<&str>, path: &str) -> EngineResult<String> {
    let full = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        match base_url.filter(|b| !b.is_empty()) {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => path.to_string(),
        }
    };
    url::Url::parse(&full)
        .map_err(|e| EngineError::params(format!("invalid url '{full}': {e}")))?;
    Ok(full)
}

fn build_http_request(
    descriptor: &RequestDescriptor,
    ctx: &StepContext,
) -> EngineResult<HttpRequest> {
    let method = descriptor.method.trim().to_uppercase();
    if !METHODS.contains(&method.as_str()) {
        return Err(EngineError::params(format!(
            "unsupported HTTP method '{}'",
            descriptor.method
        )));
    }
    if descriptor.url.trim().is_empty() {
        return Err(EngineError::params("request url is empty"));
    }
    let url = build_url(ctx.base_url.as_deref(), &descriptor.url)?;

    let mut headers = ctx.headers.clone();
    for (name, value) in &descriptor.headers {
        headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        headers.insert(name.clone(), stringify(value));
    }

    let secs = descriptor.timeout.unwrap_or(ctx.timeout);
    let timeout = Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| {
            EngineError::params(format!(
                "timeout must be a positive number of seconds, got {secs}"
            ))
        })?;

    let body = if !descriptor.upload.is_empty() {
        headers.retain(|existing, _| !existing.eq_ignore_ascii_case("content-type"));
        RequestBody::Multipart(encode_upload(&descriptor.upload, &ctx.functions)?)
    } else if let Some(json) = &descriptor.json {
        RequestBody::Json(json.clone())
    } else {
        match &descriptor.data {
            None | Some(Value::Null) => RequestBody::Empty,
            Some(Value::Object(form)) => RequestBody::Form(
                form.iter().map(|(k, v)| (k.clone(), stringify(v))).collect(),
            ),
            Some(other) => RequestBody::Text(stringify(other)),
        }
    };

    Ok(HttpRequest {
        method,
        url,
        headers,
        params: stringify_map(&descriptor.params),
        cookies: stringify_map(&descriptor.cookies),
        body,
        timeout,
        verify: descriptor.verify.unwrap_or(ctx.verify),
        allow_redirects: descriptor.allow_redirects.unwrap_or(true),
    })
}

fn encode_upload(
    upload: &IndexMap<String, Value>,
    functions: &FunctionRegistry,
) -> EngineResult<MultipartForm> {
    let kwargs: Kwargs = upload.clone();
    let encoder = functions.call("multipart_encoder", &[], &kwargs)?;
    MultipartForm::from_encoder(&encoder)
        .map_err(|e| EngineError::params(format!("invalid upload: {e:#}")))
}

fn stringify_map(map: &IndexMap<String, Value>) -> IndexMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), stringify(v))).collect()
}
