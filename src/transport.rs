//! HTTP transport seam and its reqwest implementation.

use crate::model::{RequestRecord, RequestResponseRecord, ResponseRecord};
use crate::resolver::stringify;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::cookie::Jar;
use reqwest::multipart::{Form, Part};
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

const MAX_REDIRECTS: usize = 10;

/// A fully resolved request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub params: IndexMap<String, String>,
    pub cookies: IndexMap<String, String>,
    pub body: RequestBody,
    pub timeout: Duration,
    pub verify: bool,
    pub allow_redirects: bool,
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(IndexMap<String, String>),
    Text(String),
    Multipart(MultipartForm),
}

impl RequestBody {
    fn record(&self) -> Option<Value> {
        match self {
            RequestBody::Empty => None,
            RequestBody::Json(v) => Some(v.clone()),
            RequestBody::Form(form) => Some(Value::Object(
                form.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )),
            RequestBody::Text(s) => Some(Value::String(s.clone())),
            RequestBody::Multipart(form) => Some(Value::String(format!(
                "<multipart: {} part(s)>",
                form.parts.len()
            ))),
        }
    }
}

/// Multipart fields as described by `multipart_encoder`. The boundary
/// and the wire encoding belong to reqwest.
#[derive(Debug, Clone)]
pub struct MultipartForm {
    pub parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub content: PartContent,
}

#[derive(Debug, Clone)]
pub enum PartContent {
    Text(String),
    File {
        path: PathBuf,
        filename: String,
        content_type: String,
    },
}

impl MultipartForm {
    /// Build from the value returned by `multipart_encoder`.
    pub fn from_encoder(encoder: &Value) -> Result<Self> {
        let fields = encoder
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("multipart encoder has no fields"))?;

        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            let name = field
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("multipart field without a name: {field}"))?
                .to_string();
            let content = match field.get("file").and_then(Value::as_str) {
                Some(path) => PartContent::File {
                    path: PathBuf::from(path),
                    filename: field
                        .get("filename")
                        .map(stringify)
                        .unwrap_or_else(|| name.clone()),
                    content_type: field
                        .get("content_type")
                        .map(stringify)
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                },
                None => PartContent::Text(field.get("value").map(stringify).unwrap_or_default()),
            };
            parts.push(MultipartPart { name, content });
        }
        Ok(Self { parts })
    }

    /// A fresh reqwest form; file parts are read here, once per send.
    pub async fn to_form(&self) -> Result<Form> {
        let mut form = Form::new();
        for part in &self.parts {
            form = match &part.content {
                PartContent::Text(text) => form.text(part.name.clone(), text.clone()),
                PartContent::File {
                    path,
                    filename,
                    content_type,
                } => {
                    let data = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("failed to read upload {}", path.display()))?;
                    let file_part = Part::bytes(data)
                        .file_name(filename.clone())
                        .mime_str(content_type)
                        .with_context(|| {
                            format!("invalid content type '{content_type}' for {}", part.name)
                        })?;
                    form.part(part.name.clone(), file_part)
                }
            };
        }
        Ok(form)
    }
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl ResponseBody {
    /// JSON bodies as parsed, text as a string, bytes decoded lossily.
    pub fn to_value(&self) -> Value {
        match self {
            ResponseBody::Json(v) => v.clone(),
            ResponseBody::Text(s) => Value::String(s.clone()),
            ResponseBody::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }

    pub fn text(&self) -> String {
        match self {
            ResponseBody::Json(v) => v.to_string(),
            ResponseBody::Text(s) => s.clone(),
            ResponseBody::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        if let Ok(json) = serde_json::from_slice::<Value>(&bytes) {
            return ResponseBody::Json(json);
        }
        match String::from_utf8(bytes) {
            Ok(text) => ResponseBody::Text(text),
            Err(e) => ResponseBody::Bytes(e.into_bytes()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    /// Final URL, after redirects.
    pub url: String,
    /// Lower-cased names; repeated headers are joined with `, `.
    pub headers: IndexMap<String, String>,
    pub cookies: IndexMap<String, String>,
    pub body: ResponseBody,
    pub encoding: Option<String>,
    pub elapsed: Duration,
    /// Redirect hops that led to this response, oldest first.
    pub history: Vec<RequestResponseRecord>,
}

impl HttpResponse {
    pub fn record(&self) -> ResponseRecord {
        ResponseRecord {
            status_code: self.status_code,
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
            body: self.body.to_value(),
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

/// Sends one resolved request. Implementations own connection pooling
/// and the cookie jar for the whole run.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport with a shared cookie jar. Redirects are
/// followed here rather than by reqwest so every hop is recorded.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    insecure: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .redirect(Policy::none())
            .build()
            .context("failed to build HTTP client")?;
        let insecure = Client::builder()
            .cookie_provider(jar)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, insecure })
    }

    async fn send_once(
        &self,
        request: &HttpRequest,
        method: &Method,
        url: &str,
        body: &RequestBody,
    ) -> Result<HttpResponse> {
        let client = if request.verify {
            &self.client
        } else {
            &self.insecure
        };

        let mut builder = client.request(method.clone(), url).timeout(request.timeout);
        let multipart = matches!(body, RequestBody::Multipart(_));
        for (name, value) in &request.headers {
            // reqwest writes the multipart Content-Type with its boundary
            if multipart && name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, cookie);
        }

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(form) => builder.form(form),
            RequestBody::Text(text) => builder.body(text.clone()),
            RequestBody::Multipart(form) => builder.multipart(form.to_form().await?),
        };

        debug!("Sending {} {}", method, url);
        let started = Instant::now();
        let response = builder.send().await.context("Failed to send request")?;
        let status = response.status();
        debug!("Received response with status: {}", status);

        let mut headers: IndexMap<String, String> = IndexMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        let cookies: IndexMap<String, String> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let final_url = response.url().to_string();
        let encoding = headers
            .get(CONTENT_TYPE.as_str())
            .and_then(|ct| ct.split("charset=").nth(1))
            .map(|cs| cs.trim().to_string());

        let bytes = response
            .bytes()
            .await
            .context("Failed to read response body")?;

        Ok(HttpResponse {
            status_code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            url: final_url,
            headers,
            cookies,
            body: ResponseBody::from_bytes(bytes.to_vec()),
            encoding,
            elapsed: started.elapsed(),
            history: Vec::new(),
        })
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method '{}'", request.method))?;
        let mut url = reqwest::Url::parse(&request.url)
            .with_context(|| format!("invalid URL '{}'", request.url))?;
        let mut body = request.body.clone();
        let mut history = Vec::new();
        let started = Instant::now();

        loop {
            let mut response = self.send_once(request, &method, url.as_str(), &body).await?;
            let status = StatusCode::from_u16(response.status_code)?;

            let location = response.headers.get(LOCATION.as_str()).cloned();
            let Some(location) = location.filter(|_| request.allow_redirects && is_redirect(status))
            else {
                response.elapsed = started.elapsed();
                response.history = history;
                return Ok(response);
            };

            if history.len() >= MAX_REDIRECTS {
                bail!("exceeded {MAX_REDIRECTS} redirects starting at {}", request.url);
            }

            history.push(RequestResponseRecord {
                request: RequestRecord {
                    method: method.to_string(),
                    url: url.to_string(),
                    headers: request.headers.clone(),
                    body: body.record(),
                },
                response: response.record(),
            });

            let switch_to_get = status == StatusCode::SEE_OTHER
                || (matches!(status.as_u16(), 301 | 302) && method == Method::POST);
            if switch_to_get {
                method = Method::GET;
                body = RequestBody::Empty;
            }
            url = url
                .join(&location)
                .with_context(|| format!("invalid redirect location '{location}'"))?;
            debug!("Following redirect to {}", url);
        }
    }
}

impl HttpRequest {
    /// Record of the request as sent (before any redirect).
    pub fn record(&self) -> RequestRecord {
        RequestRecord {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.record(),
        }
    }
}
