//! The response view that extraction, validation and teardown hooks
//! read from.

use crate::error::{EngineError, EngineResult};
use crate::model::Variables;
use crate::transport::HttpResponse;
use regex::Regex;
use serde_json::{Number, Value};

/// Ordered mapping seeded from a response. Teardown hooks may add
/// further keys, which then behave like any seeded field.
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    fields: Variables,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl ResponseView {
    pub fn new(response: &HttpResponse) -> Self {
        let mut fields = Variables::new();
        fields.insert("status_code".into(), Value::from(response.status_code));
        fields.insert("headers".into(), string_map(&response.headers));
        fields.insert("cookies".into(), string_map(&response.cookies));
        fields.insert("body".into(), response.body.to_value());
        fields.insert("text".into(), Value::String(response.body.text()));
        fields.insert(
            "elapsed".into(),
            Number::from_f64(response.elapsed.as_secs_f64())
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        fields.insert(
            "encoding".into(),
            response
                .encoding
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        fields.insert("url".into(), Value::String(response.url.clone()));
        fields.insert("ok".into(), Value::Bool(response.status_code < 400));
        fields.insert("reason".into(), Value::String(response.reason.clone()));
        Self { fields }
    }

    /// A view over arbitrary fields, mainly for tests.
    pub fn from_fields(fields: Variables) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Add or replace a field.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Walk a dotted path such as `body.items[0].id`,
    /// `headers."Content-Type"` or `body.items.0`. `content` and `json`
    /// are accepted as aliases of `body`. Header names match
    /// case-insensitively.
    pub fn search(&self, path: &str) -> EngineResult<Value> {
        let segments = split_path(path).map_err(|reason| failure(path, reason))?;
        let Some((Segment::Key(first), rest)) = segments.split_first() else {
            return Err(failure(path, "path must start with a field name"));
        };

        let field = match first.as_str() {
            "content" | "json" if !self.fields.contains_key(first) => "body",
            other => other,
        };
        let mut current = self
            .fields
            .get(field)
            .ok_or_else(|| failure(path, format!("response has no field '{first}'")))?;

        let case_insensitive = field == "headers" || field == "cookies";
        for (depth, segment) in rest.iter().enumerate() {
            current = match (current, segment) {
                (Value::Object(map), Segment::Key(key)) => {
                    let found = map.get(key).or_else(|| {
                        (case_insensitive && depth == 0)
                            .then(|| {
                                map.iter()
                                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                                    .map(|(_, v)| v)
                            })
                            .flatten()
                    });
                    found.ok_or_else(|| failure(path, format!("key '{key}' not found")))?
                }
                (Value::Array(items), Segment::Index(i)) => items
                    .get(*i)
                    .ok_or_else(|| failure(path, format!("index {i} out of range")))?,
                (Value::Array(items), Segment::Key(key)) => {
                    let i: usize = key.parse().map_err(|_| {
                        failure(path, format!("'{key}' is not a list index"))
                    })?;
                    items
                        .get(i)
                        .ok_or_else(|| failure(path, format!("index {i} out of range")))?
                }
                (other, segment) => {
                    return Err(failure(
                        path,
                        format!("cannot take {segment:?} of {other}"),
                    ))
                }
            };
        }

        Ok(current.clone())
    }

    /// Extraction rule lookup: field paths go through [`Self::search`];
    /// anything else holding a capture group is applied as a regex to
    /// the response text and yields the first group.
    pub fn extract(&self, path: &str) -> EngineResult<Value> {
        if self.is_field_path(path) || !(path.contains('(') && path.contains(')')) {
            return self.search(path);
        }

        let re = Regex::new(path)
            .map_err(|e| failure(path, format!("invalid regex: {e}")))?;
        let text = self
            .fields
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| Value::String(m.as_str().to_string()))
            .ok_or_else(|| failure(path, "regex did not match the response text"))
    }

    fn is_field_path(&self, path: &str) -> bool {
        let head = path
            .split(['.', '['])
            .next()
            .unwrap_or_default();
        self.fields.contains_key(head) || head == "content" || head == "json"
    }
}

fn failure(path: &str, reason: impl Into<String>) -> EngineError {
    EngineError::ExtractFailure {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn string_map(map: &indexmap::IndexMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn split_path(path: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '"' | '\'' => {
                let mut quoted = String::new();
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some(other) => quoted.push(other),
                        None => return Err(format!("unterminated quote in '{path}'")),
                    }
                }
                segments.push(Segment::Key(quoted));
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => index.push(d),
                        None => return Err(format!("unterminated '[' in '{path}'")),
                    }
                }
                let index = index.trim();
                match index.parse::<usize>() {
                    Ok(i) => segments.push(Segment::Index(i)),
                    Err(_) => segments.push(Segment::Key(
                        index.trim_matches(|q| q == '"' || q == '\'').to_string(),
                    )),
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    if segments.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(segments)
}
