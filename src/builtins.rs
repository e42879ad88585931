//! Built-in function layers: engine helpers, comparators, host built-ins
//! and the project-aware CSV / environment / upload helpers.

use crate::comparators::{self, COMPARATORS};
use crate::config::ProjectContext;
use crate::functions::{callable, Callable, FunctionMap, Kwargs};
use crate::resolver::stringify;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

pub(crate) static ENGINE_FUNCTIONS: LazyLock<FunctionMap> = LazyLock::new(|| {
    let mut map = FunctionMap::new();
    map.insert("gen_random_string".into(), callable(gen_random_string));
    map.insert("get_timestamp".into(), callable(get_timestamp));
    map.insert("get_current_date".into(), callable(get_current_date));
    map.insert("sleep".into(), callable(sleep));
    map.insert(
        "upper".into(),
        callable(|args, kwargs| {
            let s = required(args, kwargs, 0, "s")?;
            Ok(Value::String(stringify(s).to_uppercase()))
        }),
    );
    map.insert(
        "lower".into(),
        callable(|args, kwargs| {
            let s = required(args, kwargs, 0, "s")?;
            Ok(Value::String(stringify(s).to_lowercase()))
        }),
    );
    for name in COMPARATORS.iter().copied() {
        map.insert(name.to_string(), comparator_function(name));
    }
    map
});

pub(crate) static HOST_FUNCTIONS: LazyLock<FunctionMap> = LazyLock::new(|| {
    let mut map = FunctionMap::new();
    map.insert("len".into(), callable(len));
    map.insert("max".into(), callable(|args, _| extremum(args, true)));
    map.insert("min".into(), callable(|args, _| extremum(args, false)));
    map.insert("sum".into(), callable(sum));
    map.insert("abs".into(), callable(abs));
    map.insert(
        "str".into(),
        callable(|args, kwargs| {
            Ok(Value::String(stringify(required(args, kwargs, 0, "value")?)))
        }),
    );
    map.insert("int".into(), callable(int));
    map.insert("float".into(), callable(float));
    map.insert(
        "bool".into(),
        callable(|args, kwargs| {
            Ok(Value::Bool(truthy(required(args, kwargs, 0, "value")?)))
        }),
    );
    map.insert("round".into(), callable(round));
    map
});

fn argument<'a>(
    args: &'a [Value],
    kwargs: &'a Kwargs,
    index: usize,
    name: &str,
) -> Option<&'a Value> {
    args.get(index).or_else(|| kwargs.get(name))
}

fn required<'a>(
    args: &'a [Value],
    kwargs: &'a Kwargs,
    index: usize,
    name: &str,
) -> Result<&'a Value> {
    argument(args, kwargs, index, name)
        .ok_or_else(|| anyhow!("missing argument '{name}'"))
}

fn as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("bad number {n}")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("'{s}' is not a number")),
        other => bail!("expected a number, got {other}"),
    }
}

fn float_value(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("{f} is not a finite number"))
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ── engine helpers ──────────────────────────────────────

fn gen_random_string(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let len = as_f64(required(args, kwargs, 0, "str_len")?)? as usize;
    let s: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    Ok(Value::String(s))
}

fn get_timestamp(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let len = match argument(args, kwargs, 0, "str_len") {
        Some(v) => as_f64(v)? as usize,
        None => 13,
    };
    let micros = Utc::now().timestamp_micros().to_string();
    Ok(Value::String(micros.chars().take(len).collect()))
}

fn get_current_date(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let fmt = match argument(args, kwargs, 0, "fmt") {
        Some(v) => stringify(v),
        None => "%Y-%m-%d".to_string(),
    };
    Ok(Value::String(Local::now().format(&fmt).to_string()))
}

/// Blocks the caller. On a multi-thread runtime the worker is handed
/// off first; a current-thread runtime stalls for the duration.
fn sleep(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let secs = as_f64(required(args, kwargs, 0, "n_secs")?)?;
    let duration = Duration::try_from_secs_f64(secs).map_err(|e| {
        anyhow!("sleep duration must be a non-negative number of seconds, got {secs} ({e})")
    })?;
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(duration));
        }
        _ => std::thread::sleep(duration),
    }
    Ok(Value::Null)
}

fn comparator_function(name: &'static str) -> Callable {
    callable(move |args, kwargs| {
        let actual = required(args, kwargs, 0, "check_value")?;
        let expected = required(args, kwargs, 1, "expect_value")?;
        comparators::compare(name, actual, expected).map_err(|m| anyhow!(m))?;
        Ok(Value::Bool(true))
    })
}

// ── host built-ins ──────────────────────────────────────

pub(crate) fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

fn len(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let value = required(args, kwargs, 0, "obj")?;
    let n = length_of(value)
        .ok_or_else(|| anyhow!("object of type {} has no len()", type_name(value)))?;
    Ok(Value::Number(n.into()))
}

/// A single list argument is unpacked, as `max([1, 2])` and `max(1, 2)`
/// are both accepted.
fn items(args: &[Value]) -> &[Value] {
    match args {
        [Value::Array(inner)] => inner.as_slice(),
        _ => args,
    }
}

fn extremum(args: &[Value], want_max: bool) -> Result<Value> {
    let values = items(args);
    let mut best: Option<&Value> = None;
    for value in values {
        best = match best {
            None => Some(value),
            Some(current) => {
                let ordering = comparators::order(value, current)
                    .ok_or_else(|| anyhow!("cannot compare {value} and {current}"))?;
                let replace = if want_max {
                    ordering.is_gt()
                } else {
                    ordering.is_lt()
                };
                Some(if replace { value } else { current })
            }
        };
    }
    best.cloned().ok_or_else(|| anyhow!("arg is an empty sequence"))
}

fn sum(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let values = items(args);
    if values.iter().all(|v| v.as_i64().is_some()) {
        let total = values.iter().filter_map(Value::as_i64).sum::<i64>();
        return Ok(Value::Number(total.into()));
    }
    let mut total = 0.0;
    for value in values {
        total += as_f64(value)?;
    }
    float_value(total)
}

fn abs(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let value = required(args, kwargs, 0, "x")?;
    if let Some(i) = value.as_i64() {
        return Ok(Value::Number(i.abs().into()));
    }
    float_value(as_f64(value)?.abs())
}

fn int(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let value = required(args, kwargs, 0, "x")?;
    let i = match value {
        Value::Bool(b) => i64::from(*b),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(i) => i,
            Err(_) => bail!("invalid literal for int(): '{s}'"),
        },
        other => as_f64(other)?.trunc() as i64,
    };
    Ok(Value::Number(i.into()))
}

fn float(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let value = required(args, kwargs, 0, "x")?;
    match value {
        Value::Bool(b) => float_value(if *b { 1.0 } else { 0.0 }),
        other => float_value(as_f64(other)?),
    }
}

fn round(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let value = as_f64(required(args, kwargs, 0, "number")?)?;
    let digits = match argument(args, kwargs, 1, "ndigits") {
        Some(v) => as_f64(v)? as i32,
        None => 0,
    };
    if digits <= 0 {
        let factor = 10f64.powi(-digits);
        let rounded = ((value / factor).round() * factor) as i64;
        return Ok(Value::Number(rounded.into()));
    }
    let factor = 10f64.powi(digits);
    float_value((value * factor).round() / factor)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

// ── project-aware helpers ───────────────────────────────

/// `parameterize(path)`: rows of a CSV file (header line first) as
/// mappings of column name to string value.
pub(crate) fn csv_loader(project: Arc<ProjectContext>) -> Callable {
    callable(move |args, kwargs| {
        let path = stringify(required(args, kwargs, 0, "path")?);
        let full = project.resolve_path(&path);
        debug!("Loading CSV parameters from {}", full.display());

        let mut reader = csv::Reader::from_path(&full)
            .with_context(|| format!("failed to open CSV file {}", full.display()))?;
        let headers = reader.headers()?.clone();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record
                .with_context(|| format!("malformed CSV in {}", full.display()))?;
            let row: Map<String, Value> = headers
                .iter()
                .zip(record.iter())
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect();
            rows.push(Value::Object(row));
        }
        Ok(Value::Array(rows))
    })
}

/// `environ(name[, default])`: project `.env` entries first, then the
/// process environment.
pub(crate) fn environ(project: Arc<ProjectContext>) -> Callable {
    callable(move |args, kwargs| {
        let name = stringify(required(args, kwargs, 0, "name")?);
        match project.env_var(&name) {
            Some(value) => Ok(Value::String(value)),
            None => match argument(args, kwargs, 1, "default") {
                Some(default) => Ok(default.clone()),
                None => bail!("environment variable '{name}' is not set"),
            },
        }
    })
}

/// `multipart_encoder(field=value, ...)`: describes a multipart body.
/// A value naming an existing file under the project root becomes a
/// file part; anything else is a text part.
pub(crate) fn multipart_encoder(project: Arc<ProjectContext>) -> Callable {
    callable(move |_args, kwargs| {
        let mut fields = Vec::new();
        for (name, value) in kwargs {
            let mut field = Map::new();
            field.insert("name".into(), Value::String(name.clone()));
            let text = stringify(value);
            let path = project.resolve_path(&text);
            if value.is_string() && path.is_file() {
                let filename = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.clone());
                field.insert(
                    "file".into(),
                    Value::String(path.to_string_lossy().into_owned()),
                );
                field.insert("filename".into(), Value::String(filename));
                field.insert(
                    "content_type".into(),
                    Value::String(guess_mime(&path).to_string()),
                );
            } else {
                field.insert("value".into(), Value::String(text));
            }
            fields.push(Value::Object(field));
        }

        let mut encoder = Map::new();
        encoder.insert("fields".into(), Value::Array(fields));
        Ok(Value::Object(encoder))
    })
}

/// `multipart_content_type(encoder)`. The boundary is chosen when the
/// body is built, so only the media type is known here.
pub(crate) fn multipart_content_type() -> Callable {
    callable(|args, kwargs| {
        let encoder = required(args, kwargs, 0, "encoder")?;
        if !encoder.get("fields").is_some_and(Value::is_array) {
            bail!("not a multipart encoder: {encoder}");
        }
        Ok(Value::String("multipart/form-data".to_string()))
    })
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
