//! Declarative HTTP API testcases.
//!
//! A testcase is a config plus an ordered list of steps. Each step sends
//! a request (or runs another testcase), extracts values from the
//! response and validates it. Strings anywhere in a definition may carry
//! `$var`, `${var}` and `${func(args)}` expressions, resolved against a
//! layered variable scope and function registry.

pub mod builtins;
pub mod comparators;
pub mod config;
pub mod error;
pub mod functions;
pub mod model;
pub mod parameters;
pub mod parser;
pub mod resolver;
pub mod response;
pub mod runner;
pub mod scope;
mod step;
pub mod transport;
pub mod validator;

pub use config::*;
pub use error::{EngineError, EngineResult};
pub use functions::{callable, Callable, FunctionMap, FunctionRegistry, FunctionSource, Kwargs};
pub use model::*;
pub use runner::*;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use validator::{ValidationMode, ValidationReport, Validator};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
