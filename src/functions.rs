//! Layered function registry used by `${name(args)}` expressions.
//!
//! Lookup order, first match wins:
//! 1. testcase-local overrides
//! 2. `parameterize` / `P` (CSV rows)
//! 3. `environ` / `ENV` (environment lookup)
//! 4. `multipart_encoder` / `multipart_content_type` (uploads)
//! 5. project functions
//! 6. engine built-ins, comparators included
//! 7. host built-ins (`len`, `max`, `min`, ...)

use crate::builtins;
use crate::config::ProjectContext;
use crate::error::{EngineError, EngineResult};
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Keyword arguments of a call.
pub type Kwargs = IndexMap<String, Value>;

/// A registered function.
pub type Callable =
    Arc<dyn Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + Send + Sync>;

pub type FunctionMap = IndexMap<String, Callable>;

/// Wrap a closure as a [`Callable`].
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Supplies the project-defined function layer for a project root.
pub trait FunctionSource: Send + Sync {
    fn load(&self, project: &ProjectContext) -> anyhow::Result<FunctionMap>;
}

impl FunctionSource for FunctionMap {
    fn load(&self, _project: &ProjectContext) -> anyhow::Result<FunctionMap> {
        Ok(self.clone())
    }
}

#[derive(Clone)]
pub struct FunctionRegistry {
    overrides: Arc<FunctionMap>,
    project_functions: Arc<FunctionMap>,
    project: Arc<ProjectContext>,
}

impl FunctionRegistry {
    /// Registry with the built-in layers only.
    pub fn new(project: ProjectContext) -> Self {
        Self {
            overrides: Arc::new(FunctionMap::new()),
            project_functions: Arc::new(FunctionMap::new()),
            project: Arc::new(project),
        }
    }

    /// Registry whose project layer comes from `source`.
    pub fn from_source(
        project: ProjectContext,
        source: &dyn FunctionSource,
    ) -> anyhow::Result<Self> {
        let functions = source.load(&project)?;
        debug!(
            "Loaded {} project function(s) from {}",
            functions.len(),
            project.root().display()
        );
        Ok(Self::new(project).with_project_functions(functions))
    }

    pub fn with_project_functions(mut self, functions: FunctionMap) -> Self {
        self.project_functions = Arc::new(functions);
        self
    }

    /// A copy of this registry with `overrides` as the top layer.
    pub fn with_overrides(&self, overrides: &FunctionMap) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        Self {
            overrides: Arc::new(overrides.clone()),
            ..self.clone()
        }
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    pub fn lookup(&self, name: &str) -> EngineResult<Callable> {
        if let Some(f) = self.overrides.get(name) {
            return Ok(f.clone());
        }

        match name {
            "parameterize" | "P" => {
                return Ok(builtins::csv_loader(self.project.clone()))
            }
            "environ" | "ENV" => {
                return Ok(builtins::environ(self.project.clone()))
            }
            "multipart_encoder" => {
                return Ok(builtins::multipart_encoder(self.project.clone()))
            }
            "multipart_content_type" => {
                return Ok(builtins::multipart_content_type())
            }
            _ => {}
        }

        if let Some(f) = self.project_functions.get(name) {
            return Ok(f.clone());
        }
        if let Some(f) = builtins::ENGINE_FUNCTIONS.get(name) {
            return Ok(f.clone());
        }
        if let Some(f) = builtins::HOST_FUNCTIONS.get(name) {
            return Ok(f.clone());
        }

        Err(EngineError::FunctionNotFound(name.to_string()))
    }

    /// Look `name` up and invoke it. A failing callable is reported with
    /// its resolved arguments.
    pub fn call(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> EngineResult<Value> {
        let f = self.lookup(name)?;
        debug!("Calling function {name}({args:?}, {kwargs:?})");
        f(args, kwargs).map_err(|e| EngineError::FunctionCall {
            name: name.to_string(),
            args: Value::Array(args.to_vec()),
            kwargs: Value::Object(
                kwargs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            reason: format!("{e:#}"),
        })
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new(ProjectContext::default())
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .field(
                "project_functions",
                &self.project_functions.keys().collect::<Vec<_>>(),
            )
            .field("project", &self.project)
            .finish()
    }
}
