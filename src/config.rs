//! Project context, runner options and testcase file loading.

use crate::error::{EngineError, EngineResult};
use crate::model::TestcaseDefinition;
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The project a run belongs to: its root directory (relative testcase,
/// CSV and upload paths resolve against it) and the variables read from
/// its `.env` file.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    root: PathBuf,
    env: IndexMap<String, String>,
}

impl ProjectContext {
    /// Context rooted at `root` without reading any `.env` file.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            env: IndexMap::new(),
        }
    }

    /// Context rooted at `root`, with `root/.env` loaded when present.
    pub fn load<P: AsRef<Path>>(root: P) -> EngineResult<Self> {
        let mut project = Self::new(root);
        let dot_env = project.root.join(".env");
        if dot_env.is_file() {
            let content = fs::read_to_string(&dot_env).map_err(|e| {
                EngineError::Load(format!("failed to read {}: {e}", dot_env.display()))
            })?;
            project.env = parse_dot_env(&content);
            info!(
                "Loaded {} variable(s) from {}",
                project.env.len(),
                dot_env.display()
            );
        }
        Ok(project)
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.env` entries first, then the process environment.
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    /// Absolute paths are returned as is; relative ones join the root.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Default for ProjectContext {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

fn parse_dot_env(content: &str) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            warn!("Ignoring malformed .env line: {line}");
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        env.insert(key.trim().to_string(), value.to_string());
    }
    env
}

/// Settings applied to every testcase a runner executes.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Overrides `config.timeout` of every testcase.
    pub timeout: Option<f64>,
    /// Forces fail-fast regardless of `config.fail_fast`.
    pub fail_fast: bool,
    /// Overrides `config.base_url` of top-level testcases.
    pub base_url: Option<String>,
}

/// Reads testcase files (`.yml`, `.yaml`, `.json`).
#[derive(Debug, Clone, Default)]
pub struct TestcaseLoader {
    project: ProjectContext,
}

impl TestcaseLoader {
    pub fn new(project: ProjectContext) -> Self {
        Self { project }
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    /// Load one testcase; relative paths resolve against the project root.
    pub fn load_testcase(&self, path: &str) -> EngineResult<TestcaseDefinition> {
        let path = self.project.resolve_path(path);
        self.load_file(&path)
    }

    pub fn load_file(&self, path: &Path) -> EngineResult<TestcaseDefinition> {
        info!("Loading testcase from {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Load(format!("failed to read testcase {}: {e}", path.display()))
        })?;

        let testcase = if path.extension().is_some_and(|ext| ext == "json") {
            TestcaseDefinition::from_json(&content).map_err(|e| {
                EngineError::Load(format!("failed to parse JSON from {}: {e}", path.display()))
            })?
        } else {
            TestcaseDefinition::from_yaml(&content).map_err(|e| {
                EngineError::Load(format!("failed to parse YAML from {}: {e}", path.display()))
            })?
        };

        debug!("Successfully loaded testcase: {}", testcase.config.name);
        Ok(testcase)
    }

    /// Every testcase file directly inside `dir`, sorted by file name.
    /// Files that fail to parse are skipped with a warning.
    pub fn load_dir(&self, dir: &Path) -> EngineResult<Vec<(PathBuf, TestcaseDefinition)>> {
        info!("Loading testcases from directory: {}", dir.display());

        let entries = fs::read_dir(dir).map_err(|e| {
            EngineError::Load(format!("failed to read directory {}: {e}", dir.display()))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_testcase_file(p))
            .collect();
        paths.sort();

        let mut testcases = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load_file(&path) {
                Ok(testcase) => testcases.push((path, testcase)),
                Err(err) => warn!("Skipping {}: {err}", path.display()),
            }
        }

        info!("Loaded {} testcase(s) from {}", testcases.len(), dir.display());
        Ok(testcases)
    }

    /// Load files and directories in the order given.
    pub fn load_paths(&self, paths: &[PathBuf]) -> EngineResult<Vec<(PathBuf, TestcaseDefinition)>> {
        let mut all = Vec::new();
        for path in paths {
            if path.is_dir() {
                all.extend(self.load_dir(path)?);
            } else {
                all.push((path.clone(), self.load_file(path)?));
            }
        }
        Ok(all)
    }
}

/// `.yml`, `.yaml` or `.json`.
pub fn is_testcase_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
