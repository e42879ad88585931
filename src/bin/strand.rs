//! strand CLI - runs declarative HTTP API testcases.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use strand::{
    DefaultTestRunner, FunctionRegistry, ProjectContext, ReqwestTransport, RunnerOptions,
    StepStatus, TestcaseDefinition, TestcaseLoader, TestcaseResult,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// strand - declarative HTTP API testcase runner.
#[derive(Parser, Debug)]
#[command(name = "strand", version, about)]
struct Cli {
    /// Testcase files or directories.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Only run testcases whose name contains this text.
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Request timeout in seconds, overriding every testcase config.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<f64>,

    /// Base URL override for top-level testcases.
    #[arg(short = 'b', long = "base-url", env = "STRAND_BASE_URL")]
    base_url: Option<String>,

    /// Stop each testcase at its first failing step.
    #[arg(long = "fail-fast")]
    fail_fast: bool,

    /// Project root: `.env`, CSV files, uploads and referenced
    /// testcases resolve against it.
    #[arg(long = "project-root", default_value = ".")]
    project_root: PathBuf,

    /// Directory to save result files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Result file format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_testcase_result(result: &TestcaseResult, verbose: bool) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} testcase: {} ({} ms)", status, result.name, result.duration_ms);

    for (i, step) in result.steps.iter().enumerate() {
        let step_status = match step.status {
            StepStatus::Success => "\x1b[32m✓\x1b[0m",
            StepStatus::Failed => "\x1b[31m✗\x1b[0m",
            StepStatus::Errored => "\x1b[33m!\x1b[0m",
        };
        let retries = if step.attempts > 1 {
            format!(", {} attempts", step.attempts)
        } else {
            String::new()
        };
        info!(
            "  {}. {} {} ({} ms{})",
            i + 1,
            step_status,
            step.name,
            step.elapsed_ms,
            retries
        );

        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }

        if verbose {
            for record in &step.records {
                debug!("     Request: {} {}", record.request.method, record.request.url);
                if let Some(body) = &record.request.body {
                    debug!("     Request body: {}", truncate(&body.to_string()));
                }
                debug!("     Response: Status {}", record.response.status_code);
                debug!("     Response body: {}", truncate(&record.response.body.to_string()));
            }
            for outcome in &step.validators {
                debug!(
                    "     {} {} {} {} (actual: {})",
                    if outcome.passed { "✓" } else { "✗" },
                    outcome.check,
                    outcome.comparator,
                    outcome.expect,
                    outcome.actual
                );
            }
        }

        if let Some(nested) = &step.testcase {
            print_testcase_result(nested, verbose);
        }
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(500) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

fn save_result(result: &TestcaseResult, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    fs::create_dir_all(report_dir)
        .with_context(|| format!("Failed to create {}", report_dir.display()))?;

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.name.replace([' ', '/'], "_");
    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(result)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(result)?,
        ),
    };

    let file_path = report_dir.join(filename);
    fs::write(&file_path, content)?;
    Ok(file_path)
}

fn load_testcases(loader: &TestcaseLoader, paths: &[PathBuf]) -> Result<Vec<TestcaseDefinition>> {
    for path in paths {
        if !path.exists() {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
    }
    let testcases: Vec<TestcaseDefinition> = loader
        .load_paths(paths)?
        .into_iter()
        .map(|(_, testcase)| testcase)
        .collect();
    if testcases.is_empty() {
        return Err(anyhow!("No testcases found"));
    }
    Ok(testcases)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let project = ProjectContext::load(&args.project_root)?;
    let loader = TestcaseLoader::new(project.clone());
    let testcases = load_testcases(&loader, &args.paths)?;

    let testcases: Vec<TestcaseDefinition> = match &args.filter {
        Some(filter) => testcases
            .into_iter()
            .filter(|t| t.config.name.to_lowercase().contains(&filter.to_lowercase()))
            .collect(),
        None => testcases,
    };
    if testcases.is_empty() {
        return Err(anyhow!("No testcases matching the filter were found"));
    }

    let runner = DefaultTestRunner::with_transport(Arc::new(ReqwestTransport::new()?))
        .with_functions(FunctionRegistry::new(project))
        .with_options(RunnerOptions {
            timeout: args.timeout,
            fail_fast: args.fail_fast,
            base_url: args.base_url,
        });

    let total_start = Instant::now();
    let (mut passed, mut failed) = (0, 0);
    let total = testcases.len();
    info!("Running {} testcase(s)...", total);

    for (idx, testcase) in testcases.iter().enumerate() {
        info!("Testcase {}/{}: {}", idx + 1, total, testcase.config.name);
        match runner.run_parameterized(testcase).await {
            Ok(results) => {
                for result in &results {
                    print_testcase_result(result, args.verbose);
                    if let Some(dir) = &args.report_dir {
                        match save_result(result, dir, args.report_format) {
                            Ok(path) => info!("Report saved: {}", path.display()),
                            Err(e) => error!("Failed to save report: {}", e),
                        }
                    }
                    if result.success {
                        passed += 1;
                    } else {
                        failed += 1;
                    }
                }
            }
            Err(e) => {
                error!(
                    "\x1b[31mTestcase error: {} - {}\x1b[0m",
                    testcase.config.name, e
                );
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if failed > 0 {
        exit(1);
    }

    Ok(())
}
