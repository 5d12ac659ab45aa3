//! Code execution through Judge0, and grading against test cases.
//!
//! Execution is delegated; nothing here sandboxes or runs code locally. The
//! [`CodeRunner`] trait is the seam: [`Judge0Runner`] talks to a Judge0
//! deployment over HTTP, tests plug in scripted runners.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::language::Language;
use crate::storage::Verdict;

pub const DEFAULT_JUDGE0_URL: &str = "https://judge0-ce.p.rapidapi.com";
pub const DEFAULT_RAPIDAPI_HOST: &str = "judge0-ce.p.rapidapi.com";

/// Output reported when a run produced neither stdout nor stderr.
pub const NO_OUTPUT: &str = "No output";

/// Recorded as the actual output of a test case whose run failed.
pub const RUN_ERROR_OUTPUT: &str = "Error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub code: String,
    pub language: Language,
    pub stdin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub output: String,
}

impl RunOutput {
    /// First non-empty of stdout and stderr.
    pub fn from_streams(stdout: Option<String>, stderr: Option<String>) -> Self {
        let output = [stdout, stderr]
            .into_iter()
            .flatten()
            .find(|stream| !stream.is_empty())
            .unwrap_or_else(|| NO_OUTPUT.to_owned());
        Self { output }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Executes one program against one input.
pub trait CodeRunner: Send + Sync {
    fn run(&self, request: &RunRequest) -> impl Future<Output = Result<RunOutput, RunError>> + Send;
}

#[derive(Debug, Clone)]
pub struct Judge0Config {
    /// Base URL without trailing slash
    pub base_url: String,
    pub api_key: String,
    pub api_host: String,
}

impl Judge0Config {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_JUDGE0_URL.to_owned(),
            api_key: api_key.into(),
            api_host: DEFAULT_RAPIDAPI_HOST.to_owned(),
        }
    }

    /// `RAPIDAPI_KEY` is required; `RAPIDAPI_HOST` and `JUDGE0_URL` fall back
    /// to the public RapidAPI deployment.
    pub fn from_env() -> Result<Self, RunError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RunError> {
        let api_key = lookup("RAPIDAPI_KEY")
            .filter(|key| !key.is_empty())
            .ok_or(RunError::MissingConfig("RAPIDAPI_KEY"))?;
        let mut config = Self::new(api_key);
        if let Some(host) = lookup("RAPIDAPI_HOST") {
            config.api_host = host;
        }
        if let Some(url) = lookup("JUDGE0_URL") {
            config.base_url = url.trim_end_matches('/').to_owned();
        }
        Ok(config)
    }

    pub fn submissions_url(&self) -> String {
        format!("{}/submissions?base64_encoded=false&wait=true", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct Submission<'a> {
    source_code: &'a str,
    language_id: u32,
    stdin: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmissionResult {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

/// Synchronous (`wait=true`) Judge0 submissions.
pub struct Judge0Runner {
    client: reqwest::Client,
    config: Judge0Config,
}

impl Judge0Runner {
    pub fn new(config: Judge0Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &Judge0Config {
        &self.config
    }
}

impl CodeRunner for Judge0Runner {
    async fn run(&self, request: &RunRequest) -> Result<RunOutput, RunError> {
        let submission = Submission {
            source_code: &request.code,
            language_id: request.language.judge0_id(),
            stdin: &request.stdin,
        };
        log::debug!(
            "Submitting {} bytes of {} to Judge0",
            request.code.len(),
            request.language
        );

        let result: SubmissionResult = self
            .client
            .post(self.config.submissions_url())
            .header("X-RapidAPI-Key", &self.config.api_key)
            .header("X-RapidAPI-Host", &self.config.api_host)
            .json(&submission)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(RunOutput::from_streams(result.stdout, result.stderr))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseResult {
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradeReport {
    pub cases: Vec<CaseResult>,
}

impl GradeReport {
    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|case| case.passed).count()
    }

    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(|case| case.passed)
    }

    /// `Pending` when there was nothing to grade.
    pub fn verdict(&self) -> Verdict {
        if self.cases.is_empty() {
            Verdict::Pending
        } else if self.all_passed() {
            Verdict::Passed
        } else {
            Verdict::Failed
        }
    }
}

impl fmt::Display for GradeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, case) in self.cases.iter().enumerate() {
            let status = if case.passed { "Passed" } else { "Failed" };
            writeln!(f, "Test Case {}: {status}", index + 1)?;
            writeln!(f, "  Input:    {}", case.input)?;
            writeln!(f, "  Expected: {}", case.expected)?;
            writeln!(f, "  Output:   {}", case.actual)?;
        }
        write!(f, "{}/{} passed", self.passed_count(), self.cases.len())
    }
}

/// Run `code` against every case in order. Output and expectation are
/// compared after trimming surrounding whitespace.
pub async fn grade<R: CodeRunner>(
    runner: &R,
    code: &str,
    language: Language,
    cases: &[TestCase],
) -> GradeReport {
    let mut results = Vec::with_capacity(cases.len());
    for (index, case) in cases.iter().enumerate() {
        let request = RunRequest {
            code: code.to_owned(),
            language,
            stdin: case.input.clone(),
        };
        let actual = match runner.run(&request).await {
            Ok(output) => output.output,
            Err(e) => {
                log::warn!("Test case {} failed to run: {e}", index + 1);
                RUN_ERROR_OUTPUT.to_owned()
            }
        };
        let passed = actual.trim() == case.expected_output.trim();
        results.push(CaseResult {
            input: case.input.clone(),
            expected: case.expected_output.clone(),
            actual,
            passed,
        });
    }

    let report = GradeReport { cases: results };
    log::info!(
        "Graded {} submission: {}/{} passed",
        language,
        report.passed_count(),
        report.cases.len()
    );
    report
}
