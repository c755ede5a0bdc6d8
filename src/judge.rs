use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::compiler::{self, CompileOutcome, Workspace};
use crate::config::{JudgeConfig, Limits};
use crate::sandbox::{BoxPool, RunReport, run_in_box};

/// Placeholder surfaced instead of hidden test-case content.
pub const HIDDEN_PLACEHOLDER: &str = "(hidden)";

/// One test case as the engine sees it: problem ownership, ordering and
/// display flags stay behind in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub expected: String,
    pub is_hidden: bool,
}

/// Final classification of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    PartiallyAccepted,
    CompilationError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::PartiallyAccepted => "Partially Accepted",
            Self::CompilationError => "Compilation Error",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure of a single run.
///
/// These are judged results carried inside case records; only tooling faults
/// that cannot be pinned to one test case travel as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Internal Error")]
    InternalError,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
            Self::InternalError => "Internal Error",
        }
    }
}

/// Per-test record persisted into the submission's `results` column.
///
/// Ordinal 0 is reserved for the compile stage; test cases are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub sample: u32,
    pub passed: bool,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub fault: Option<FaultKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub memory_kb: u64,
    pub is_hidden: bool,
}

/// Aggregated result of judging one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeOutcome {
    pub verdict: Verdict,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub results: Vec<CaseRecord>,
}

/// The execution & verdict engine: compiles a submission and races its test
/// cases through the box pool.
pub struct Judge {
    pool: Arc<BoxPool>,
    config: JudgeConfig,
}

impl Judge {
    pub fn new(pool: Arc<BoxPool>, config: JudgeConfig) -> Self {
        Self { pool, config }
    }

    /// Judges one submission against its test cases.
    ///
    /// Deterministic outcomes (compile rejection, wrong output, classified
    /// run faults) come back as a `JudgeOutcome`; an `Err` always means the
    /// judging machinery itself failed and the job should be retried.
    pub async fn judge(
        &self,
        code: &str,
        tests: Vec<TestCase>,
        limits: Limits,
    ) -> Result<JudgeOutcome> {
        let total_tests = tests.len() as u32;
        let workspace = Workspace::create().await?;

        let timeout = Duration::from_millis(self.config.compile_timeout_ms);
        let binary = match compiler::compile(code, &workspace, timeout).await? {
            CompileOutcome::Compiled(path) => path,
            CompileOutcome::Rejected(diagnostics) => {
                // No sandbox box is ever acquired on this path
                return Ok(rejected_outcome(diagnostics, total_tests));
            }
        };

        log::debug!(
            "Compiled submission, running {total_tests} test case(s) under {}ms / {}MB",
            limits.time_limit_ms,
            limits.memory_limit_mb
        );

        // Test cases race each other; the box pool is the only concurrency
        // bound. Results are reassembled in sample order afterwards.
        let mut tasks = JoinSet::new();
        for (index, test) in tests.into_iter().enumerate() {
            let pool = Arc::clone(&self.pool);
            let binary = binary.clone();
            let process_limit = self.config.process_limit;
            tasks.spawn(async move {
                let record =
                    run_one_test(index as u32 + 1, test, binary, limits, process_limit, pool).await;
                (index, record)
            });
        }

        let mut slots: Vec<Option<CaseRecord>> = (0..total_tests).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, record) = joined.context("test case task panicked")?;
            slots[index] = Some(record?);
        }
        let results: Vec<CaseRecord> = slots.into_iter().flatten().collect();

        let (verdict, passed_tests) = aggregate(&results, total_tests);
        Ok(JudgeOutcome {
            verdict,
            total_tests,
            passed_tests,
            results,
        })
    }
}

/// Runs one test case end to end, holding a box lease for the duration.
///
/// Everything that happens inside the box is folded into a classified case
/// record so one bad run never aborts the batch; only the failure to obtain
/// a box at all escalates to the job level.
async fn run_one_test(
    ordinal: u32,
    test: TestCase,
    binary: PathBuf,
    limits: Limits,
    process_limit: u32,
    pool: Arc<BoxPool>,
) -> Result<CaseRecord> {
    let lease = pool.acquire().await.context("failed to acquire a box")?;

    let record = match run_in_box(lease.box_id(), &binary, &test.input, limits, process_limit).await
    {
        Ok(report) => match classify(&report, &limits) {
            Some(fault) => fault_record(ordinal, &test, fault, fault.as_str().to_string(), &report),
            None => output_record(ordinal, &test, &report),
        },
        Err(e) => {
            log::error!("Box {} execution fault: {e:#}", lease.box_id());
            CaseRecord {
                sample: ordinal,
                passed: false,
                input: redact(&test.input, test.is_hidden),
                expected: redact(&test.expected, test.is_hidden),
                actual: String::new(),
                fault: Some(FaultKind::InternalError),
                error: Some(format!("Internal Error: {e}")),
                duration_ms: 0,
                memory_kb: 0,
                is_hidden: test.is_hidden,
            }
        }
    };

    // Lease drops here, releasing the box on every path
    Ok(record)
}

/// Maps a run report onto the failure taxonomy.
///
/// The meta status wins over everything else and stdout is never trusted on
/// a classified failure; the memory ceiling is checked only for runs the
/// sandbox itself let finish.
fn classify(report: &RunReport, limits: &Limits) -> Option<FaultKind> {
    let Some(meta) = &report.meta else {
        return Some(FaultKind::InternalError);
    };

    if let Some(status) = meta.status.as_deref() {
        return Some(match status {
            "TO" => FaultKind::TimeLimitExceeded,
            "RE" | "SG" => FaultKind::RuntimeError,
            _ => FaultKind::InternalError,
        });
    }

    if meta.memory_kb.is_some_and(|kb| kb > limits.memory_limit_kb()) {
        return Some(FaultKind::MemoryLimitExceeded);
    }

    None
}

fn fault_record(
    ordinal: u32,
    test: &TestCase,
    fault: FaultKind,
    message: String,
    report: &RunReport,
) -> CaseRecord {
    CaseRecord {
        sample: ordinal,
        passed: false,
        input: redact(&test.input, test.is_hidden),
        expected: redact(&test.expected, test.is_hidden),
        actual: String::new(),
        fault: Some(fault),
        error: Some(message),
        duration_ms: measured_duration(report),
        memory_kb: measured_memory(report),
        is_hidden: test.is_hidden,
    }
}

fn output_record(ordinal: u32, test: &TestCase, report: &RunReport) -> CaseRecord {
    let passed = report.stdout.trim() == test.expected.trim();

    CaseRecord {
        sample: ordinal,
        passed,
        input: redact(&test.input, test.is_hidden),
        expected: redact(&test.expected, test.is_hidden),
        actual: if test.is_hidden && !passed {
            HIDDEN_PLACEHOLDER.to_string()
        } else {
            report.stdout.trim().to_string()
        },
        fault: None,
        error: None,
        duration_ms: measured_duration(report),
        memory_kb: measured_memory(report),
        is_hidden: test.is_hidden,
    }
}

fn redact(content: &str, is_hidden: bool) -> String {
    if is_hidden {
        HIDDEN_PLACEHOLDER.to_string()
    } else {
        content.to_string()
    }
}

fn measured_duration(report: &RunReport) -> u64 {
    report
        .meta
        .as_ref()
        .and_then(|m| m.wall_time_ms)
        .unwrap_or(report.duration_ms)
}

fn measured_memory(report: &RunReport) -> u64 {
    report
        .meta
        .as_ref()
        .and_then(|m| m.memory_kb)
        .unwrap_or_default()
}

fn rejected_outcome(diagnostics: String, total_tests: u32) -> JudgeOutcome {
    JudgeOutcome {
        verdict: Verdict::CompilationError,
        total_tests,
        passed_tests: 0,
        results: vec![CaseRecord {
            sample: 0,
            passed: false,
            input: String::new(),
            expected: String::new(),
            actual: String::new(),
            fault: None,
            error: Some(format!("Compilation Error:\n{diagnostics}")),
            duration_ms: 0,
            memory_kb: 0,
            is_hidden: false,
        }],
    }
}

/// Folds per-test records into the overall verdict.
///
/// The order of checks is deliberate and load-bearing: zero passes is always
/// Wrong Answer, and among partial passes the *first* faulting test case
/// names the verdict, not the worst one. Internal faults have no verdict of
/// their own and fall through to Partially Accepted.
pub fn aggregate(results: &[CaseRecord], total_tests: u32) -> (Verdict, u32) {
    let passed_tests = results.iter().filter(|r| r.passed).count() as u32;

    if passed_tests == 0 {
        return (Verdict::WrongAnswer, 0);
    }
    if passed_tests == total_tests {
        return (Verdict::Accepted, passed_tests);
    }

    let first_fault = results.iter().find_map(|r| r.fault);
    let verdict = match first_fault {
        Some(FaultKind::TimeLimitExceeded) => Verdict::TimeLimitExceeded,
        Some(FaultKind::MemoryLimitExceeded) => Verdict::MemoryLimitExceeded,
        Some(FaultKind::RuntimeError) => Verdict::RuntimeError,
        Some(FaultKind::InternalError) | None => Verdict::PartiallyAccepted,
    };

    (verdict, passed_tests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Meta;
    use pretty_assertions::assert_eq;

    fn passing(sample: u32) -> CaseRecord {
        CaseRecord {
            sample,
            passed: true,
            input: "1 2".into(),
            expected: "3".into(),
            actual: "3".into(),
            fault: None,
            error: None,
            duration_ms: 10,
            memory_kb: 1024,
            is_hidden: false,
        }
    }

    fn wrong(sample: u32) -> CaseRecord {
        CaseRecord {
            actual: "4".into(),
            passed: false,
            ..passing(sample)
        }
    }

    fn faulty(sample: u32, fault: FaultKind) -> CaseRecord {
        CaseRecord {
            passed: false,
            actual: String::new(),
            fault: Some(fault),
            error: Some(fault.as_str().to_string()),
            ..passing(sample)
        }
    }

    fn report(meta: Option<Meta>, stdout: &str) -> RunReport {
        RunReport {
            meta,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 42,
        }
    }

    #[test]
    fn all_passed_is_accepted() {
        let results = vec![passing(1), passing(2)];
        assert_eq!(aggregate(&results, 2), (Verdict::Accepted, 2));
    }

    #[test]
    fn zero_passed_is_wrong_answer() {
        let results = vec![wrong(1), wrong(2)];
        assert_eq!(aggregate(&results, 2), (Verdict::WrongAnswer, 0));
    }

    #[test]
    fn zero_passed_wins_even_over_faults() {
        let results = vec![wrong(1), faulty(2, FaultKind::TimeLimitExceeded)];
        assert_eq!(aggregate(&results, 2), (Verdict::WrongAnswer, 0));
    }

    #[test]
    fn partial_without_faults_is_partially_accepted() {
        let results = vec![passing(1), wrong(2)];
        assert_eq!(aggregate(&results, 2), (Verdict::PartiallyAccepted, 1));
    }

    #[test]
    fn first_fault_names_the_partial_verdict() {
        // 3 passed, 1 wrong answer, 1 TLE: the runtime-classified failure
        // wins over the plain wrong answer
        let results = vec![
            passing(1),
            passing(2),
            wrong(3),
            faulty(4, FaultKind::TimeLimitExceeded),
            passing(5),
        ];
        assert_eq!(aggregate(&results, 5), (Verdict::TimeLimitExceeded, 3));
    }

    #[test]
    fn first_fault_beats_later_faults() {
        let results = vec![
            passing(1),
            faulty(2, FaultKind::RuntimeError),
            faulty(3, FaultKind::MemoryLimitExceeded),
        ];
        assert_eq!(aggregate(&results, 3), (Verdict::RuntimeError, 1));
    }

    #[test]
    fn internal_fault_falls_through_to_partially_accepted() {
        let results = vec![passing(1), faulty(2, FaultKind::InternalError)];
        assert_eq!(aggregate(&results, 2), (Verdict::PartiallyAccepted, 1));
    }

    #[test]
    fn classify_follows_meta_status() {
        let limits = Limits {
            time_limit_ms: 5_000,
            memory_limit_mb: 256,
        };
        let to = report(
            Some(Meta {
                status: Some("TO".into()),
                ..Meta::default()
            }),
            "",
        );
        assert_eq!(classify(&to, &limits), Some(FaultKind::TimeLimitExceeded));

        for signal in ["RE", "SG"] {
            let re = report(
                Some(Meta {
                    status: Some(signal.into()),
                    ..Meta::default()
                }),
                "",
            );
            assert_eq!(classify(&re, &limits), Some(FaultKind::RuntimeError));
        }

        let xx = report(
            Some(Meta {
                status: Some("XX".into()),
                ..Meta::default()
            }),
            "",
        );
        assert_eq!(classify(&xx, &limits), Some(FaultKind::InternalError));
    }

    #[test]
    fn classify_checks_memory_ceiling_on_clean_runs() {
        let limits = Limits {
            time_limit_ms: 5_000,
            memory_limit_mb: 1,
        };
        let over = report(
            Some(Meta {
                memory_kb: Some(2048),
                ..Meta::default()
            }),
            "3",
        );
        assert_eq!(
            classify(&over, &limits),
            Some(FaultKind::MemoryLimitExceeded)
        );

        let under = report(
            Some(Meta {
                memory_kb: Some(512),
                ..Meta::default()
            }),
            "3",
        );
        assert_eq!(classify(&under, &limits), None);
    }

    #[test]
    fn missing_meta_is_an_internal_fault() {
        let limits = Limits {
            time_limit_ms: 5_000,
            memory_limit_mb: 256,
        };
        assert_eq!(
            classify(&report(None, ""), &limits),
            Some(FaultKind::InternalError)
        );
    }

    #[test]
    fn comparison_trims_both_sides_only() {
        let test = TestCase {
            input: "1 2".into(),
            expected: "3\n".into(),
            is_hidden: false,
        };
        let record = output_record(1, &test, &report(Some(Meta::default()), "  3\n"));
        assert!(record.passed);

        let strict = TestCase {
            input: "1 2".into(),
            expected: "a b".into(),
            is_hidden: false,
        };
        let record = output_record(1, &strict, &report(Some(Meta::default()), "a  b"));
        assert!(!record.passed, "interior whitespace must stay significant");
    }

    #[test]
    fn hidden_case_is_redacted_on_failure() {
        let test = TestCase {
            input: "secret in".into(),
            expected: "secret out".into(),
            is_hidden: true,
        };
        let record = output_record(1, &test, &report(Some(Meta::default()), "wrong"));
        assert!(!record.passed);
        assert_eq!(record.input, HIDDEN_PLACEHOLDER);
        assert_eq!(record.expected, HIDDEN_PLACEHOLDER);
        assert_eq!(record.actual, HIDDEN_PLACEHOLDER);
    }

    #[test]
    fn hidden_case_keeps_output_on_pass() {
        let test = TestCase {
            input: "secret in".into(),
            expected: "ok".into(),
            is_hidden: true,
        };
        let record = output_record(1, &test, &report(Some(Meta::default()), "ok\n"));
        assert!(record.passed);
        assert_eq!(record.input, HIDDEN_PLACEHOLDER);
        assert_eq!(record.expected, HIDDEN_PLACEHOLDER);
        assert_eq!(record.actual, "ok");
    }

    #[test]
    fn hidden_fault_record_is_redacted() {
        let test = TestCase {
            input: "secret".into(),
            expected: "secret".into(),
            is_hidden: true,
        };
        let record = fault_record(
            2,
            &test,
            FaultKind::RuntimeError,
            "Runtime Error".into(),
            &report(None, ""),
        );
        assert_eq!(record.input, HIDDEN_PLACEHOLDER);
        assert_eq!(record.expected, HIDDEN_PLACEHOLDER);
        assert_eq!(record.actual, "");
        assert_eq!(record.fault, Some(FaultKind::RuntimeError));
    }

    #[test]
    fn rejected_outcome_shape() {
        let outcome = rejected_outcome("main.cpp:1: error".into(), 3);
        assert_eq!(outcome.verdict, Verdict::CompilationError);
        assert_eq!(outcome.total_tests, 3);
        assert_eq!(outcome.passed_tests, 0);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].sample, 0);
        assert!(
            outcome.results[0]
                .error
                .as_deref()
                .unwrap()
                .starts_with("Compilation Error:\n")
        );
    }

    #[test]
    fn fault_kind_serializes_as_display_name() {
        let json = serde_json::to_string(&FaultKind::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"Time Limit Exceeded\"");
        let back: FaultKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FaultKind::TimeLimitExceeded);
    }
}
