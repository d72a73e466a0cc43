use super::orchestrator::{TestRun, TestState};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Failure,
    NoApplicableTests,
}

/// Pass/fail summary of the test runs of one orchestration run
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationReport {
    pub runs: Vec<TestRun>,
    pub overall_outcome: Outcome,
    pub failure_count: usize,
    /// One `Test <catalog position>: <message>` line per failing test.
    pub error_message: String,
    /// Set once the orchestrator signalled the end of the run.
    pub finished: bool,
}

/// Summarize the current test runs
///
/// Pure, so it can be recomputed for every live snapshot. Untried `PENDING`
/// runs never count as failures.
pub fn summarize(runs: &[TestRun]) -> OrchestrationReport {
    let failures: Vec<String> = runs
        .iter()
        .filter(|run| run.state == TestState::Failure)
        .map(|run| {
            let message = run
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            format!("Test {}: {message}", run.position)
        })
        .collect();

    let overall_outcome = if runs.is_empty() {
        Outcome::NoApplicableTests
    } else if failures.is_empty() {
        Outcome::Success
    } else {
        Outcome::Failure
    };

    OrchestrationReport {
        runs: runs.to_vec(),
        overall_outcome,
        failure_count: failures.len(),
        error_message: failures.join("\n"),
        finished: false,
    }
}
