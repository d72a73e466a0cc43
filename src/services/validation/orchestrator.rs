use super::{
    catalog::{Mode, TestCatalog, TestDefinition},
    report::{OrchestrationReport, summarize},
};
use crate::device_client::{AttemptOutcome, DeviceClient, LinkyDeviceClient};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TestState {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
}

/// Why a test run, or a whole orchestration run, did not succeed
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "message")]
pub enum ValidationError {
    /// Reported by the device, never retried.
    ApplicationFailure(String),
    Timeout,
    TransportError(String),
    /// Device job still running after the whole poll budget.
    PendingExhausted,
    NoApplicableTests,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ApplicationFailure(message) => write!(f, "{message}"),
            ValidationError::Timeout => write!(f, "{}", LinkyDeviceClient::TIMEOUT_MESSAGE),
            ValidationError::TransportError(message) => write!(f, "{message}"),
            ValidationError::PendingExhausted => write!(f, "Timeout waiting for device"),
            ValidationError::NoApplicableTests => write!(f, "No test available for this mode"),
        }
    }
}

/// Execution record of one test definition within one orchestration run
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    /// Position of the definition in the full catalog, used to number failures.
    pub position: usize,
    pub definition: TestDefinition,
    pub state: TestState,
    /// Device requests issued, never more than `definition.max_attempts()`.
    pub attempts_made: u32,
    /// Subset of `attempts_made` that answered "still running".
    pub poll_attempts: u32,
    pub last_error: Option<ValidationError>,
}

impl TestRun {
    pub fn new(position: usize, definition: TestDefinition) -> Self {
        Self {
            position,
            definition,
            state: TestState::Pending,
            attempts_made: 0,
            poll_attempts: 0,
            last_error: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = TestState::Pending;
        self.attempts_made = 0;
        self.poll_attempts = 0;
        self.last_error = None;
    }

    fn succeed(&mut self) {
        self.state = TestState::Success;
        self.last_error = None;
    }

    fn fail(&mut self, error: ValidationError) {
        self.state = TestState::Failure;
        self.last_error = Some(error);
    }

    fn budget_exhausted(&self) -> bool {
        self.attempts_made >= self.definition.max_attempts()
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    /// Created, no attempt issued yet.
    #[default]
    Pending,
    Running,
    /// Every applicable test was driven to a terminal state.
    Completed,
    /// A failing test without `continue_on_failure` stopped the run.
    Aborted,
    NoApplicableTests,
}

impl RunPhase {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Aborted | RunPhase::NoApplicableTests
        )
    }
}

/// State of one orchestration run, passed into and returned from [`Orchestrator::run`]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationState {
    pub run_id: Uuid,
    pub mode: Mode,
    pub phase: RunPhase,
    pub runs: Vec<TestRun>,
    /// Message of the failure that stopped the run, shown before the final report.
    pub abort_error: Option<String>,
}

impl OrchestrationState {
    pub fn new(mode: Mode, catalog: &TestCatalog) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            phase: RunPhase::Pending,
            runs: catalog
                .positioned_tests(mode)
                .into_iter()
                .map(|(position, definition)| TestRun::new(position, definition))
                .collect(),
            abort_error: None,
        }
    }

    /// Back to all-`PENDING`, keeping run id and mode
    pub fn reset(&mut self) {
        self.phase = RunPhase::Pending;
        self.abort_error = None;
        self.runs.iter_mut().for_each(TestRun::reset);
    }

    pub fn report(&self) -> OrchestrationReport {
        let mut report = summarize(&self.runs);
        report.finished = self.phase.is_finished();
        report
    }
}

/// Drives the applicable tests of one mode through attempt, poll and retry cycles
pub struct Orchestrator<C> {
    client: Arc<C>,
    poll_interval: Duration,
}

impl<C> Orchestrator<C>
where
    C: DeviceClient + Sync,
{
    pub fn new(client: Arc<C>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Execute one orchestration run
    ///
    /// Tests are driven strictly one after another in catalog order. `publish`
    /// receives a snapshot after every state change. The run never fails: the
    /// returned state is terminal and carries every per-test failure.
    pub async fn run<F>(&self, mut state: OrchestrationState, mut publish: F) -> OrchestrationState
    where
        F: FnMut(&OrchestrationState) + Send,
    {
        state.reset();

        if state.runs.is_empty() {
            info!(
                "run {}: {}",
                state.run_id,
                ValidationError::NoApplicableTests
            );
            state.phase = RunPhase::NoApplicableTests;
            state.abort_error = Some(ValidationError::NoApplicableTests.to_string());
            publish(&state);
            return state;
        }

        info!(
            "run {}: validating {} tests for mode {}",
            state.run_id,
            state.runs.len(),
            state.mode
        );
        state.phase = RunPhase::Running;
        publish(&state);

        for index in 0..state.runs.len() {
            self.drive_test(&mut state, index, &mut publish).await;

            let run = &state.runs[index];
            if run.state == TestState::Failure && !run.definition.continue_on_failure {
                let message = run
                    .last_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                warn!(
                    "run {}: test {} failed, aborting remaining tests: {message}",
                    state.run_id, run.definition.id
                );
                state.abort_error = Some(format!("Test {}: {message}", run.position));
                state.phase = RunPhase::Aborted;
                break;
            }
        }

        if state.phase == RunPhase::Running {
            state.phase = RunPhase::Completed;
        }

        info!("run {}: finished as {:?}", state.run_id, state.phase);
        publish(&state);
        state
    }

    /// Drive the test at `index` until it reaches a terminal state
    async fn drive_test<F>(&self, state: &mut OrchestrationState, index: usize, publish: &mut F)
    where
        F: FnMut(&OrchestrationState) + Send,
    {
        let definition = state.runs[index].definition.clone();
        state.runs[index].state = TestState::Running;
        publish(state);

        loop {
            let outcome = self
                .client
                .run_test(definition.id, definition.timeout())
                .await;

            let run = &mut state.runs[index];
            run.attempts_made += 1;
            debug!(
                "test {} attempt {}/{}: {outcome:?}",
                definition.id,
                run.attempts_made,
                definition.max_attempts()
            );

            let retryable = match outcome {
                AttemptOutcome::Success => {
                    run.succeed();
                    break;
                }
                AttemptOutcome::Failure(message) => {
                    run.fail(ValidationError::ApplicationFailure(message));
                    break;
                }
                AttemptOutcome::Pending => {
                    run.poll_attempts += 1;
                    ValidationError::PendingExhausted
                }
                AttemptOutcome::TimedOut => ValidationError::Timeout,
                AttemptOutcome::TransportError(message) => {
                    ValidationError::TransportError(message)
                }
            };

            if run.budget_exhausted() {
                run.fail(retryable);
                break;
            }

            publish(state);
            sleep(self.poll_interval).await;
        }

        info!(
            "test {} ({}) finished as {:?} after {} attempts",
            definition.id, definition.label, state.runs[index].state, state.runs[index].attempts_made
        );
        publish(state);
    }
}
