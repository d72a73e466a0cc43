//! Provisioning validation
//!
//! After a configuration was submitted, the device is driven through the
//! applicable remote tests of its new mode. One orchestration run executes at
//! a time; a new run supersedes the one in progress.

pub mod catalog;
pub mod orchestrator;
pub mod report;

use self::{
    catalog::{Mode, TestCatalog},
    orchestrator::{OrchestrationState, Orchestrator},
    report::OrchestrationReport,
};
use crate::device_client::DeviceClient;
use log::info;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, watch},
    task::AbortHandle,
};
use uuid::Uuid;

/// What the UI renders: latest state plus its report
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSnapshot {
    pub state: Option<OrchestrationState>,
    pub report: Option<OrchestrationReport>,
}

impl From<Option<OrchestrationState>> for ValidationSnapshot {
    fn from(state: Option<OrchestrationState>) -> Self {
        let report = state.as_ref().map(OrchestrationState::report);
        Self { state, report }
    }
}

struct ActiveRun {
    run_id: Uuid,
    mode: Mode,
    handle: AbortHandle,
}

pub struct ValidationService<C> {
    catalog: Arc<TestCatalog>,
    orchestrator: Arc<Orchestrator<C>>,
    state_tx: Arc<watch::Sender<Option<OrchestrationState>>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl<C> Clone for ValidationService<C> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            orchestrator: self.orchestrator.clone(),
            state_tx: self.state_tx.clone(),
            active: self.active.clone(),
        }
    }
}

impl<C> ValidationService<C>
where
    C: DeviceClient + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>, catalog: TestCatalog, poll_interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(None);

        Self {
            catalog: Arc::new(catalog),
            orchestrator: Arc::new(Orchestrator::new(client, poll_interval)),
            state_tx: Arc::new(state_tx),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start an orchestration run for `mode`
    ///
    /// A run still in progress is aborted and its state discarded before the
    /// new all-`PENDING` state is published.
    pub async fn start(&self, mode: Mode) -> Uuid {
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            if !previous.handle.is_finished() {
                info!(
                    "run {} ({}) superseded by new submission",
                    previous.run_id, previous.mode
                );
            }
            previous.handle.abort();
        }

        let state = OrchestrationState::new(mode, &self.catalog);
        let run_id = state.run_id;
        self.state_tx.send_replace(Some(state.clone()));

        let orchestrator = self.orchestrator.clone();
        let state_tx = self.state_tx.clone();
        let handle = tokio::spawn(async move {
            orchestrator
                .run(state, |snapshot| publish_if_current(&state_tx, snapshot))
                .await;
        });

        info!("run {run_id} started for mode {mode}");

        *active = Some(ActiveRun {
            run_id,
            mode,
            handle: handle.abort_handle(),
        });

        run_id
    }

    /// Re-run validation for the most recently started mode
    pub async fn restart(&self) -> Option<(Uuid, Mode)> {
        let mode = self.active.lock().await.as_ref().map(|run| run.mode)?;
        Some((self.start(mode).await, mode))
    }

    pub fn snapshot(&self) -> ValidationSnapshot {
        self.state_tx.borrow().clone().into()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<OrchestrationState>> {
        self.state_tx.subscribe()
    }
}

/// Publish `snapshot` unless its run has been superseded meanwhile
fn publish_if_current(
    state_tx: &watch::Sender<Option<OrchestrationState>>,
    snapshot: &OrchestrationState,
) {
    state_tx.send_if_modified(|current| match current {
        Some(state) if state.run_id == snapshot.run_id => {
            *state = snapshot.clone();
            true
        }
        _ => false,
    });
}

#[cfg(test)]
mod tests {
    use super::{
        catalog::TestDefinition,
        orchestrator::{RunPhase, TestState},
        report::Outcome,
        *,
    };
    use crate::device_client::{AttemptOutcome, WifiScan};
    use anyhow::Result;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Device whose test 1 answers "still running" forever, all others succeed
    #[derive(Default)]
    struct SlowDevice {
        attempts: AtomicU32,
    }

    impl DeviceClient for SlowDevice {
        async fn run_test(&self, test_id: u32, _timeout: Duration) -> AttemptOutcome {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if test_id == 1 {
                AttemptOutcome::Pending
            } else {
                AttemptOutcome::Success
            }
        }

        async fn submit_config(&self, _payload: Map<String, Value>) -> Result<()> {
            Ok(())
        }

        async fn current_config(&self) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn wifi_scan(&self) -> Result<WifiScan> {
            Ok(WifiScan::default())
        }

        async fn reboot(&self) -> Result<()> {
            Ok(())
        }
    }

    fn catalog() -> TestCatalog {
        TestCatalog::new(vec![
            TestDefinition::new(1, "slow", &[Mode::Mqtt]).with_max_retries(1_000),
            TestDefinition::new(2, "fast", &[Mode::Http]).with_max_retries(0),
        ])
    }

    fn service(poll_interval: Duration) -> ValidationService<SlowDevice> {
        ValidationService::new(Arc::new(SlowDevice::default()), catalog(), poll_interval)
    }

    async fn wait_until_finished(
        rx: &mut watch::Receiver<Option<OrchestrationState>>,
        run_id: Uuid,
    ) -> OrchestrationState {
        let state = rx
            .wait_for(|state| {
                state
                    .as_ref()
                    .is_some_and(|s| s.run_id == run_id && s.phase.is_finished())
            })
            .await
            .unwrap();
        state.clone().unwrap()
    }

    #[tokio::test]
    async fn snapshot_is_empty_before_first_run() {
        let service = service(Duration::ZERO);
        let snapshot = service.snapshot();
        assert!(snapshot.state.is_none());
        assert!(snapshot.report.is_none());
    }

    #[tokio::test]
    async fn restart_without_submission_is_refused() {
        let service = service(Duration::ZERO);
        assert!(service.restart().await.is_none());
    }

    #[tokio::test]
    async fn started_run_publishes_final_report() {
        let service = service(Duration::ZERO);
        let mut rx = service.subscribe();

        let run_id = service.start(Mode::Http).await;
        let state = wait_until_finished(&mut rx, run_id).await;

        assert_eq!(state.phase, RunPhase::Completed);
        let report = service.snapshot().report.unwrap();
        assert_eq!(report.overall_outcome, Outcome::Success);
        assert!(report.finished);
    }

    #[tokio::test]
    async fn new_submission_supersedes_running_run() {
        let service = service(Duration::from_millis(5));
        let mut rx = service.subscribe();

        let first = service.start(Mode::Mqtt).await;
        rx.wait_for(|state| {
            state
                .as_ref()
                .is_some_and(|s| s.runs[0].state == TestState::Running)
        })
        .await
        .unwrap();

        let second = service.start(Mode::Http).await;
        assert_ne!(first, second);

        let state = wait_until_finished(&mut rx, second).await;
        assert_eq!(state.mode, Mode::Http);
        assert_eq!(state.runs[0].definition.id, 2);

        // superseded run can no longer overwrite the published state
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.snapshot().state.unwrap().run_id, second);
    }

    #[tokio::test]
    async fn new_run_starts_from_pending_state() {
        let service = service(Duration::ZERO);
        let mut rx = service.subscribe();

        let first = service.start(Mode::Http).await;
        wait_until_finished(&mut rx, first).await;

        let second = service.start(Mode::Http).await;
        let state = service.snapshot().state.unwrap();
        assert_eq!(state.run_id, second);
        assert_eq!(state.phase, RunPhase::Pending);
        assert!(
            state
                .runs
                .iter()
                .all(|run| run.state == TestState::Pending && run.attempts_made == 0)
        );

        let (restarted, mode) = service.restart().await.unwrap();
        assert_eq!(mode, Mode::Http);
        assert_ne!(restarted, second);
    }
}
