//! Ordered, best-effort teardown.
//!
//! [`ShutdownCoordinator`] stops collaborators in registration order: the
//! sweeps, then the gateway, then the backend. It then cancels the remaining
//! background tasks and waits for them, and finally drains the dispatch
//! queue. Each step runs under the shared deadline; a step that fails,
//! panics, or overruns is logged and the next step still runs.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info, warn};
use thiserror::Error;
use tokio::{
    task::AbortHandle,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    backend::BackendLink,
    gateway::GatewayConnection,
    panic::report_panic,
    pipeline::MessagePipeline,
    sweep::Sweeper,
};

/// Grace period for draining the queue after tasks have been aborted.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Reasons a teardown step did not complete cleanly.
#[derive(Debug, Error)]
pub enum TeardownError {
    /// The step returned an error.
    #[error("teardown step {step} failed: {reason}")]
    Failed { step: &'static str, reason: String },
    /// The step panicked.
    #[error("teardown step {step} panicked: {reason}")]
    Panicked { step: &'static str, reason: String },
    /// The step did not finish before the deadline.
    #[error("teardown step {step} exceeded the shutdown deadline")]
    TimedOut { step: &'static str },
}

/// A collaborator that can be torn down.
#[async_trait]
pub trait Teardown: Send + Sync {
    /// Name used in log records.
    fn name(&self) -> &'static str;

    /// Release the collaborator's resources.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] when resources could not be released
    /// cleanly. The coordinator logs it and moves on.
    async fn teardown(&self) -> Result<(), TeardownError>;
}

#[async_trait]
impl Teardown for Sweeper {
    fn name(&self) -> &'static str { "sweeps" }

    async fn teardown(&self) -> Result<(), TeardownError> {
        self.stop().await;
        Ok(())
    }
}

#[async_trait]
impl Teardown for GatewayConnection {
    fn name(&self) -> &'static str { "gateway" }

    async fn teardown(&self) -> Result<(), TeardownError> {
        self.stop();
        self.wait_closed().await;
        Ok(())
    }
}

#[async_trait]
impl Teardown for BackendLink {
    fn name(&self) -> &'static str { "backend" }

    async fn teardown(&self) -> Result<(), TeardownError> {
        self.stop();
        Ok(())
    }
}

/// What happened during shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Steps that did not complete cleanly, in order.
    pub failures: Vec<TeardownError>,
    /// Background tasks were still running at the deadline and were aborted.
    pub tasks_aborted: bool,
    /// Frames discarded from the dispatch queue.
    pub drained: usize,
}

/// Runs the teardown sequence.
pub struct ShutdownCoordinator {
    wait: Duration,
    steps: Vec<Arc<dyn Teardown>>,
    task_token: CancellationToken,
    tasks: TaskTracker,
    abort_handles: Vec<AbortHandle>,
    pipeline: Option<Arc<MessagePipeline>>,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("wait", &self.wait)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator whose whole sequence is bounded by `wait`.
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            steps: Vec::new(),
            task_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            abort_handles: Vec::new(),
            pipeline: None,
        }
    }

    /// Append a teardown step.
    #[must_use]
    pub fn step(mut self, step: Arc<dyn Teardown>) -> Self {
        self.steps.push(step);
        self
    }

    /// Background tasks to cancel and await once every step has run.
    ///
    /// `abort_handles` are aborted when the tasks outlive the deadline.
    #[must_use]
    pub fn tasks(
        mut self,
        token: CancellationToken,
        tracker: TaskTracker,
        abort_handles: Vec<AbortHandle>,
    ) -> Self {
        self.task_token = token;
        self.tasks = tracker;
        self.abort_handles = abort_handles;
        self
    }

    /// Queue to drain last.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Arc<MessagePipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Run every step. Never fails; problems are logged and reported.
    pub async fn shutdown(&self) -> ShutdownReport {
        let deadline = Instant::now() + self.wait;
        let mut report = ShutdownReport::default();
        info!("shutdown started: steps={}, wait={:?}", self.steps.len(), self.wait);

        for step in &self.steps {
            if let Err(e) = run_step(step.as_ref(), deadline).await {
                warn!("{e}");
                report.failures.push(e);
            }
        }

        self.task_token.cancel();
        self.tasks.close();
        if timeout_at(deadline, self.tasks.wait()).await.is_err() {
            warn!(
                "background tasks still running at shutdown deadline: remaining={}",
                self.tasks.len()
            );
            for handle in &self.abort_handles {
                handle.abort();
            }
            report.tasks_aborted = true;
            let _ = timeout(DRAIN_GRACE, self.tasks.wait()).await;
        }

        if let Some(pipeline) = &self.pipeline {
            match timeout(DRAIN_GRACE, pipeline.drain()).await {
                Ok(drained) => report.drained = drained,
                Err(_) => error!("message pipeline could not be drained: consumer still holds the queue"),
            }
        }

        info!(
            "shutdown complete: failures={}, tasks_aborted={}, drained={}",
            report.failures.len(),
            report.tasks_aborted,
            report.drained
        );
        report
    }
}

async fn run_step(step: &dyn Teardown, deadline: Instant) -> Result<(), TeardownError> {
    let name = step.name();
    let fut = AssertUnwindSafe(step.teardown()).catch_unwind();
    match timeout_at(deadline, fut).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let reason = report_panic("teardown step panicked", name, panic.as_ref());
            Err(TeardownError::Panicked { step: name, reason })
        }
        Err(_) => Err(TeardownError::TimedOut { step: name }),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_util::{sync::CancellationToken, task::TaskTracker};

    use super::*;
    use crate::{config::PipelineConfig, test_helpers::frame};

    struct Step {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Ok,
        Fail,
        Panic,
        Hang,
    }

    #[async_trait]
    impl Teardown for Step {
        fn name(&self) -> &'static str { self.name }

        async fn teardown(&self) -> Result<(), TeardownError> {
            self.log.lock().expect("log").push(self.name);
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(TeardownError::Failed {
                    step: self.name,
                    reason: "socket already gone".into(),
                }),
                Behaviour::Panic => panic!("teardown exploded"),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn step(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        behaviour: Behaviour,
    ) -> Arc<dyn Teardown> {
        Arc::new(Step {
            name,
            log: Arc::clone(log),
            behaviour,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn failing_steps_do_not_block_later_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Arc::new(MessagePipeline::new(&PipelineConfig::default()));
        pipeline
            .enqueue(frame(json!({"post_type": "message"})))
            .await
            .expect("enqueue");

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(10))
            .step(step("sweeps", &log, Behaviour::Fail))
            .step(step("gateway", &log, Behaviour::Panic))
            .step(step("backend", &log, Behaviour::Ok))
            .pipeline(Arc::clone(&pipeline));
        let report = coordinator.shutdown().await;

        assert_eq!(*log.lock().expect("log"), vec!["sweeps", "gateway", "backend"]);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.drained, 1);
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_by_the_deadline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stuck = tracker.spawn(std::future::pending::<()>());
        let cooperative = {
            let token = token.clone();
            tracker.spawn(async move { token.cancelled().await })
        };

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(10))
            .step(step("gateway", &log, Behaviour::Hang))
            .step(step("backend", &log, Behaviour::Ok))
            .tasks(token, tracker, vec![stuck.abort_handle()]);
        let started = Instant::now();
        let report = coordinator.shutdown().await;

        assert!(started.elapsed() <= Duration::from_secs(11));
        assert!(matches!(
            report.failures.as_slice(),
            [TeardownError::TimedOut { step: "gateway" }]
        ));
        assert_eq!(*log.lock().expect("log"), vec!["gateway", "backend"]);
        assert!(report.tasks_aborted);
        assert!(stuck.await.expect_err("aborted").is_cancelled());
        cooperative.await.expect("cooperative task");
    }

    #[tokio::test]
    async fn cooperative_tasks_finish_without_abort() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let finished = Arc::new(AtomicBool::new(false));
        {
            let token = token.clone();
            let finished = Arc::clone(&finished);
            tracker.spawn(async move {
                token.cancelled().await;
                finished.store(true, Ordering::SeqCst);
            });
        }

        let report = ShutdownCoordinator::new(Duration::from_secs(10))
            .tasks(token, tracker, Vec::new())
            .shutdown()
            .await;

        assert!(!report.tasks_aborted);
        assert!(finished.load(Ordering::SeqCst));
    }
}
