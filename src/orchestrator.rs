//! Update flow orchestration
//!
//! The orchestrator owns the outer state machine: it asks a [`CheckDecision`]
//! what kind of update is available, builds the corresponding worker list
//! (install takes precedence over patch when both are wanted), then drives
//! each worker through Preprocess, Process, and Postprocess in order.
//!
//! A failed phase does not fail the flow by itself. The orchestrator records
//! the error on the worker, emits events, and consults the [`RetryPolicy`]
//! with the per-(worker, phase) attempt count. A granted retry sleeps out the
//! policy's delay and re-attempts the same phase from the top; a denied retry
//! aborts the whole flow. Workers after an aborted one never run.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::worker::{FlowPhase, Worker};

/// What kinds of update a check found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    /// A full application package should be installed
    pub want_install: bool,
    /// Content should be patched
    pub want_patch: bool,
}

impl CheckOutcome {
    /// Neither an install nor a patch is wanted
    pub fn is_up_to_date(&self) -> bool {
        !self.want_install && !self.want_patch
    }
}

/// Decides which update flow to run, if any
#[async_trait::async_trait]
pub trait CheckDecision: Send + Sync {
    /// Probe whatever upstream state is relevant and report what is wanted
    async fn on_check(&self) -> Result<CheckOutcome>;
}

/// Always run the patch flow
///
/// The default decision for deployments with no separate application
/// installer: the patch worker's own diff decides whether anything happens.
pub struct AlwaysPatch;

#[async_trait::async_trait]
impl CheckDecision for AlwaysPatch {
    async fn on_check(&self) -> Result<CheckOutcome> {
        Ok(CheckOutcome {
            want_install: false,
            want_patch: true,
        })
    }
}

/// Drives workers through the three-phase flow with retry
pub struct Orchestrator {
    events: EventBus,
    policy: Arc<dyn RetryPolicy>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator with the default exponential backoff policy
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            policy: Arc::new(ExponentialBackoff::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the retry policy
    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Observe this cancellation token between phase attempts
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a full update flow: check, select workers, execute
    ///
    /// `build_workers` receives the check outcome and returns the workers to
    /// run, in order. It is only called when the outcome wants an update;
    /// when both an install and a patch are wanted, the outcome it receives
    /// requests only the install.
    pub async fn run<F>(&self, decision: &dyn CheckDecision, build_workers: F) -> Result<()>
    where
        F: FnOnce(CheckOutcome) -> Vec<Box<dyn Worker>>,
    {
        self.events.emit(Event::FlowStarted);
        info!("update check starting");

        let outcome = match decision.on_check().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.emit(Event::FlowAborted {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        if outcome.is_up_to_date() {
            info!("already up to date");
            self.events.emit(Event::NoUpdate);
            self.events.emit(Event::FlowFinished);
            return Ok(());
        }

        // Install supersedes patching: a fresh package already carries
        // current content, so a patch pass on top would be wasted work.
        let outcome = if outcome.want_install {
            CheckOutcome {
                want_install: true,
                want_patch: false,
            }
        } else {
            outcome
        };

        let workers = build_workers(outcome);
        match self.run_workers(workers).await {
            Ok(()) => {
                info!("update flow finished");
                self.events.emit(Event::FlowFinished);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "update flow aborted");
                self.events.emit(Event::FlowAborted {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Execute pre-built workers without an update check
    pub async fn run_workers(&self, workers: Vec<Box<dyn Worker>>) -> Result<()> {
        for mut worker in workers {
            self.events.emit(Event::WorkerStarted {
                worker: worker.name().to_string(),
            });
            for phase in [
                FlowPhase::Preprocess,
                FlowPhase::Process,
                FlowPhase::Postprocess,
            ] {
                self.run_phase(worker.as_mut(), phase).await?;
            }
            self.events.emit(Event::WorkerFinished {
                worker: worker.name().to_string(),
            });
        }
        Ok(())
    }

    /// Run one phase to success, or until the policy denies a retry
    async fn run_phase(&self, worker: &mut dyn Worker, phase: FlowPhase) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let result = match phase {
                FlowPhase::Preprocess => worker.preprocess().await,
                FlowPhase::Process => worker.process().await,
                FlowPhase::Postprocess => worker.postprocess().await,
            };
            let err = match result {
                Ok(()) => {
                    worker.set_error(None);
                    return Ok(());
                }
                Err(e) => e,
            };
            // Cancellation is terminal; the policy never sees it.
            if matches!(err, Error::Cancelled) {
                return Err(err);
            }
            worker.set_error(Some(err.to_string()));
            attempt += 1;

            let decision = self
                .policy
                .on_retry(phase, worker.name(), attempt)
                .await;
            if !decision.retry {
                return Err(Error::RetryDenied {
                    phase,
                    attempts: attempt,
                    cause: err.to_string(),
                });
            }
            self.events.emit(Event::WorkerRetrying {
                worker: worker.name().to_string(),
                phase,
                attempt,
                error: err.to_string(),
            });
            tokio::time::sleep(decision.delay).await;
        }
    }
}
