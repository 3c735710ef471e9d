//! Serialized on-demand worker
//!
//! Runs at most one request at a time. The state lives in a watch channel:
//! starting is an atomic check-and-set on it, completion replaces it with
//! the outcome, and callers either poll [`PollingEngine::results`] or await
//! [`PollingEngine::wait`].

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use syde_core::{Content, ElementId};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::dealer::ListSnapshot;
use crate::error::{DriverError, DriverResult};

/// Result payload of a finished request
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutput {
    None,
    Bool(bool),
    Value(Content),
    Elements(Vec<ElementId>),
    Snapshot(Vec<ListSnapshot>),
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub operation: String,
    pub result: Result<PollOutput, DriverError>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub enum PollState {
    #[default]
    Idle,
    Running {
        operation: String,
    },
    Finished(PollOutcome),
}

impl PollState {
    pub fn is_running(&self) -> bool {
        matches!(self, PollState::Running { .. })
    }
}

pub struct PollingEngine {
    state: Arc<watch::Sender<PollState>>,
}

impl Default for PollingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingEngine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            state: Arc::new(state),
        }
    }

    /// Run `job` in the background
    ///
    /// Fails with [`DriverError::Busy`] while another job is running; the
    /// running job is not affected.
    pub fn start<F>(&self, operation: &str, job: F) -> DriverResult<()>
    where
        F: Future<Output = DriverResult<PollOutput>> + Send + 'static,
    {
        let started = self.state.send_if_modified(|state| {
            if state.is_running() {
                return false;
            }
            *state = PollState::Running {
                operation: operation.to_string(),
            };
            true
        });
        if !started {
            debug!(operation, "Polling engine busy");
            return Err(DriverError::Busy);
        }

        let state = self.state.clone();
        let operation = operation.to_string();
        let job = tokio::spawn(job);
        tokio::spawn(async move {
            let result = match job.await {
                Ok(result) => result,
                Err(e) => {
                    let reason = if e.is_panic() { "panicked" } else { "cancelled" };
                    Err(DriverError::Aborted(format!("request {}", reason)))
                }
            };
            if let Err(e) = &result {
                warn!(operation = %operation, error = %e, "Polled request failed");
            }
            state.send_replace(PollState::Finished(PollOutcome {
                operation,
                result,
                finished_at: Utc::now(),
            }));
        });
        Ok(())
    }

    pub fn state(&self) -> PollState {
        self.state.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().is_running()
    }

    /// Result of the last finished request
    pub fn results(&self) -> Option<Result<PollOutput, DriverError>> {
        match &*self.state.borrow() {
            PollState::Finished(outcome) => Some(outcome.result.clone()),
            _ => None,
        }
    }

    /// Negative response code of the last finished request, if it failed
    /// with one
    pub fn nrc(&self) -> Option<u8> {
        match &*self.state.borrow() {
            PollState::Finished(PollOutcome { result: Err(e), .. }) => e.nrc(),
            _ => None,
        }
    }

    /// Wait until no request is running
    ///
    /// Returns the outcome of the last request, `None` if nothing ran yet.
    pub async fn wait(&self) -> Option<PollOutcome> {
        let mut rx = self.state.subscribe();
        let state = rx.wait_for(|s| !s.is_running()).await.ok()?;
        match &*state {
            PollState::Finished(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NegativeResponseCode, ProtocolError};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_second_request_is_busy() {
        let engine = PollingEngine::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        engine
            .start("read list", async move {
                let _ = release_rx.await;
                Ok(PollOutput::Bool(true))
            })
            .unwrap();
        assert!(engine.is_busy());

        let err = engine
            .start("write list", async { Ok(PollOutput::None) })
            .unwrap_err();
        assert!(matches!(err, DriverError::Busy));
        assert!(
            matches!(engine.state(), PollState::Running { ref operation } if operation == "read list")
        );

        release_tx.send(()).unwrap();
        let outcome = engine.wait().await.unwrap();
        assert_eq!(outcome.operation, "read list");
        assert_eq!(outcome.result.unwrap(), PollOutput::Bool(true));
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_nrc_of_failed_request() {
        let engine = PollingEngine::new();
        engine
            .start("notify", async {
                Err(ProtocolError::Nack {
                    service: 0xBE,
                    nrc: NegativeResponseCode::ConditionsNotCorrect,
                }
                .into())
            })
            .unwrap();
        engine.wait().await;

        assert_eq!(engine.nrc(), Some(0x22));
        assert!(matches!(engine.results(), Some(Err(DriverError::ProtocolNack { .. }))));
    }

    #[tokio::test]
    async fn test_panicking_request_frees_engine() {
        let engine = PollingEngine::new();
        engine
            .start("read list", async {
                if true {
                    panic!("dealer bug");
                }
                Ok(PollOutput::None)
            })
            .unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), engine.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.operation, "read list");
        assert!(matches!(outcome.result, Err(DriverError::Aborted(_))));
        assert!(!engine.is_busy());

        engine
            .start("write list", async { Ok(PollOutput::Bool(true)) })
            .unwrap();
        let outcome = engine.wait().await.unwrap();
        assert_eq!(outcome.result.unwrap(), PollOutput::Bool(true));
    }

    #[tokio::test]
    async fn test_idle_engine() {
        let engine = PollingEngine::new();
        assert!(engine.results().is_none());
        assert!(engine.wait().await.is_none());
        assert_eq!(engine.nrc(), None);
    }
}
