//! Drives a batch one item at a time and bounds the wait for late files.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;
use crate::batch::{Batch, Step};
use crate::transfer::Transfer;

/// Single-shot timer that can be re-armed before it fires.
///
/// Re-arming moves the deadline to `now + duration`; a disarmed timer never
/// fires.
pub(crate) struct DrainTimer {
    duration: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl DrainTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            sleep: None,
        }
    }

    pub fn arm(&mut self) {
        let deadline = Instant::now() + self.duration;
        match &mut self.sleep {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    pub fn disarm(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Completes when the armed deadline passes; pends forever if disarmed.
    pub async fn expired(&mut self) {
        match &mut self.sleep {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}

/// Executes admitted items strictly in order.
///
/// When every admitted item has run but the batch still expects files, the
/// sequencer waits for an admission, re-arming the drain timer whenever the
/// batch is revised. It owns the timer, so the timer cannot outlive the run.
pub(crate) struct Sequencer<'a> {
    batch: &'a Batch,
    timer: DrainTimer,
    armed_revision: Option<u64>,
}

impl<'a> Sequencer<'a> {
    pub fn new(batch: &'a Batch, timeout: Duration) -> Self {
        Self {
            batch,
            timer: DrainTimer::new(timeout),
            armed_revision: None,
        }
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), TransferError> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            match self.batch.next_step() {
                Step::Execute { index, item } => {
                    self.disarm();
                    debug!(batch = %self.batch.id(), index, file = %item.filename(), "executing item");
                    let result = item.execute(cancel.clone()).await;
                    self.batch.item_finished(index, &item, &result);
                    result?;
                }
                Step::AwaitFiles { revision, missing } => {
                    if self.armed_revision != Some(revision) {
                        self.timer.arm();
                        self.armed_revision = Some(revision);
                        debug!(
                            batch = %self.batch.id(),
                            missing,
                            timeout_ms = self.batch.config().operation_timeout_ms,
                            "waiting for announced files"
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = self.batch.admitted() => {}
                        _ = self.timer.expired() => self.batch.expire(revision)?,
                    }
                }
                Step::AwaitAdmission => {
                    self.disarm();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = self.batch.admitted() => {}
                    }
                }
                Step::Done => return Ok(()),
            }
        }
    }

    fn disarm(&mut self) {
        self.timer.disarm();
        self.armed_revision = None;
    }
}
