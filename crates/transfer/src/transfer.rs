//! The contract shared by single-file items and batches.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::types::TransferState;

/// Future returned by [`Transfer::execute`].
pub type TransferFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + 'a>>;

/// A unit of work that moves bytes between this device and a peer.
pub trait Transfer: Send + Sync {
    /// Stable identifier, used to match user-facing cancel actions.
    fn id(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> TransferState;

    /// Requests cancellation. Idempotent, and a no-op once terminal.
    fn cancel(&self);

    /// Runs the transfer to completion.
    ///
    /// Cancelling `cancel` has the same effect as calling [`Transfer::cancel`].
    /// A transfer executes at most once.
    fn execute(&self, cancel: CancellationToken) -> TransferFuture<'_>;
}

/// Identity, state and cancellation shared by every transfer.
///
/// State transitions are atomic: a transfer leaves `Pending` at most once
/// and never leaves a terminal state, whichever of completion, failure or
/// cancellation gets there first.
pub struct TransferCore {
    id: String,
    state: watch::Sender<TransferState>,
    cancel: CancellationToken,
}

impl Default for TransferCore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferCore {
    /// Creates a pending transfer with a random UUID.
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Creates a pending transfer with the given identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TransferState::Pending);
        Self {
            id: id.into(),
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// Waits until the transfer reaches a terminal state and returns it.
    pub async fn wait_finished(&self) -> TransferState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Moves `Pending` to `Active`. Returns `false` from any other state.
    pub fn start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TransferState::Pending {
                *state = TransferState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Moves a non-terminal transfer to the terminal `outcome`.
    ///
    /// Returns `false` if the transfer had already finished.
    pub fn finish(&self, outcome: TransferState) -> bool {
        debug_assert!(outcome.is_terminal());
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = outcome;
                true
            }
        })
    }

    /// Marks the transfer cancelled and trips its token.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        let cancelled = self.finish(TransferState::Cancelled);
        self.cancel.cancel();
        cancelled
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `fut` until it finishes or either this transfer or `external`
    /// is cancelled, whichever happens first.
    pub async fn guard<T, F>(&self, external: &CancellationToken, fut: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, TransferError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = external.cancelled() => Err(TransferError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_core_is_pending_with_uuid() {
        let core = TransferCore::new();
        assert_eq!(core.state(), TransferState::Pending);
        assert!(uuid::Uuid::parse_str(core.id()).is_ok());
        assert_ne!(core.id(), TransferCore::new().id());
    }

    #[test]
    fn start_only_from_pending() {
        let core = TransferCore::new();
        assert!(core.start());
        assert!(!core.start());
        assert_eq!(core.state(), TransferState::Active);
    }

    #[test]
    fn terminal_state_is_final() {
        let core = TransferCore::new();
        core.start();
        assert!(core.finish(TransferState::Complete));
        assert!(!core.finish(TransferState::Failed));
        assert!(!core.cancel());
        assert_eq!(core.state(), TransferState::Complete);
    }

    #[test]
    fn cancel_is_idempotent() {
        let core = TransferCore::new();
        assert!(core.cancel());
        assert!(!core.cancel());
        assert!(core.is_cancelled());
        assert_eq!(core.state(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn guard_stops_on_external_cancel() {
        let core = TransferCore::new();
        let external = CancellationToken::new();
        external.cancel();
        let result = core
            .guard(&external, std::future::pending::<Result<(), TransferError>>())
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn guard_passes_result_through() {
        let core = TransferCore::new();
        let result = core
            .guard(&CancellationToken::new(), async { Ok::<_, TransferError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn wait_finished_observes_transition() {
        let core = std::sync::Arc::new(TransferCore::new());
        let waiter = {
            let core = std::sync::Arc::clone(&core);
            tokio::spawn(async move { core.wait_finished().await })
        };
        tokio::task::yield_now().await;
        core.start();
        core.finish(TransferState::Failed);
        assert_eq!(waiter.await.unwrap(), TransferState::Failed);
    }
}
