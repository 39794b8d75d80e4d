//! Client-side tracking of one invocation from send to retire.
//!
//! An invocation moves through the stages sent, received, resolved (result
//! or failure), completed and retired, in that order. Each stage is entered
//! at most once; a signal that arrives late or twice (for example a
//! completion replayed by a new active after fail-over) is dropped. Callers
//! choose which stages they want to hear about with an [`EnumSet`] of
//! [`Signal`]s.

use crate::error::PassthroughError;
use enumset::{EnumSet, EnumSetType};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A lifecycle notification an invocation callback can ask for.
#[derive(Debug, Hash, EnumSetType)]
pub enum Signal {
    Sent,
    Received,
    Result,
    Failure,
    Complete,
    Retired,
}

/// Receives the signals of one invocation. Every method defaults to doing
/// nothing. Calls happen on the connection's delivery task, never on a server.
pub trait InvocationCallback: Send {
    fn sent(&mut self) {}

    fn received(&mut self) {}

    fn result(&mut self, _response: Vec<u8>) {}

    fn failure(&mut self, _error: PassthroughError) {}

    fn complete(&mut self) {}

    fn retired(&mut self) {}
}

/// Returned by `invoke`. Holds no resources: dropping it cancels nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationTask {
    transaction_id: u64,
}

impl InvocationTask {
    pub(crate) fn new(transaction_id: u64) -> Self {
        Self { transaction_id }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Created,
    Sent,
    Received,
    Resolved,
    Completed,
    Retired,
}

struct RecordState {
    stage: Stage,
    signals: EnumSet<Signal>,
    callback: Box<dyn InvocationCallback>,
}

/// An in-flight invocation: the encoded request, kept for resends, and its
/// callback.
pub(crate) struct InvocationRecord {
    bytes: Vec<u8>,
    state: Mutex<RecordState>,
}

impl InvocationRecord {
    pub(crate) fn new(bytes: Vec<u8>, callback: Box<dyn InvocationCallback>, signals: EnumSet<Signal>) -> Self {
        Self {
            bytes,
            state: Mutex::new(RecordState {
                stage: Stage::Created,
                signals,
                callback,
            }),
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn sent(&self) {
        self.advance(Stage::Sent, Signal::Sent, |callback| callback.sent());
    }

    pub(crate) fn received(&self) {
        self.advance(Stage::Received, Signal::Received, |callback| callback.received());
    }

    pub(crate) fn result(&self, response: Vec<u8>) {
        self.advance(Stage::Resolved, Signal::Result, move |callback| callback.result(response));
    }

    pub(crate) fn failure(&self, error: PassthroughError) {
        self.advance(Stage::Resolved, Signal::Failure, move |callback| callback.failure(error));
    }

    pub(crate) fn complete(&self) {
        self.advance(Stage::Completed, Signal::Complete, |callback| callback.complete());
    }

    pub(crate) fn retired(&self) {
        self.advance(Stage::Retired, Signal::Retired, |callback| callback.retired());
    }

    /// Moves to `stage` if it is later than the current one, firing the
    /// callback when `signal` was requested.
    fn advance(&self, stage: Stage, signal: Signal, fire: impl FnOnce(&mut dyn InvocationCallback)) -> bool {
        let mut state = self.state.lock();
        if stage <= state.stage {
            return false;
        }
        state.stage = stage;
        if state.signals.contains(signal) {
            fire(state.callback.as_mut());
        }
        true
    }
}

/// Callback that hands the outcome to a waiting task once the invocation
/// retires.
pub(crate) struct RetireWaiter {
    outcome: Option<Result<Vec<u8>, PassthroughError>>,
    done: Option<oneshot::Sender<Result<Vec<u8>, PassthroughError>>>,
}

impl RetireWaiter {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<Vec<u8>, PassthroughError>>) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                outcome: None,
                done: Some(done),
            },
            rx,
        )
    }

    pub(crate) fn signals() -> EnumSet<Signal> {
        Signal::Result | Signal::Failure | Signal::Retired
    }
}

impl InvocationCallback for RetireWaiter {
    fn result(&mut self, response: Vec<u8>) {
        self.outcome = Some(Ok(response));
    }

    fn failure(&mut self, error: PassthroughError) {
        self.outcome = Some(Err(error));
    }

    fn retired(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(PassthroughError::IllegalState {
                reason: "invocation retired without a result".to_string(),
            })
        });
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}
