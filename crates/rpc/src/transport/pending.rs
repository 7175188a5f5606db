//! Correlation of in-flight requests with their responses.
//!
//! A [`PendingRequest`] moves from `Pending` to exactly one terminal state.
//! The caller holds the [`Completion`] half and awaits it; the connection's
//! [`PendingRequestRegistry`] holds the request itself and resolves it when
//! a response with its id arrives. Reaching a terminal state removes the
//! request from the registry it was registered with.

use crate::dispatch::DispatchEntry;
use crate::error::{Error, Result, TransportError};
use crate::protocol::{TypeDesc, Value};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-wide request id. Ids are never reused.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a [`PendingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for a response.
    Pending,
    /// A result arrived.
    Resolved,
    /// An error arrived or the connection failed.
    Failed,
    /// The caller gave up.
    Cancelled,
}

impl RequestState {
    /// Returns `true` for every state but `Pending`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A transition was attempted on a request that already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Request already terminal: {0:?}")]
pub struct AlreadyTerminal(pub RequestState);

type Outcome = Result<Value>;
type TerminalHook = Box<dyn FnOnce(u64) + Send>;

struct Slot {
    state: RequestState,
    sender: Option<oneshot::Sender<Outcome>>,
    on_terminal: Option<TerminalHook>,
}

/// A single in-flight call.
pub struct PendingRequest {
    id: u64,
    method: Arc<DispatchEntry>,
    slot: Mutex<Slot>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("method", &self.method.wire_name())
            .field("state", &self.state())
            .finish()
    }
}

impl PendingRequest {
    /// New request for `method` with a fresh id.
    #[must_use]
    pub fn new(method: Arc<DispatchEntry>) -> (Arc<Self>, Completion) {
        Self::with_id(next_request_id(), method)
    }

    pub(crate) fn with_id(id: u64, method: Arc<DispatchEntry>) -> (Arc<Self>, Completion) {
        let (sender, receiver) = oneshot::channel();
        let request = Arc::new(Self {
            id,
            method,
            slot: Mutex::new(Slot {
                state: RequestState::Pending,
                sender: Some(sender),
                on_terminal: None,
            }),
        });
        (request, Completion { id, receiver })
    }

    /// Correlation id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Target method.
    #[must_use]
    pub const fn method(&self) -> &Arc<DispatchEntry> {
        &self.method
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.slot.lock().state
    }

    /// Completes with a result.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyTerminal`] if the request already finished.
    pub fn resolve(&self, value: Value) -> std::result::Result<(), AlreadyTerminal> {
        self.finish(RequestState::Resolved, Ok(value))
    }

    /// Completes with an error.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyTerminal`] if the request already finished.
    pub fn fail(&self, error: Error) -> std::result::Result<(), AlreadyTerminal> {
        self.finish(RequestState::Failed, Err(error))
    }

    /// Gives up on the request. Bytes already written stay written.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyTerminal`] if the request already finished.
    pub fn cancel(&self) -> std::result::Result<(), AlreadyTerminal> {
        self.finish(RequestState::Cancelled, Err(Error::Cancelled))
    }

    fn finish(&self, state: RequestState, outcome: Outcome) -> std::result::Result<(), AlreadyTerminal> {
        let (sender, hook) = {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return Err(AlreadyTerminal(slot.state));
            }
            slot.state = state;
            (slot.sender.take(), slot.on_terminal.take())
        };

        if let Some(sender) = sender {
            // The caller may have stopped waiting.
            let _ = sender.send(outcome);
        }
        if let Some(hook) = hook {
            hook(self.id);
        }
        Ok(())
    }

    /// Installs the hook run on the terminal transition. Returns `false`,
    /// without installing it, if the request already finished.
    fn on_terminal(&self, hook: TerminalHook) -> bool {
        let mut slot = self.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        slot.on_terminal = Some(hook);
        true
    }
}

/// The caller's half of a [`PendingRequest`].
#[derive(Debug)]
pub struct Completion {
    id: u64,
    receiver: oneshot::Receiver<Outcome>,
}

impl Completion {
    /// Id of the request this completes.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the terminal transition.
    ///
    /// # Errors
    ///
    /// Returns the error the request failed with, [`Error::Cancelled`] if it
    /// was cancelled, or an internal error if it was dropped unfinished.
    pub async fn wait(self) -> Result<Value> {
        self.receiver.await.unwrap_or_else(|_| {
            Err(Error::Internal(format!(
                "request {} dropped without completing",
                self.id
            )))
        })
    }
}

/// In-flight requests on one connection.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    requests: Arc<DashMap<u64, Arc<PendingRequest>>>,
    closed: Mutex<Option<Error>>,
}

impl PendingRequestRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `request` until it reaches a terminal state. Returns `false`
    /// if a request with the same id is already registered.
    ///
    /// Registering on a closed registry fails the request right away with
    /// the error the registry was closed with.
    pub fn register(&self, request: &Arc<PendingRequest>) -> bool {
        match self.requests.entry(request.id()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(request));
            }
        }

        let requests: Weak<DashMap<u64, Arc<PendingRequest>>> = Arc::downgrade(&self.requests);
        let installed = request.on_terminal(Box::new(move |id| {
            if let Some(requests) = requests.upgrade() {
                requests.remove(&id);
            }
        }));
        if !installed {
            self.requests.remove(&request.id());
            return true;
        }

        let closed = self.closed.lock().clone();
        if let Some(error) = closed {
            let _ = request.fail(error);
        }
        true
    }

    /// The pending request with `id`, if any.
    #[must_use]
    pub fn resolve(&self, id: u64) -> Option<Arc<PendingRequest>> {
        self.requests.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Declared return type of the pending request with `id`.
    #[must_use]
    pub fn return_type(&self, id: u64) -> Option<TypeDesc> {
        self.requests
            .get(&id)
            .map(|entry| entry.method().signature().return_type().clone())
    }

    /// Fails every pending request with `error`. Returns how many failed.
    pub fn fail_all(&self, error: &Error) -> usize {
        let requests: Vec<Arc<PendingRequest>> = self
            .requests
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let failed = requests
            .into_iter()
            .filter(|request| request.fail(error.clone()).is_ok())
            .count();
        if failed > 0 {
            debug!(failed, error = %error, "Failed pending requests");
        }
        failed
    }

    /// Rejects future registrations and fails every pending request.
    pub fn close(&self, error: &Error) -> usize {
        self.closed.lock().get_or_insert_with(|| error.clone());
        self.fail_all(error)
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

pub(crate) fn closed_error() -> Error {
    TransportError::Closed.into()
}
