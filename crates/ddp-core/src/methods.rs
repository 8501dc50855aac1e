//! Method invocation registry.
//!
//! Every outbound call gets a correlation id from a monotonic counter and is
//! tracked until two independent signals have arrived: the `result` and the
//! data flush (`updated`). They may arrive in either order; the invocation is
//! settled, and released from the registry, once both have.

use crate::callback::Callback;
use crate::error::{DdpError, Result};
use crate::protocol::{Message, ServerError};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Whether the server has answered the call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultState {
    Pending,
    Completed(std::result::Result<Value, ServerError>),
}

/// Whether the data side effects of the call have been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    NotFlushed,
    Flushed,
}

/// Identifying data for an invocation, carried by events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub id: String,
    pub name: String,
    pub params: Vec<Value>,
}

/// Caller completion handler: the authoritative value or the error.
pub type MethodHandler = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Local synchronous approximation of a method.
///
/// Receives the call parameters and returns the tentative result.
pub type MethodStub = std::sync::Arc<dyn Fn(&[Value]) -> Option<Value> + Send + Sync + 'static>;

/// Who is waiting on an invocation, and what settling it means.
#[derive(Debug)]
pub enum Completion {
    /// Ordinary call; the handler gets the server value.
    Caller(Callback<Result<Value>>),
    /// Login through a named method; the result becomes the account.
    Login(Callback<Result<()>>),
    /// Automatic resume login issued after a handshake.
    Resume,
    /// Logout; the account is cleared whatever the outcome.
    Logout(Callback<Result<()>>),
}

impl Completion {
    pub fn role(&self) -> MethodRole {
        match self {
            Completion::Caller(_) => MethodRole::Caller,
            Completion::Login(_) => MethodRole::Login,
            Completion::Resume => MethodRole::Resume,
            Completion::Logout(_) => MethodRole::Logout,
        }
    }
}

/// Discriminant of [`Completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodRole {
    Caller,
    Login,
    Resume,
    Logout,
}

/// Options for a method call.
pub struct CallOptions {
    /// Whether the call may be resent after a transport loss.
    pub retryable: bool,
    pub on_complete: Option<MethodHandler>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retryable: true,
            on_complete: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("retryable", &self.retryable)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// What the caller gets back from `call`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// Correlation id of the invocation.
    pub id: String,
    /// Value returned by the local stub, if one is defined.
    pub tentative: Option<Value>,
}

/// One tracked remote procedure call.
#[derive(Debug)]
pub struct MethodInvocation {
    pub id: u64,
    pub name: String,
    pub params: Vec<Value>,
    pub retryable: bool,
    pub result: ResultState,
    pub flush: FlushState,
    pub tentative: Option<Value>,
    pub completion: Completion,
    /// Whether the `method` frame went out on the current transport epoch.
    sent: bool,
    /// Result arrived on an earlier epoch; flush once the new session is quiescent.
    awaiting_quiescence: bool,
}

impl MethodInvocation {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        params: Vec<Value>,
        retryable: bool,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            params,
            retryable,
            result: ResultState::Pending,
            flush: FlushState::NotFlushed,
            tentative: None,
            completion,
            sent: false,
            awaiting_quiescence: false,
        }
    }

    pub fn with_tentative(mut self, tentative: Option<Value>) -> Self {
        self.tentative = tentative;
        self
    }

    pub fn id_str(&self) -> String {
        self.id.to_string()
    }

    pub fn info(&self) -> MethodInfo {
        MethodInfo {
            id: self.id_str(),
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.result != ResultState::Pending && self.flush == FlushState::Flushed
    }

    fn method_message(&self) -> Message {
        Message::Method {
            id: self.id_str(),
            method: self.name.clone(),
            params: self.params.clone(),
            random_seed: None,
        }
    }
}

/// Result of [`MethodRegistry::record_result`].
#[derive(Debug)]
pub enum ResultOutcome {
    /// No such invocation.
    Unknown,
    /// The invocation already had a result; the new one was ignored.
    Duplicate,
    Recorded {
        info: MethodInfo,
        role: MethodRole,
        outcome: std::result::Result<Value, ServerError>,
        /// The invocation, if this result settled it.
        settled: Option<MethodInvocation>,
    },
}

/// One entry of [`MethodRegistry::record_flush`].
#[derive(Debug)]
pub struct Flushed {
    pub info: MethodInfo,
    pub settled: Option<MethodInvocation>,
}

/// Owner of all in-flight invocations for one client.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    invocations: BTreeMap<u64, MethodInvocation>,
    last_id: u64,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation id.
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Start tracking an invocation.
    ///
    /// Returns the `method` frame to send now when `connected`. An id that is
    /// already tracked is refused; the existing invocation is left untouched.
    pub fn register(
        &mut self,
        mut invocation: MethodInvocation,
        connected: bool,
    ) -> Result<Option<Message>> {
        if self.invocations.contains_key(&invocation.id) {
            return Err(DdpError::DuplicateCorrelation {
                id: invocation.id_str(),
            });
        }
        self.last_id = self.last_id.max(invocation.id);

        let send = if connected {
            invocation.sent = true;
            Some(invocation.method_message())
        } else {
            None
        };
        debug!(id = invocation.id, method = %invocation.name, queued = !connected, "Registered method call");
        self.invocations.insert(invocation.id, invocation);
        Ok(send)
    }

    /// Apply a `result` frame.
    pub fn record_result(
        &mut self,
        id: &str,
        outcome: std::result::Result<Value, ServerError>,
    ) -> ResultOutcome {
        let Some(key) = id.parse::<u64>().ok().filter(|k| self.invocations.contains_key(k))
        else {
            warn!(id = %id, "Result for unknown method call");
            return ResultOutcome::Unknown;
        };
        let Some(invocation) = self.invocations.get_mut(&key) else {
            return ResultOutcome::Unknown;
        };
        if invocation.result != ResultState::Pending {
            warn!(id = %id, method = %invocation.name, "Duplicate result ignored");
            return ResultOutcome::Duplicate;
        }

        invocation.result = ResultState::Completed(outcome.clone());
        let info = invocation.info();
        let role = invocation.completion.role();
        let settled = if invocation.is_settled() {
            self.invocations.remove(&key)
        } else {
            None
        };

        ResultOutcome::Recorded {
            info,
            role,
            outcome,
            settled,
        }
    }

    /// Apply an `updated` frame.
    pub fn record_flush(&mut self, ids: &[String]) -> Vec<Flushed> {
        let mut flushed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(key) = id.parse::<u64>().ok().filter(|k| self.invocations.contains_key(k))
            else {
                warn!(id = %id, "Data flush for unknown method call");
                continue;
            };
            let Some(invocation) = self.invocations.get_mut(&key) else {
                continue;
            };
            if invocation.flush == FlushState::Flushed {
                continue;
            }
            invocation.flush = FlushState::Flushed;
            let info = invocation.info();
            let settled = if invocation.is_settled() {
                self.invocations.remove(&key)
            } else {
                None
            };
            flushed.push(Flushed { info, settled });
        }
        flushed
    }

    /// The transport epoch ended.
    ///
    /// Non-retryable calls that were on the wire without a result are removed
    /// and returned for the caller to fail. Calls with a result but no flush
    /// are parked until the next session is quiescent.
    pub fn epoch_ended(&mut self) -> Vec<MethodInvocation> {
        let mut failed = Vec::new();
        for invocation in self.invocations.values_mut() {
            match invocation.result {
                ResultState::Pending => {
                    if invocation.sent && !invocation.retryable {
                        failed.push(invocation.id);
                    }
                }
                ResultState::Completed(_) => {
                    if invocation.flush == FlushState::NotFlushed {
                        invocation.awaiting_quiescence = true;
                    }
                }
            }
            invocation.sent = false;
        }
        failed
            .into_iter()
            .filter_map(|id| self.invocations.remove(&id))
            .collect()
    }

    /// Frames to resend after a handshake: every call still waiting on its
    /// result that is not yet on the wire, in id order.
    pub fn replay(&mut self) -> Vec<Message> {
        self.invocations
            .values_mut()
            .filter(|inv| inv.result == ResultState::Pending && !inv.sent)
            .map(|inv| {
                inv.sent = true;
                inv.method_message()
            })
            .collect()
    }

    /// Flush every call parked by [`epoch_ended`](Self::epoch_ended).
    ///
    /// Returns the flushed invocations; all of them are settled.
    pub fn take_quiescent(&mut self) -> Vec<MethodInvocation> {
        let parked: Vec<u64> = self
            .invocations
            .values()
            .filter(|inv| inv.awaiting_quiescence)
            .map(|inv| inv.id)
            .collect();
        parked
            .into_iter()
            .filter_map(|id| self.invocations.remove(&id))
            .map(|mut inv| {
                inv.flush = FlushState::Flushed;
                inv.awaiting_quiescence = false;
                inv
            })
            .collect()
    }

    pub fn has_parked(&self) -> bool {
        self.invocations.values().any(|inv| inv.awaiting_quiescence)
    }

    pub fn get(&self, id: u64) -> Option<&MethodInvocation> {
        self.invocations.get(&id)
    }

    /// Whether a call with this role is still waiting on its result.
    pub fn has_pending_role(&self, role: MethodRole) -> bool {
        self.invocations
            .values()
            .any(|inv| inv.completion.role() == role && inv.result == ResultState::Pending)
    }

    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }
}
