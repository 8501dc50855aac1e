//! Subscription registry.
//!
//! Tracks the subscriptions the client wants against what the server has
//! acknowledged. Identical `(name, params)` requests are coalesced: while a
//! subscription is live (`Pending` or `Ready`) every further `add` with the
//! same key joins it as another handle, sharing its correlation id and its
//! single `sub` frame. `unsub` is only sent once the last handle is removed.
//!
//! Entries survive transport loss. On every handshake the live ones are
//! replayed with their original ids.

use crate::callback::Callback;
use crate::error::{DdpError, Result};
use crate::protocol::{Message, ServerError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionState {
    Pending,
    Ready,
    Error(ServerError),
    Stopped,
}

impl SubscriptionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionState::Pending | SubscriptionState::Ready)
    }
}

/// Identifying data for a subscription, carried by events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub name: String,
    pub params: Vec<Value>,
}

/// Completion handler for a subscription handle: `Ok` on ready, `Err` on server error.
pub type SubscriptionHandler = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Caller-held observer of a subscription.
///
/// Dropping a handle does not unsubscribe; pass it to `unsubscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    handle_id: u64,
    id: String,
    name: String,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    /// Handle identity; distinct for every `add`, even when coalesced.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Correlation id shared with the server.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state of the underlying subscription.
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == SubscriptionState::Ready
    }

    /// Wait until the subscription leaves `Pending`.
    ///
    /// Resolves `Ok` once ready, or with the server error. A subscription that
    /// is stopped (by the caller or the server) before becoming ready resolves
    /// with [`DdpError::SubscriptionStopped`]; one still pending when the
    /// client shuts down resolves with [`DdpError::ClientClosed`].
    pub async fn ready(&mut self) -> Result<()> {
        loop {
            let state = self.state.borrow_and_update().clone();
            if let Some(outcome) = self.settled(state) {
                return outcome;
            }
            if self.state.changed().await.is_err() {
                let state = self.state.borrow().clone();
                return self.settled(state).unwrap_or(Err(DdpError::ClientClosed));
            }
        }
    }

    fn settled(&self, state: SubscriptionState) -> Option<Result<()>> {
        match state {
            SubscriptionState::Ready => Some(Ok(())),
            SubscriptionState::Error(err) => Some(Err(DdpError::Server(err))),
            SubscriptionState::Stopped => Some(Err(DdpError::SubscriptionStopped {
                id: self.id.clone(),
            })),
            SubscriptionState::Pending => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    name: String,
    params: String,
}

impl SubscriptionKey {
    fn new(name: &str, params: &[Value]) -> Self {
        // serde_json objects are key-sorted, so the encoding is canonical
        let params = serde_json::to_string(params).unwrap_or_default();
        Self {
            name: name.to_string(),
            params,
        }
    }
}

struct Subscription {
    id: String,
    name: String,
    params: Vec<Value>,
    key: SubscriptionKey,
    seq: u64,
    state: SubscriptionState,
    /// Whether `sub` went out on the current transport epoch.
    sent: bool,
    /// Ready on an earlier session and resent on this one; the new server
    /// session has not acknowledged it yet.
    reviving: bool,
    handles: BTreeMap<u64, Callback<Result<()>>>,
    state_tx: watch::Sender<SubscriptionState>,
}

impl Subscription {
    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }

    fn sub_message(&self) -> Message {
        Message::Sub {
            id: self.id.clone(),
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }

    fn set_state(&mut self, state: SubscriptionState) {
        self.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn fire_all(&mut self, outcome: Result<()>, violations: &mut Vec<DdpError>) {
        for callback in self.handles.values_mut() {
            if callback.has_fired() {
                continue;
            }
            if let Err(e) = callback.fire(&self.id, outcome.clone()) {
                violations.push(e);
            }
        }
    }
}

/// Result of [`SubscriptionRegistry::add`].
pub struct AddOutcome {
    pub handle: SubscriptionHandle,
    pub info: SubscriptionInfo,
    /// True if a new server-side subscription was created.
    pub created: bool,
    /// Frame to send now, if connected.
    pub send: Option<Message>,
}

/// Result of [`SubscriptionRegistry::remove`].
#[derive(Debug, PartialEq)]
pub enum RemoveOutcome {
    /// Unknown handle, or other handles still hold the subscription.
    Retained,
    /// Last handle gone; nothing was on the wire so it was forgotten.
    Released(SubscriptionInfo),
    /// Last handle gone; send this `unsub` and wait for `nosub`.
    Unsubscribe(SubscriptionInfo, Message),
}

/// Result of [`SubscriptionRegistry::mark_nosub`].
#[derive(Debug, PartialEq)]
pub enum NosubOutcome {
    Unknown,
    Errored(SubscriptionInfo, ServerError),
    Stopped(SubscriptionInfo),
}

/// Owner of all subscriptions for one client.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: HashMap<String, Subscription>,
    by_key: HashMap<SubscriptionKey, String>,
    handles: HashMap<u64, String>,
    next_handle: u64,
    next_seq: u64,
    violations: Vec<DdpError>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `name(params)`.
    pub fn add(
        &mut self,
        name: &str,
        params: Vec<Value>,
        handler: Option<SubscriptionHandler>,
        connected: bool,
    ) -> AddOutcome {
        self.next_handle += 1;
        let handle_id = self.next_handle;
        let key = SubscriptionKey::new(name, &params);
        let mut callback = Callback::from_option(handler);

        if let Some(sub) = self
            .by_key
            .get(&key)
            .and_then(|id| self.subs.get_mut(id))
            .filter(|sub| sub.state.is_live())
        {
            debug!(id = %sub.id, name = %name, refs = sub.handles.len() + 1, "Coalescing subscription");
            if sub.state == SubscriptionState::Ready {
                if let Err(e) = callback.fire(&sub.id, Ok(())) {
                    self.violations.push(e);
                }
            }
            sub.handles.insert(handle_id, callback);
            self.handles.insert(handle_id, sub.id.clone());
            return AddOutcome {
                handle: SubscriptionHandle {
                    handle_id,
                    id: sub.id.clone(),
                    name: sub.name.clone(),
                    state: sub.state_tx.subscribe(),
                },
                info: sub.info(),
                created: false,
                send: None,
            };
        }

        self.next_seq += 1;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Pending);
        let mut handles = BTreeMap::new();
        handles.insert(handle_id, callback);

        let mut sub = Subscription {
            id: id.clone(),
            name: name.to_string(),
            params,
            key: key.clone(),
            seq: self.next_seq,
            state: SubscriptionState::Pending,
            sent: false,
            reviving: false,
            handles,
            state_tx,
        };
        let send = if connected {
            sub.sent = true;
            Some(sub.sub_message())
        } else {
            None
        };
        let info = sub.info();

        self.by_key.insert(key, id.clone());
        self.handles.insert(handle_id, id.clone());
        self.subs.insert(id.clone(), sub);

        AddOutcome {
            handle: SubscriptionHandle {
                handle_id,
                id,
                name: name.to_string(),
                state: state_rx,
            },
            info,
            created: true,
            send,
        }
    }

    /// Drop one handle's interest.
    pub fn remove(&mut self, handle_id: u64) -> RemoveOutcome {
        let Some(id) = self.handles.remove(&handle_id) else {
            debug!(handle_id, "Unsubscribe for unknown handle");
            return RemoveOutcome::Retained;
        };
        let Some(sub) = self.subs.get_mut(&id) else {
            return RemoveOutcome::Retained;
        };
        sub.handles.remove(&handle_id);
        if !sub.handles.is_empty() {
            return RemoveOutcome::Retained;
        }

        let info = sub.info();
        if self.by_key.get(&sub.key) == Some(&id) {
            self.by_key.remove(&sub.key);
        }

        if sub.state.is_live() && sub.sent {
            sub.set_state(SubscriptionState::Stopped);
            return RemoveOutcome::Unsubscribe(info, Message::Unsub { id });
        }

        if let Some(mut sub) = self.subs.remove(&id) {
            if sub.state.is_live() {
                sub.set_state(SubscriptionState::Stopped);
            }
        }
        RemoveOutcome::Released(info)
    }

    /// Apply a `ready` frame. Returns the subscriptions that became ready.
    ///
    /// A resent subscription that was already ready is only acknowledged;
    /// its handles have fired and it is not reported again.
    pub fn mark_ready(&mut self, ids: &[String]) -> Vec<SubscriptionInfo> {
        let mut ready = Vec::new();
        for id in ids {
            let Some(sub) = self.subs.get_mut(id) else {
                warn!(id = %id, "Ready for unknown subscription");
                continue;
            };
            if sub.reviving {
                debug!(id = %id, "Resent subscription ready again");
                sub.reviving = false;
            }
            if sub.state != SubscriptionState::Pending {
                continue;
            }
            sub.set_state(SubscriptionState::Ready);
            sub.fire_all(Ok(()), &mut self.violations);
            ready.push(sub.info());
        }
        ready
    }

    /// Apply a `nosub` frame.
    pub fn mark_nosub(&mut self, id: &str, error: Option<ServerError>) -> NosubOutcome {
        let Some(sub) = self.subs.get_mut(id) else {
            warn!(id = %id, "Nosub for unknown subscription");
            return NosubOutcome::Unknown;
        };
        if self.by_key.get(&sub.key).map(String::as_str) == Some(id) {
            self.by_key.remove(&sub.key);
        }
        let info = sub.info();

        sub.reviving = false;
        match error {
            Some(err) if sub.state.is_live() => {
                sub.set_state(SubscriptionState::Error(err.clone()));
                sub.fire_all(Err(DdpError::Server(err.clone())), &mut self.violations);
                if sub.handles.is_empty() {
                    self.subs.remove(id);
                }
                NosubOutcome::Errored(info, err)
            }
            _ => {
                if let Some(mut sub) = self.subs.remove(id) {
                    sub.set_state(SubscriptionState::Stopped);
                    for handle_id in sub.handles.keys() {
                        self.handles.remove(handle_id);
                    }
                }
                NosubOutcome::Stopped(info)
            }
        }
    }

    /// The transport epoch ended; nothing is on the wire any more.
    pub fn epoch_ended(&mut self) {
        for sub in self.subs.values_mut() {
            sub.sent = false;
        }
    }

    /// Frames to send after a successful handshake.
    ///
    /// Entries waiting for a stop acknowledgment are released, since the new
    /// server session never knew them. Live entries are resent in creation
    /// order with their original ids; the ones that were already ready count
    /// against quiescence until the new session acknowledges them.
    pub fn replay(&mut self) -> Vec<Message> {
        let stopped: Vec<String> = self
            .subs
            .values()
            .filter(|s| s.state == SubscriptionState::Stopped)
            .map(|s| s.id.clone())
            .collect();
        for id in stopped {
            self.subs.remove(&id);
        }

        let mut live: Vec<&mut Subscription> = self
            .subs
            .values_mut()
            .filter(|s| s.state.is_live() && !s.sent)
            .collect();
        live.sort_by_key(|s| s.seq);
        live.into_iter()
            .map(|s| {
                s.sent = true;
                s.reviving = s.state == SubscriptionState::Ready;
                s.sub_message()
            })
            .collect()
    }

    /// True when no subscription is waiting for `ready`, including resent
    /// ones the current session has not acknowledged.
    pub fn is_quiescent(&self) -> bool {
        !self.subs.values().any(|s| match s.state {
            SubscriptionState::Pending => true,
            SubscriptionState::Ready => s.reviving,
            _ => false,
        })
    }

    pub fn state(&self, id: &str) -> Option<SubscriptionState> {
        self.subs.get(id).map(|s| s.state.clone())
    }

    /// Number of caller handles attached to subscription `id`.
    pub fn ref_count(&self, id: &str) -> usize {
        self.subs.get(id).map(|s| s.handles.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Invariant violations recorded since the last call.
    pub fn take_violations(&mut self) -> Vec<DdpError> {
        std::mem::take(&mut self.violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<Result<()>>>>, SubscriptionHandler) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        (calls, Box::new(move |r| c.lock().unwrap().push(r)))
    }

    #[test]
    fn test_add_while_offline_sends_nothing() {
        let mut reg = SubscriptionRegistry::new();
        let out = reg.add("posts", vec![], None, false);
        assert!(out.created);
        assert!(out.send.is_none());
        assert_eq!(out.handle.state(), SubscriptionState::Pending);
    }

    #[test]
    fn test_add_while_connected_sends_sub() {
        let mut reg = SubscriptionRegistry::new();
        let out = reg.add("posts", vec![json!(5)], None, true);
        assert_eq!(
            out.send,
            Some(Message::Sub {
                id: out.handle.id().to_string(),
                name: "posts".to_string(),
                params: vec![json!(5)],
            })
        );
    }

    #[test]
    fn test_identical_adds_coalesce() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("posts", vec![json!({"limit": 10})], None, true);
        let b = reg.add("posts", vec![json!({"limit": 10})], None, true);
        assert!(a.created);
        assert!(!b.created);
        assert!(b.send.is_none());
        assert_eq!(a.handle.id(), b.handle.id());
        assert_ne!(a.handle.handle_id(), b.handle.handle_id());
        assert_eq!(reg.ref_count(a.handle.id()), 2);

        let c = reg.add("posts", vec![json!({"limit": 20})], None, true);
        assert!(c.created);
        assert_ne!(a.handle.id(), c.handle.id());
    }

    #[test]
    fn test_unsub_only_after_last_handle() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("posts", vec![], None, true);
        let b = reg.add("posts", vec![], None, true);
        let id = a.handle.id().to_string();

        assert_eq!(reg.remove(a.handle.handle_id()), RemoveOutcome::Retained);
        match reg.remove(b.handle.handle_id()) {
            RemoveOutcome::Unsubscribe(info, msg) => {
                assert_eq!(info.id, id);
                assert_eq!(msg, Message::Unsub { id: id.clone() });
            }
            other => panic!("Expected unsubscribe, got {:?}", other),
        }
        assert_eq!(reg.state(&id), Some(SubscriptionState::Stopped));
        assert_eq!(b.handle.state(), SubscriptionState::Stopped);

        // Bookkeeping is kept until the stop acknowledgment
        assert_eq!(reg.mark_nosub(&id, None), NosubOutcome::Stopped(info_for(&id)));
        assert!(reg.is_empty());
    }

    fn info_for(id: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            id: id.to_string(),
            name: "posts".to_string(),
            params: vec![],
        }
    }

    #[test]
    fn test_remove_unsent_is_released_immediately() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("posts", vec![], None, false);
        assert!(matches!(reg.remove(a.handle.handle_id()), RemoveOutcome::Released(_)));
        assert!(reg.is_empty());
        assert_eq!(a.handle.state(), SubscriptionState::Stopped);
    }

    #[test]
    fn test_add_after_stop_creates_fresh_subscription() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("posts", vec![], None, true);
        reg.remove(a.handle.handle_id());
        let b = reg.add("posts", vec![], None, true);
        assert!(b.created);
        assert_ne!(a.handle.id(), b.handle.id());
    }

    #[test]
    fn test_ready_fires_each_handle_once() {
        let mut reg = SubscriptionRegistry::new();
        let (calls_a, handler_a) = recorder();
        let (calls_b, handler_b) = recorder();
        let a = reg.add("posts", vec![], Some(handler_a), true);
        reg.add("posts", vec![], Some(handler_b), true);

        let id = a.handle.id().to_string();
        let ready = reg.mark_ready(&[id.clone()]);
        assert_eq!(ready.len(), 1);
        // A repeated ready changes nothing
        assert!(reg.mark_ready(&[id.clone()]).is_empty());

        assert_eq!(calls_a.lock().unwrap().len(), 1);
        assert_eq!(calls_b.lock().unwrap().len(), 1);
        assert!(calls_a.lock().unwrap()[0].is_ok());
        assert!(a.handle.is_ready());
    }

    #[test]
    fn test_join_ready_subscription_fires_immediately() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("posts", vec![], None, true);
        reg.mark_ready(&[a.handle.id().to_string()]);

        let (calls, handler) = recorder();
        let b = reg.add("posts", vec![], Some(handler), true);
        assert!(!b.created);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_nosub_error_fires_with_server_error() {
        let mut reg = SubscriptionRegistry::new();
        let (calls, handler) = recorder();
        let a = reg.add("secret", vec![], Some(handler), true);
        let id = a.handle.id().to_string();
        let err = ServerError::new(403, "Forbidden");

        match reg.mark_nosub(&id, Some(err.clone())) {
            NosubOutcome::Errored(info, e) => {
                assert_eq!(info.id, id);
                assert_eq!(e, err);
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(a.handle.state(), SubscriptionState::Error(err.clone()));
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[Err(DdpError::Server(err))]
        );

        // A failed subscription is not coalesced with new requests
        let b = reg.add("secret", vec![], None, true);
        assert!(b.created);
    }

    #[test]
    fn test_error_after_ready_does_not_refire() {
        let mut reg = SubscriptionRegistry::new();
        let (calls, handler) = recorder();
        let a = reg.add("posts", vec![], Some(handler), true);
        let id = a.handle.id().to_string();
        reg.mark_ready(&[id.clone()]);
        reg.mark_nosub(&id, Some(ServerError::new(500, "Internal")));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(reg.take_violations().is_empty());
    }

    #[test]
    fn test_replay_resends_live_in_order_and_drops_stopped() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("a", vec![], None, true);
        let b = reg.add("b", vec![], None, true);
        let c = reg.add("c", vec![], None, true);
        reg.mark_ready(&[b.handle.id().to_string()]);
        reg.remove(c.handle.handle_id());

        reg.epoch_ended();
        let frames = reg.replay();
        let ids: Vec<String> = frames
            .iter()
            .map(|m| match m {
                Message::Sub { id, .. } => id.clone(),
                other => panic!("Expected sub, got {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![a.handle.id().to_string(), b.handle.id().to_string()]);
        assert_eq!(reg.len(), 2);

        // Nothing left to replay on the same epoch
        assert!(reg.replay().is_empty());
    }

    #[test]
    fn test_quiescence() {
        let mut reg = SubscriptionRegistry::new();
        assert!(reg.is_quiescent());
        let a = reg.add("a", vec![], None, true);
        assert!(!reg.is_quiescent());
        reg.mark_ready(&[a.handle.id().to_string()]);
        assert!(reg.is_quiescent());
    }

    #[test]
    fn test_resent_ready_subscription_blocks_quiescence() {
        let mut reg = SubscriptionRegistry::new();
        let (calls, handler) = recorder();
        let a = reg.add("a", vec![], Some(handler), true);
        let id = a.handle.id().to_string();
        reg.mark_ready(&[id.clone()]);
        assert!(reg.is_quiescent());

        reg.epoch_ended();
        assert_eq!(reg.replay().len(), 1);
        assert!(!reg.is_quiescent());
        // Still ready from the caller's point of view
        assert_eq!(a.handle.state(), SubscriptionState::Ready);

        assert!(reg.mark_ready(&[id]).is_empty());
        assert!(reg.is_quiescent());
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(reg.take_violations().is_empty());
    }

    #[test]
    fn test_resent_subscription_error_ends_revival() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("a", vec![], None, true);
        let id = a.handle.id().to_string();
        reg.mark_ready(&[id.clone()]);
        reg.epoch_ended();
        reg.replay();

        reg.mark_nosub(&id, Some(ServerError::new(403, "Forbidden")));
        assert!(reg.is_quiescent());
    }

    #[tokio::test]
    async fn test_ready_on_stopped_subscription_reports_stop() {
        let mut reg = SubscriptionRegistry::new();
        let out = reg.add("posts", vec![], None, true);
        let mut handle = out.handle.clone();
        let id = out.handle.id().to_string();

        let waiter = tokio::spawn(async move { handle.ready().await });
        tokio::task::yield_now().await;
        assert_eq!(
            reg.mark_nosub(&id, None),
            NosubOutcome::Stopped(info_for(&id))
        );
        assert_eq!(
            waiter.await.unwrap(),
            Err(DdpError::SubscriptionStopped { id })
        );
    }

    #[tokio::test]
    async fn test_handle_ready_future() {
        let mut reg = SubscriptionRegistry::new();
        let out = reg.add("posts", vec![], None, true);
        let mut handle = out.handle.clone();
        let id = out.handle.id().to_string();

        let waiter = tokio::spawn(async move { handle.ready().await });
        tokio::task::yield_now().await;
        reg.mark_ready(&[id]);
        assert!(waiter.await.unwrap().is_ok());
    }
}
