//! Async client.
//!
//! [`Client`] is a cheap, cloneable handle. The session itself is an
//! [`Engine`] owned by a background driver task; API calls reach it over a
//! command channel, and replies come back on oneshot channels. The driver
//! owns the transport, the reconnection deadline, and the heartbeat interval,
//! and carries out whatever [`Action`]s the engine asks for.
//!
//! Every transport is tagged with a generation. Closing or replacing the
//! transport bumps the generation, so an open that completes after it was
//! superseded is dropped.

use crate::account::{Account, AccountHandler, AccountSnapshot};
use crate::codec::{Codec, JsonCodec};
use crate::config::ClientConfig;
use crate::connection::ConnectionStatus;
use crate::engine::{Action, Engine};
use crate::error::{DdpError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::methods::{CallOptions, MethodCall, MethodStub};
use crate::subscriptions::{SubscriptionHandle, SubscriptionHandler};
use crate::transport::{Connector, TransportEvent, TransportLink};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

// ── Commands ────────────────────────────────────────────────────────────────

enum Command {
    Connect,
    Disconnect,
    Subscribe {
        name: String,
        params: Vec<Value>,
        handler: Option<SubscriptionHandler>,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe {
        handle_id: u64,
    },
    NetworkReachable(bool),
    Call {
        name: String,
        params: Vec<Value>,
        options: CallOptions,
        tentative: Option<Value>,
        reply: oneshot::Sender<Result<MethodCall>>,
    },
    Login {
        method: String,
        params: Vec<Value>,
        handler: Option<AccountHandler>,
        reply: oneshot::Sender<Result<MethodCall>>,
    },
    Logout {
        handler: Option<AccountHandler>,
        reply: oneshot::Sender<Result<MethodCall>>,
    },
    Shutdown,
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Configures and starts a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    account: Option<Account>,
}

impl ClientBuilder {
    /// Use a codec other than [`JsonCodec`].
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Start with a stored account; its resume token is used on every handshake.
    pub fn with_account(mut self, account: Account) -> Self {
        self.account = Some(account);
        self
    }

    /// Spawn the driver task and return the handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Client {
        let engine = Engine::new(self.config, self.account);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();

        let client = Client {
            commands: commands_tx,
            url: engine.config().url.clone(),
            stubs: Arc::new(RwLock::new(HashMap::new())),
            status: engine.status_watch(),
            reachable: engine.reachability_watch(),
            account: engine.account_watch(),
            events: engine.event_bus().clone(),
        };

        let driver = Driver {
            engine,
            connector: self.connector,
            codec: self.codec,
            commands: commands_rx,
            opened_tx,
            opened_rx,
            link: None,
            generation: 0,
            reconnect_at: None,
            heartbeat: None,
        };
        tokio::spawn(driver.run());

        client
    }
}

// ── Client (public handle) ──────────────────────────────────────────────────

/// Handle to a DDP session.
///
/// Dropping the last handle shuts the session down.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    url: String,
    stubs: Arc<RwLock<HashMap<String, MethodStub>>>,
    status: watch::Receiver<ConnectionStatus>,
    reachable: watch::Receiver<bool>,
    account: watch::Receiver<AccountSnapshot>,
    events: EventBus,
}

impl Client {
    pub fn builder(config: ClientConfig, connector: impl Connector) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: Arc::new(connector),
            codec: Arc::new(JsonCodec),
            account: None,
        }
    }

    /// Start a client with the default codec and no account.
    pub fn new(config: ClientConfig, connector: impl Connector) -> Self {
        Self::builder(config, connector).build()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DdpError::ClientClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply))?;
        response.await.map_err(|_| DdpError::ClientClosed)
    }

    // ── Connection ──────────────────────────────────────────────────────────

    /// Start connecting. Returns as soon as the request is queued.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Stop the driver task. Outstanding calls are abandoned.
    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    /// WebSocket URL the client connects to, after normalization.
    pub fn server_url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Report whether the network is reachable, as seen by the host platform.
    ///
    /// While unreachable, automatic reconnection is held; when the network
    /// comes back a waiting client reconnects without finishing its backoff.
    pub fn set_network_reachable(&self, reachable: bool) -> Result<()> {
        self.command(Command::NetworkReachable(reachable))
    }

    pub fn is_network_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for_status(
        &self,
        predicate: impl Fn(ConnectionStatus) -> bool,
    ) -> Result<ConnectionStatus> {
        let mut status = self.status.clone();
        let current = status
            .wait_for(|s| predicate(*s))
            .await
            .map_err(|_| DdpError::ClientClosed)?;
        Ok(*current)
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    pub async fn subscribe(&self, name: &str, params: Vec<Value>) -> Result<SubscriptionHandle> {
        self.subscribe_inner(name, params, None).await
    }

    /// Subscribe with a handler fired once on ready or error.
    pub async fn subscribe_with(
        &self,
        name: &str,
        params: Vec<Value>,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_inner(name, params, Some(Box::new(handler)))
            .await
    }

    async fn subscribe_inner(
        &self,
        name: &str,
        params: Vec<Value>,
        handler: Option<SubscriptionHandler>,
    ) -> Result<SubscriptionHandle> {
        let name = name.to_string();
        self.request(|reply| Command::Subscribe {
            name,
            params,
            handler,
            reply,
        })
        .await
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.command(Command::Unsubscribe {
            handle_id: handle.handle_id(),
        })
    }

    // ── Methods ─────────────────────────────────────────────────────────────

    /// Register a local stub for `name`, replacing any previous one.
    pub fn define_stub(
        &self,
        name: &str,
        stub: impl Fn(&[Value]) -> Option<Value> + Send + Sync + 'static,
    ) {
        let mut stubs = self.stubs.write().unwrap_or_else(|poisoned| {
            warn!(method = %name, "Stub table lock poisoned; recovering");
            poisoned.into_inner()
        });
        stubs.insert(name.to_string(), Arc::new(stub));
    }

    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<MethodCall> {
        self.call_with(name, params, CallOptions::default()).await
    }

    /// Call `name`. A stub defined for it runs here, before the call is queued.
    pub async fn call_with(
        &self,
        name: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<MethodCall> {
        let stub = self
            .stubs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let tentative = stub.and_then(|stub| stub(&params));
        let name = name.to_string();
        self.request(|reply| Command::Call {
            name,
            params,
            options,
            tentative,
            reply,
        })
        .await?
    }

    /// Call `name` and wait for it to settle.
    pub async fn call_and_wait(&self, name: &str, params: Vec<Value>) -> Result<Value> {
        let (done, settled) = oneshot::channel();
        let options = CallOptions::new().on_complete(move |result| {
            let _ = done.send(result);
        });
        self.call_with(name, params, options).await?;
        settled.await.map_err(|_| DdpError::ClientClosed)?
    }

    // ── Accounts ────────────────────────────────────────────────────────────

    pub async fn login_with_method(
        &self,
        method: &str,
        params: Vec<Value>,
        handler: Option<AccountHandler>,
    ) -> Result<MethodCall> {
        let method = method.to_string();
        self.request(|reply| Command::Login {
            method,
            params,
            handler,
            reply,
        })
        .await?
    }

    /// Log in and wait for the login call to settle.
    pub async fn login_and_wait(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let (done, settled) = oneshot::channel();
        let handler: AccountHandler = Box::new(move |result| {
            let _ = done.send(result);
        });
        self.login_with_method(method, params, Some(handler)).await?;
        settled.await.map_err(|_| DdpError::ClientClosed)?
    }

    pub async fn logout(&self, handler: Option<AccountHandler>) -> Result<MethodCall> {
        self.request(|reply| Command::Logout { handler, reply })
            .await?
    }

    pub async fn logout_and_wait(&self) -> Result<()> {
        let (done, settled) = oneshot::channel();
        let handler: AccountHandler = Box::new(move |result| {
            let _ = done.send(result);
        });
        self.logout(Some(handler)).await?;
        settled.await.map_err(|_| DdpError::ClientClosed)?
    }

    pub fn account(&self) -> Option<Account> {
        self.account.borrow().account.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.account.borrow().user_id().map(str::to_string)
    }

    pub fn is_logging_in(&self) -> bool {
        self.account.borrow().logging_in
    }

    pub fn account_watch(&self) -> watch::Receiver<AccountSnapshot> {
        self.account.clone()
    }

    // ── Events ──────────────────────────────────────────────────────────────

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

// ── Driver task ─────────────────────────────────────────────────────────────

struct ActiveLink {
    sender: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

struct Driver {
    engine: Engine,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    commands: mpsc::UnboundedReceiver<Command>,
    opened_tx: mpsc::UnboundedSender<(u64, Result<TransportLink>)>,
    opened_rx: mpsc::UnboundedReceiver<(u64, Result<TransportLink>)>,
    link: Option<ActiveLink>,
    generation: u64,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
}

impl Driver {
    async fn run(mut self) {
        debug!(url = %self.engine.config().url, "Client driver started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some((generation, result)) = self.opened_rx.recv() => {
                    self.handle_open(generation, result);
                }
                event = next_transport_event(&mut self.link) => {
                    self.handle_transport_event(event);
                }
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.engine.reconnect_timer_fired();
                }
                _ = tick(&mut self.heartbeat) => {
                    self.engine.heartbeat_tick();
                }
            }
            self.apply_actions();
        }

        self.engine.disconnect();
        self.apply_actions();
        info!("Client driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.engine.connect(),
            Command::Disconnect => self.engine.disconnect(),
            Command::Subscribe {
                name,
                params,
                handler,
                reply,
            } => {
                let handle = self.engine.subscribe(&name, params, handler);
                let _ = reply.send(handle);
            }
            Command::Unsubscribe { handle_id } => self.engine.unsubscribe(handle_id),
            Command::NetworkReachable(reachable) => {
                self.engine.network_reachability_changed(reachable)
            }
            Command::Call {
                name,
                params,
                options,
                tentative,
                reply,
            } => {
                let call = self.engine.call(&name, params, options, tentative);
                let _ = reply.send(call);
            }
            Command::Login {
                method,
                params,
                handler,
                reply,
            } => {
                let call = self.engine.login_with_method(&method, params, handler);
                let _ = reply.send(call);
            }
            Command::Logout { handler, reply } => {
                let call = self.engine.logout(handler);
                let _ = reply.send(call);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_open(&mut self, generation: u64, result: Result<TransportLink>) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Discarding superseded transport");
            return;
        }
        match result {
            Ok(link) => {
                debug!(generation, "Transport open");
                self.link = Some(ActiveLink {
                    sender: link.sender,
                    events: link.events,
                });
                self.engine.transport_opened();
            }
            Err(e) => self.engine.transport_failed(e),
        }
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(frame)) => match self.codec.decode(&frame) {
                Ok(message) => self.engine.handle_message(message),
                Err(e) => debug!(error = %e, "Ignoring undecodable frame"),
            },
            Some(TransportEvent::Closed(reason)) => {
                self.drop_link();
                self.engine.transport_closed(reason);
            }
            None => {
                self.drop_link();
                self.engine.transport_closed(None);
            }
        }
    }

    fn apply_actions(&mut self) {
        loop {
            let actions = self.engine.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.apply(action);
            }
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Open { url } => {
                self.drop_link();
                let generation = self.generation;
                let connector = self.connector.clone();
                let opened = self.opened_tx.clone();
                tokio::spawn(async move {
                    let result = connector.open(&url).await;
                    let _ = opened.send((generation, result));
                });
            }
            Action::Send(message) => {
                let frame = match self.codec.encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, kind = message.kind(), "Failed to encode message");
                        return;
                    }
                };
                match &self.link {
                    Some(link) => {
                        if link.sender.send(frame).is_err() {
                            // The close surfaces through the event stream
                            debug!(kind = message.kind(), "Transport gone; frame dropped");
                        }
                    }
                    None => warn!(kind = message.kind(), "No transport; frame dropped"),
                }
            }
            Action::Close => self.drop_link(),
            Action::ScheduleReconnect(delay) => {
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Action::CancelReconnect => self.reconnect_at = None,
            Action::StartHeartbeat(period) => self.heartbeat = Some(heartbeat_interval(period)),
            Action::StopHeartbeat => self.heartbeat = None,
        }
    }

    /// Forget the current transport and invalidate any open in flight.
    fn drop_link(&mut self) {
        self.link = None;
        self.generation += 1;
    }
}

fn heartbeat_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_transport_event(link: &mut Option<ActiveLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use serde_json::json;

    #[tokio::test]
    async fn test_stubs_survive_poisoned_lock() {
        let (connector, _listener) = MemoryConnector::new();
        let client = Client::new(ClientConfig::new("ws://localhost:3000").unwrap(), connector);
        let stubs = client.stubs.clone();
        let _ = std::thread::spawn(move || {
            let _guard = stubs.write().unwrap();
            panic!("stub table writer panicked");
        })
        .join();
        assert!(client.stubs.is_poisoned());

        client.define_stub("count", |params| Some(json!(params.len())));
        let call = client.call("count", vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(call.tentative, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_server_url_is_normalized() {
        let (connector, _listener) = MemoryConnector::new();
        let client = Client::new(ClientConfig::new("http://example.com").unwrap(), connector);
        assert_eq!(client.server_url(), "ws://example.com/websocket");
        assert!(client.is_network_reachable());
    }
}
