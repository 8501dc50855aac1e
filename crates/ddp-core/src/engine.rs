//! Session orchestration without I/O.
//!
//! [`Engine`] composes the connection state machine, the subscription and
//! method registries, and the account state. Inputs are caller operations,
//! decoded inbound messages, and transport/timer notifications; outputs are
//! [`Action`]s for whoever owns the transport, plus [`ClientEvent`]s on the
//! event bus. The [`Client`](crate::Client) runs one engine on a driver task,
//! but the engine can be stepped by hand, which is how most of its tests work.

use crate::account::{Account, AccountHandler, AccountSnapshot};
use crate::callback::Callback;
use crate::config::{ClientConfig, ProtocolConfig};
use crate::connection::{
    ConnectionMachine, ConnectionStatus, Heartbeat, Reachability, VersionOutcome,
};
use crate::error::{DdpError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::methods::{
    CallOptions, Completion, MethodCall, MethodInvocation, MethodRegistry, MethodRole,
    ResultOutcome, ResultState,
};
use crate::protocol::{Message, ServerError};
use crate::subscriptions::{
    NosubOutcome, RemoveOutcome, SubscriptionHandle, SubscriptionHandler, SubscriptionRegistry,
    SubscriptionState,
};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Side effect requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new transport to `url`, replacing any current one.
    Open { url: String },
    /// Send a message on the current transport.
    Send(Message),
    /// Close the current transport.
    Close,
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartHeartbeat(Duration),
    StopHeartbeat,
}

/// The client session, stepped by its owner.
pub struct Engine {
    config: ClientConfig,
    connection: ConnectionMachine,
    subscriptions: SubscriptionRegistry,
    methods: MethodRegistry,
    account: Option<Account>,
    events: EventBus,
    status_tx: watch::Sender<ConnectionStatus>,
    reachable_tx: watch::Sender<bool>,
    account_tx: watch::Sender<AccountSnapshot>,
    actions: Vec<Action>,
}

impl Engine {
    pub fn new(config: ClientConfig, account: Option<Account>) -> Self {
        let connection = ConnectionMachine::new(&config);
        let events = EventBus::new(config.event_capacity);
        let (status_tx, _) = watch::channel(ConnectionStatus::Offline);
        let (reachable_tx, _) = watch::channel(true);
        let (account_tx, _) = watch::channel(AccountSnapshot {
            account: account.clone(),
            logging_in: false,
        });
        Self {
            config,
            connection,
            subscriptions: SubscriptionRegistry::new(),
            methods: MethodRegistry::new(),
            account,
            events,
            status_tx,
            reachable_tx,
            account_tx,
            actions: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_network_reachable(&self) -> bool {
        self.connection.is_network_reachable()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.connection.session_id()
    }

    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.account.as_ref().map(|a| a.user_id.as_str())
    }

    pub fn is_logging_in(&self) -> bool {
        self.methods.has_pending_role(MethodRole::Login)
            || self.methods.has_pending_role(MethodRole::Resume)
    }

    pub fn subscription_state(&self, id: &str) -> Option<SubscriptionState> {
        self.subscriptions.state(id)
    }

    /// Number of method calls not yet settled.
    pub fn pending_methods(&self) -> usize {
        self.methods.len()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn account_watch(&self) -> watch::Receiver<AccountSnapshot> {
        self.account_tx.subscribe()
    }

    pub fn reachability_watch(&self) -> watch::Receiver<bool> {
        self.reachable_tx.subscribe()
    }

    /// Drain the actions accumulated since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    pub fn connect(&mut self) {
        if !self.connection.begin_connect() {
            debug!(status = %self.status(), "Connect ignored");
            return;
        }
        info!(url = %self.config.url, "Connecting");
        self.events.emit(ClientEvent::WillConnect);
        self.actions.push(Action::CancelReconnect);
        self.actions.push(Action::Open {
            url: self.config.url.clone(),
        });
        self.publish_status();
    }

    pub fn disconnect(&mut self) {
        let was_connected = self.connection.is_connected();
        if self.status() == ConnectionStatus::Offline {
            return;
        }
        info!("Disconnecting");
        self.events.emit(ClientEvent::WillDisconnect);
        self.connection.disconnect();
        self.actions.push(Action::CancelReconnect);
        self.actions.push(Action::StopHeartbeat);
        self.actions.push(Action::Close);
        self.publish_status();
        if was_connected {
            self.end_epoch();
        }
    }

    /// The transport requested by [`Action::Open`] is open.
    pub fn transport_opened(&mut self) {
        match self.connection.transport_opened() {
            Some(handshake) => self.send(handshake),
            None => debug!(status = %self.status(), "Ignoring transport open"),
        }
    }

    /// The transport closed.
    pub fn transport_closed(&mut self, reason: Option<String>) {
        let message = reason.unwrap_or_else(|| "connection closed".to_string());
        self.transport_lost(DdpError::transport(message));
    }

    /// The transport could not be opened or failed while open.
    pub fn transport_failed(&mut self, error: DdpError) {
        self.transport_lost(error);
    }

    pub fn reconnect_timer_fired(&mut self) {
        if !self.connection.reconnect_due() {
            return;
        }
        info!(attempt = self.connection.attempts(), "Reconnecting");
        self.events.emit(ClientEvent::WillConnect);
        self.actions.push(Action::Open {
            url: self.config.url.clone(),
        });
        self.publish_status();
    }

    pub fn heartbeat_tick(&mut self) {
        match self.connection.heartbeat_tick() {
            Heartbeat::Idle => {}
            Heartbeat::Ping(ping) => self.send(ping),
            Heartbeat::TimedOut => {
                self.transport_lost(DdpError::transport("heartbeat timed out"));
            }
        }
    }

    /// The host's view of network reachability changed.
    ///
    /// Going unreachable stops the reconnection timer; coming back skips the
    /// rest of the backoff. A live connection is left alone.
    pub fn network_reachability_changed(&mut self, reachable: bool) {
        let outcome = self.connection.set_network_reachable(reachable);
        if outcome == Reachability::Unchanged {
            return;
        }
        self.reachable_tx.send_replace(reachable);
        self.events.emit(ClientEvent::ReachabilityChanged(reachable));
        match outcome {
            Reachability::Deferred => self.actions.push(Action::CancelReconnect),
            Reachability::ReconnectNow => {
                self.actions.push(Action::CancelReconnect);
                self.reconnect_timer_fired();
            }
            Reachability::Noted | Reachability::Unchanged => {}
        }
    }

    fn transport_lost(&mut self, error: DdpError) {
        let was_connected = self.connection.is_connected();
        let Some(delay) = self.connection.transport_lost() else {
            debug!(error = %error, status = %self.status(), "Ignoring transport loss");
            return;
        };
        warn!(error = %error, delay = ?delay, "Transport lost");
        self.actions.push(Action::StopHeartbeat);
        self.actions.push(Action::Close);
        if self.connection.is_network_reachable() {
            self.actions.push(Action::ScheduleReconnect(delay));
        } else {
            debug!("Network unreachable; reconnect waits for it");
        }
        self.publish_status();
        self.events.emit(ClientEvent::DidFail(error));
        if was_connected {
            self.end_epoch();
        }
    }

    /// Nothing sent on the previous transport will be answered any more.
    fn end_epoch(&mut self) {
        self.subscriptions.epoch_ended();
        for invocation in self.methods.epoch_ended() {
            self.fail_invocation(
                invocation,
                DdpError::transport("connection lost before the method returned"),
            );
        }
    }

    fn handshake_succeeded(&mut self, session: String) {
        if !self.connection.handshake_succeeded(session.clone()) {
            return;
        }
        self.actions.push(Action::CancelReconnect);
        if let Some(interval) = self.config.heartbeat_interval {
            self.actions.push(Action::StartHeartbeat(interval));
        }
        self.publish_status();
        self.events.emit(ClientEvent::DidConnect { session });

        self.resume_login();
        for message in self.subscriptions.replay() {
            self.send(message);
        }
        for message in self.methods.replay() {
            self.send(message);
        }
        self.flush_if_quiescent();
    }

    fn handshake_failed(&mut self, suggested: String) {
        match self.connection.handshake_failed(&suggested) {
            VersionOutcome::Retry(version) => {
                debug!(version = %version, "Reopening with negotiated version");
                self.actions.push(Action::Close);
                self.actions.push(Action::Open {
                    url: self.config.url.clone(),
                });
            }
            VersionOutcome::Unsupported { offered, suggested } => {
                error!(offered = %offered, suggested = %suggested, "Server does not support any offered protocol version");
                self.actions.push(Action::Close);
                self.actions.push(Action::CancelReconnect);
                self.publish_status();
                self.events
                    .emit(ClientEvent::DidFail(DdpError::ProtocolVersion { offered, suggested }));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Inbound messages
    // ---------------------------------------------------------------------

    /// Process one decoded inbound message.
    pub fn handle_message(&mut self, message: Message) {
        self.connection.frame_received();
        self.events.emit(ClientEvent::MessageReceived(message.clone()));

        match message {
            Message::Connected { session } => self.handshake_succeeded(session),
            Message::Failed { version } => self.handshake_failed(version),
            Message::Ping { id } => self.send(Message::Pong { id }),
            Message::Pong { .. } => {}
            Message::Ready { subs } => {
                for info in self.subscriptions.mark_ready(&subs) {
                    debug!(id = %info.id, name = %info.name, "Subscription ready");
                    self.events.emit(ClientEvent::SubscriptionReady(info));
                }
                self.drain_subscription_violations();
                self.flush_if_quiescent();
            }
            Message::Nosub { id, error } => {
                match self.subscriptions.mark_nosub(&id, error) {
                    NosubOutcome::Errored(subscription, error) => {
                        warn!(id = %subscription.id, name = %subscription.name, error = %error, "Subscription failed");
                        self.events
                            .emit(ClientEvent::SubscriptionError { subscription, error });
                    }
                    NosubOutcome::Stopped(info) => {
                        debug!(id = %info.id, name = %info.name, "Subscription stopped");
                    }
                    NosubOutcome::Unknown => {}
                }
                self.drain_subscription_violations();
                self.flush_if_quiescent();
            }
            Message::Result { id, result, error } => {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                self.result_received(&id, outcome);
            }
            Message::Updated { methods } => {
                for flushed in self.methods.record_flush(&methods) {
                    self.events
                        .emit(ClientEvent::MethodDataUpdated(flushed.info));
                    if let Some(invocation) = flushed.settled {
                        self.settle(invocation);
                    }
                }
            }
            Message::Error {
                reason,
                offending_message,
            } => {
                warn!(reason = %reason, offending = ?offending_message, "Server rejected a client message");
            }
            message if message.is_document() => {
                self.events.emit(ClientEvent::Document(message));
            }
            other => {
                warn!(kind = other.kind(), "Unexpected message from server");
            }
        }
    }

    fn result_received(&mut self, id: &str, outcome: std::result::Result<Value, ServerError>) {
        match self.methods.record_result(id, outcome) {
            ResultOutcome::Recorded {
                info,
                role,
                outcome,
                settled,
            } => {
                debug!(id = %info.id, method = %info.name, ok = outcome.is_ok(), "Method result");
                self.events.emit(ClientEvent::MethodResult {
                    method: info,
                    result: outcome.clone(),
                });
                self.apply_account_effects(role, &outcome);
                if let Some(invocation) = settled {
                    self.settle(invocation);
                }
            }
            ResultOutcome::Duplicate | ResultOutcome::Unknown => {}
        }
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        name: &str,
        params: Vec<Value>,
        handler: Option<SubscriptionHandler>,
    ) -> SubscriptionHandle {
        let outcome = self
            .subscriptions
            .add(name, params, handler, self.connection.is_connected());
        if outcome.created {
            self.events.emit(ClientEvent::WillSubscribe(outcome.info));
        }
        if let Some(message) = outcome.send {
            self.send(message);
        }
        self.drain_subscription_violations();
        outcome.handle
    }

    pub fn unsubscribe(&mut self, handle_id: u64) {
        match self.subscriptions.remove(handle_id) {
            RemoveOutcome::Retained => {}
            RemoveOutcome::Released(info) => {
                self.events.emit(ClientEvent::WillUnsubscribe(info));
            }
            RemoveOutcome::Unsubscribe(info, message) => {
                self.events.emit(ClientEvent::WillUnsubscribe(info));
                self.send(message);
            }
        }
        self.flush_if_quiescent();
    }

    // ---------------------------------------------------------------------
    // Methods
    // ---------------------------------------------------------------------

    /// Start a method call. `tentative` is the value of a local stub, if any.
    pub fn call(
        &mut self,
        name: &str,
        params: Vec<Value>,
        options: CallOptions,
        tentative: Option<Value>,
    ) -> Result<MethodCall> {
        let id = self.methods.next_id();
        let invocation = MethodInvocation::new(
            id,
            name,
            params,
            options.retryable,
            Completion::Caller(Callback::from_option(options.on_complete)),
        )
        .with_tentative(tentative.clone());
        self.register(invocation)?;
        Ok(MethodCall {
            id: id.to_string(),
            tentative,
        })
    }

    fn register(&mut self, invocation: MethodInvocation) -> Result<()> {
        let info = invocation.info();
        match self
            .methods
            .register(invocation, self.connection.is_connected())
        {
            Ok(send) => {
                self.events.emit(ClientEvent::WillCallMethod(info));
                if let Some(message) = send {
                    self.send(message);
                }
                Ok(())
            }
            Err(e) => {
                self.report_violation(e.clone());
                debug_assert!(false, "{}", e);
                Err(e)
            }
        }
    }

    fn settle(&mut self, invocation: MethodInvocation) {
        let id = invocation.id_str();
        let outcome = match invocation.result {
            ResultState::Completed(outcome) => outcome,
            ResultState::Pending => {
                warn!(id = %id, "Settling a method call without a result");
                return;
            }
        };
        debug!(id = %id, method = %invocation.name, "Method call settled");

        let fired = match invocation.completion {
            Completion::Caller(mut callback) => {
                callback.fire(&id, outcome.map_err(DdpError::Server))
            }
            Completion::Login(mut callback) => {
                let login = outcome
                    .map_err(DdpError::Server)
                    .and_then(|value| Account::from_login_result(&value).map(|_| ()));
                callback.fire(&id, login)
            }
            Completion::Resume => Ok(()),
            Completion::Logout(mut callback) => {
                callback.fire(&id, outcome.map(|_| ()).map_err(DdpError::Server))
            }
        };
        if let Err(e) = fired {
            self.report_violation(e);
        }
    }

    fn fail_invocation(&mut self, invocation: MethodInvocation, error: DdpError) {
        let id = invocation.id_str();
        debug!(id = %id, method = %invocation.name, error = %error, "Failing method call");

        let fired = match invocation.completion {
            Completion::Caller(mut callback) => callback.fire(&id, Err(error)),
            Completion::Login(mut callback) => {
                self.events.emit(ClientEvent::DidFailLogin(error.clone()));
                callback.fire(&id, Err(error))
            }
            Completion::Resume => Ok(()),
            Completion::Logout(mut callback) => {
                self.logged_out();
                callback.fire(&id, Err(error))
            }
        };
        if let Err(e) = fired {
            self.report_violation(e);
        }
        self.publish_account();
    }

    /// Flush calls whose result arrived on an earlier transport once every
    /// resent subscription has been answered.
    fn flush_if_quiescent(&mut self) {
        if !self.connection.is_connected()
            || !self.subscriptions.is_quiescent()
            || !self.methods.has_parked()
        {
            return;
        }
        for invocation in self.methods.take_quiescent() {
            self.events
                .emit(ClientEvent::MethodDataUpdated(invocation.info()));
            self.settle(invocation);
        }
    }

    // ---------------------------------------------------------------------
    // Accounts
    // ---------------------------------------------------------------------

    /// Log in by calling `method` with `params`; its result becomes the account.
    pub fn login_with_method(
        &mut self,
        method: &str,
        params: Vec<Value>,
        handler: Option<AccountHandler>,
    ) -> Result<MethodCall> {
        info!(method = %method, "Logging in");
        self.events.emit(ClientEvent::WillLogin {
            method: method.to_string(),
            params: params.clone(),
        });
        let id = self.methods.next_id();
        let invocation = MethodInvocation::new(
            id,
            method,
            params,
            true,
            Completion::Login(Callback::from_option(handler)),
        );
        self.register(invocation)?;
        self.publish_account();
        Ok(MethodCall {
            id: id.to_string(),
            tentative: None,
        })
    }

    pub fn logout(&mut self, handler: Option<AccountHandler>) -> Result<MethodCall> {
        info!("Logging out");
        self.events.emit(ClientEvent::WillLogout);
        let id = self.methods.next_id();
        let invocation = MethodInvocation::new(
            id,
            ProtocolConfig::LOGOUT_METHOD,
            Vec::new(),
            true,
            Completion::Logout(Callback::from_option(handler)),
        );
        self.register(invocation)?;
        Ok(MethodCall {
            id: id.to_string(),
            tentative: None,
        })
    }

    /// Issue `login({resume})` as the first call of a new session.
    fn resume_login(&mut self) {
        let Some(account) = self.account.clone() else {
            return;
        };
        if account.is_token_expired(Utc::now()) {
            info!(user_id = %account.user_id, "Resume token expired");
            self.change_account(None);
            return;
        }
        let Some(params) = account.resume_params() else {
            return;
        };

        debug!(user_id = %account.user_id, "Resuming login");
        self.events.emit(ClientEvent::WillLogin {
            method: ProtocolConfig::LOGIN_METHOD.to_string(),
            params: params.clone(),
        });
        let id = self.methods.next_id();
        let invocation = MethodInvocation::new(
            id,
            ProtocolConfig::LOGIN_METHOD,
            params,
            false,
            Completion::Resume,
        );
        if self.register(invocation).is_ok() {
            self.publish_account();
        }
    }

    fn apply_account_effects(
        &mut self,
        role: MethodRole,
        outcome: &std::result::Result<Value, ServerError>,
    ) {
        match role {
            MethodRole::Caller => return,
            MethodRole::Login | MethodRole::Resume => {
                let login = outcome
                    .clone()
                    .map_err(DdpError::Server)
                    .and_then(|value| Account::from_login_result(&value));
                match login {
                    Ok(account) => {
                        info!(user_id = %account.user_id, "Logged in");
                        let changed = self.set_account(Some(account.clone()));
                        self.events.emit(ClientEvent::DidLogin(account.clone()));
                        if changed {
                            self.events
                                .emit(ClientEvent::AccountChanged(Some(account)));
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, resume = role == MethodRole::Resume, "Login failed");
                        self.events.emit(ClientEvent::DidFailLogin(error));
                        if role == MethodRole::Resume {
                            self.change_account(None);
                        }
                    }
                }
            }
            MethodRole::Logout => self.logged_out(),
        }
        self.publish_account();
    }

    fn logged_out(&mut self) {
        info!("Logged out");
        let changed = self.set_account(None);
        self.events.emit(ClientEvent::DidLogout);
        if changed {
            self.events.emit(ClientEvent::AccountChanged(None));
        }
    }

    fn change_account(&mut self, account: Option<Account>) {
        if self.set_account(account.clone()) {
            self.events.emit(ClientEvent::AccountChanged(account));
        }
    }

    fn set_account(&mut self, account: Option<Account>) -> bool {
        if self.account == account {
            return false;
        }
        self.account = account;
        self.publish_account();
        true
    }

    // ---------------------------------------------------------------------
    // Output
    // ---------------------------------------------------------------------

    fn send(&mut self, message: Message) {
        debug!(kind = message.kind(), "Sending message");
        self.events.emit(ClientEvent::MessageSent(message.clone()));
        self.actions.push(Action::Send(message));
    }

    fn publish_status(&mut self) {
        let status = self.connection.status();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(status = %status, "Connection status changed");
            self.events
                .emit(ClientEvent::ConnectionStatusChanged(status));
        }
    }

    fn publish_account(&mut self) {
        let snapshot = AccountSnapshot {
            account: self.account.clone(),
            logging_in: self.is_logging_in(),
        };
        self.account_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn drain_subscription_violations(&mut self) {
        for violation in self.subscriptions.take_violations() {
            self.report_violation(violation);
        }
    }

    fn report_violation(&mut self, violation: DdpError) {
        error!(error = %violation, "Invariant violation");
        self.events
            .emit(ClientEvent::InvariantViolation(violation));
    }
}
