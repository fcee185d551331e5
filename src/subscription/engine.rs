//! The multiplexed `graphql-transport-ws` connection state machine.
//!
//! One [`Engine`] lazily owns at most one [`WebSocketConnection`], shared
//! by every concurrently active [`subscribe`](Engine::subscribe) call.
//! The connection is driven by a single actor task (`run_connection`)
//! spawned on first subscribe and torn down once its last operation
//! closes, speaking `graphql-transport-ws`'s `subscribe`/`next`/`error`/
//! `complete` plus explicit `ping`/`pong`, with `subscribe` frames held
//! until the handshake completes (see DESIGN.md REDESIGN FLAGS).
//!
//! All actor-owned state (`operations`, `next_local_id`,
//! `handshake_acked`) lives only inside `run_connection`'s stack;
//! callers reach it exclusively through the `mpsc` command channel, so
//! no lock is held across an `.await` and no back-pointer cycle exists
//! between `Operation` and `Engine`.

use crate::codec::{Message, SubscribePayload};
use crate::request::Request;
use crate::response::GraphQlResult;
use crate::subscription::timeout::{TimeoutApi, TimeoutHandler, TimeoutStrategy};
use crate::subscription::ws_transport::{WebSocketConnection, WebSocketTransport};
use crate::subscription::CloseReason;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

type OnData = Arc<dyn Fn(GraphQlResult) + Send + Sync>;
type OnClose = Arc<dyn Fn(CloseReason) + Send + Sync>;

/// Async hook invoked once per connection attempt to produce the
/// `connection_init` payload (e.g. a freshly-fetched auth token).
pub type GeneratePayloadHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<Value>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct EngineConfig {
    pub url: String,
    pub subprotocol: String,
    pub generate_payload: Option<GeneratePayloadHook>,
    pub default_timeout_strategy: Option<Arc<dyn TimeoutStrategy>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            url: String::new(),
            subprotocol: "graphql-transport-ws".to_string(),
            generate_payload: None,
            default_timeout_strategy: None,
        }
    }
}

/// Per-subscribe-call options.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Invoked once if this call is the one that establishes a new
    /// connection (socket-open, before handshake).
    pub on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Overrides [`EngineConfig::default_timeout_strategy`] for the
    /// connection this subscribe call establishes. Has no effect if the
    /// connection already exists.
    pub timeout_strategy: Option<Arc<dyn TimeoutStrategy>>,
}

/// Handle returned by [`Engine::subscribe`]: `connected` resolves once
/// the `subscribe` frame has actually been sent (the Operation reaches
/// `Active`); `abort()` tears the operation down.
#[derive(Clone)]
pub struct SubscriptionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
    local_id: String,
}

impl SubscriptionHandle {
    /// Idempotent and safe to call from within an `on_close`/`on_data`
    /// callback: sends `complete` toward the server if the connection is
    /// still open, then closes locally with reason `Client`.
    pub fn abort(&self) {
        let _ = self.cmd_tx.send(ConnectionCommand::Abort {
            local_id: self.local_id.clone(),
        });
    }
}

struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

enum ConnectionCommand {
    Subscribe {
        request: Request,
        on_data: OnData,
        on_close: OnClose,
        reply: oneshot::Sender<(String, oneshot::Receiver<()>)>,
    },
    Abort {
        local_id: String,
    },
    SendOutbound(Message),
    AbortConnection(CloseReason),
}

struct ConnectionTimeoutApi {
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl TimeoutApi for ConnectionTimeoutApi {
    fn send(&self, message: Message) {
        let _ = self.cmd_tx.send(ConnectionCommand::SendOutbound(message));
    }

    fn abort(&self, reason: CloseReason) {
        let _ = self.cmd_tx.send(ConnectionCommand::AbortConnection(reason));
    }
}

enum OpState {
    Pending,
    Active,
}

struct OperationState {
    local_id: String,
    request: Request,
    on_data: OnData,
    on_close: OnClose,
    state: OpState,
    received_first_next: bool,
    connected_tx: Option<oneshot::Sender<()>>,
}

/// One `graphql-transport-ws` client, multiplexing any number of
/// concurrent subscriptions over a single lazily-opened connection.
pub struct Engine {
    transport: Arc<dyn WebSocketTransport>,
    config: EngineConfig,
    connection: Arc<Mutex<Option<Arc<ConnectionHandle>>>>,
}

impl Engine {
    pub fn new(transport: Arc<dyn WebSocketTransport>, config: EngineConfig) -> Self {
        Engine {
            transport,
            config,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of operations currently tracked across all connections
    /// this engine has ever opened is not exposed; callers track their
    /// own active count via `on_close`. This reports whether a
    /// connection is currently open at all.
    pub async fn has_open_connection(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    pub async fn subscribe(
        &self,
        request: Request,
        on_data: impl Fn(GraphQlResult) + Send + Sync + 'static,
        on_close: impl Fn(CloseReason) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> (
        impl Future<Output = ()> + Send + 'static,
        SubscriptionHandle,
    ) {
        let handle = self.ensure_connection(&options).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = handle.cmd_tx.send(ConnectionCommand::Subscribe {
            request,
            on_data: Arc::new(on_data),
            on_close: Arc::new(on_close),
            reply: reply_tx,
        });

        let cmd_tx = handle.cmd_tx.clone();
        if sent.is_err() {
            // The connection actor already exited (e.g. immediate connect
            // failure); there is nothing further to wire up.
            let handle = SubscriptionHandle {
                cmd_tx,
                local_id: String::new(),
            };
            return (
                Box::pin(async {}) as Pin<Box<dyn Future<Output = ()> + Send>>,
                handle,
            );
        }

        // `reply_rx` carries the actor-assigned local_id immediately, and
        // a second oneshot that resolves once the subscribe frame is
        // actually sent (Operation reaches Active).
        let (local_id, connected_rx) = reply_rx
            .await
            .unwrap_or_else(|_| (String::new(), oneshot::channel().1));

        let handle = SubscriptionHandle {
            cmd_tx,
            local_id,
        };
        let connected = async move {
            let _ = connected_rx.await;
        };

        (Box::pin(connected) as Pin<Box<dyn Future<Output = ()> + Send>>, handle)
    }

    async fn ensure_connection(&self, options: &SubscribeOptions) -> Arc<ConnectionHandle> {
        let mut guard = self.connection.lock().await;
        if let Some(handle) = guard.as_ref() {
            return handle.clone();
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            cmd_tx: cmd_tx.clone(),
        });
        *guard = Some(handle.clone());
        drop(guard);

        let strategy = options
            .timeout_strategy
            .clone()
            .or_else(|| self.config.default_timeout_strategy.clone());
        let init_payload = match &self.config.generate_payload {
            Some(hook) => hook().await,
            None => None,
        };

        let connect_result = self
            .transport
            .connect(&self.config.url, &self.config.subprotocol)
            .await;

        let slot = self.connection.clone();

        match connect_result {
            Ok(conn) => {
                if let Some(on_open) = &options.on_open {
                    on_open();
                }
                info!(url = %self.config.url, "subscription connection opened");
                tokio::spawn(run_connection(conn, cmd_rx, init_payload, strategy, slot, cmd_tx));
            }
            Err(err) => {
                warn!(error = %err, "subscription connection failed to open");
                *self.connection.lock().await = None;
                tokio::spawn(fail_all_subscribes(cmd_rx));
            }
        }

        handle
    }
}

/// Drains a command channel whose connection never opened, answering
/// every `Subscribe` with an immediate `Error` close.
async fn fail_all_subscribes(mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        if let ConnectionCommand::Subscribe { on_close, reply, .. } = cmd {
            let (_tx, rx) = oneshot::channel();
            let _ = reply.send((String::new(), rx));
            on_close(CloseReason::Error);
        }
    }
}

async fn run_connection(
    mut conn: Box<dyn WebSocketConnection>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    init_payload: Option<Value>,
    timeout_strategy: Option<Arc<dyn TimeoutStrategy>>,
    slot: Arc<Mutex<Option<Arc<ConnectionHandle>>>>,
    self_tx: mpsc::UnboundedSender<ConnectionCommand>,
) {
    let mut operations: HashMap<String, OperationState> = HashMap::new();
    let mut pending_subscribes: Vec<String> = Vec::new();
    let mut handshake_acked = false;
    let next_local_id = AtomicU64::new(1);

    let timeout_api: Arc<dyn TimeoutApi> = Arc::new(ConnectionTimeoutApi { cmd_tx: self_tx });
    let timeout_handler: Option<Arc<dyn TimeoutHandler>> =
        timeout_strategy.as_ref().map(|s| s.create_handler());

    let init_msg = Message::ConnectionInit { payload: init_payload };
    if conn.send_text(init_msg.encode()).await.is_err() {
        warn!("failed to send connection_init");
        close_all(&mut operations, CloseReason::Error);
        *slot.lock().await = None;
        return;
    }
    if let Some(h) = &timeout_handler {
        h.on_open(timeout_api.clone());
    }

    loop {
        tokio::select! {
            incoming = conn.recv_text() => {
                match incoming {
                    Some(Ok(text)) => {
                        let msg = match Message::decode(&text) {
                            Ok(m) => m,
                            Err(err) => {
                                warn!(error = %err, "malformed frame, demoting all operations to Error");
                                if let Some(h) = &timeout_handler { h.on_close(CloseReason::Error); }
                                close_all(&mut operations, CloseReason::Error);
                                break;
                            }
                        };

                        let consumed = timeout_handler
                            .as_ref()
                            .map(|h| h.on_inbound(&msg, timeout_api.clone()))
                            .unwrap_or(false);

                        match msg {
                            Message::ConnectionAck { .. } => {
                                handshake_acked = true;
                                debug!("connection_ack received, flushing pending subscribes");
                                if let Some(h) = &timeout_handler { h.on_ack(timeout_api.clone()); }
                                for id in pending_subscribes.drain(..) {
                                    if let Some(op) = operations.get_mut(&id) {
                                        send_subscribe_frame(&mut conn, op).await;
                                    }
                                }
                            }
                            Message::Ping { payload } => {
                                if !consumed {
                                    let pong = Message::Pong { payload };
                                    let _ = conn.send_text(pong.encode()).await;
                                }
                            }
                            Message::Pong { .. } => {}
                            Message::Next { id, payload } => {
                                if let Some(op) = operations.get_mut(&id) {
                                    op.received_first_next = true;
                                    (op.on_data)(payload);
                                }
                            }
                            Message::Error { id, payload } => {
                                if let Some(op) = operations.remove(&id) {
                                    let reason = if op.received_first_next {
                                        CloseReason::Error
                                    } else {
                                        CloseReason::ServerError
                                    };
                                    (op.on_data)(GraphQlResult::graphql_errors(payload, 0));
                                    (op.on_close)(reason);
                                }
                            }
                            Message::Complete { id } => {
                                if let Some(op) = operations.remove(&id) {
                                    (op.on_close)(CloseReason::Server);
                                }
                            }
                            Message::Subscribe { .. } | Message::ConnectionInit { .. } | Message::Unknown { .. } => {}
                        }

                        if operations.is_empty() && handshake_acked {
                            debug!("last operation closed, discarding connection");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        if let Some(h) = &timeout_handler { h.on_close(CloseReason::Error); }
                        close_all(&mut operations, CloseReason::Error);
                        break;
                    }
                    None => {
                        debug!("websocket closed by peer");
                        if let Some(h) = &timeout_handler { h.on_close(CloseReason::Error); }
                        close_all(&mut operations, CloseReason::Error);
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnectionCommand::Subscribe { request, on_data, on_close, reply }) => {
                        let local_id = next_local_id.fetch_add(1, Ordering::SeqCst).to_string();
                        let (connected_tx, connected_rx) = oneshot::channel();
                        let mut op = OperationState {
                            local_id: local_id.clone(),
                            request,
                            on_data,
                            on_close,
                            state: OpState::Pending,
                            received_first_next: false,
                            connected_tx: Some(connected_tx),
                        };

                        if handshake_acked {
                            send_subscribe_frame(&mut conn, &mut op).await;
                        } else {
                            pending_subscribes.push(local_id.clone());
                        }
                        operations.insert(local_id.clone(), op);

                        let _ = reply.send((local_id, connected_rx));
                    }
                    Some(ConnectionCommand::Abort { local_id }) => {
                        if let Some(op) = operations.remove(&local_id) {
                            if handshake_acked && matches!(op.state, OpState::Active) {
                                let complete = Message::Complete { id: local_id };
                                let _ = conn.send_text(complete.encode()).await;
                            }
                            (op.on_close)(CloseReason::Client);
                        }
                        if operations.is_empty() {
                            debug!("last operation aborted, discarding connection");
                            break;
                        }
                    }
                    Some(ConnectionCommand::SendOutbound(message)) => {
                        let _ = conn.send_text(message.encode()).await;
                    }
                    Some(ConnectionCommand::AbortConnection(reason)) => {
                        warn!(?reason, "timeout strategy aborted connection");
                        if let Some(h) = &timeout_handler { h.on_close(reason); }
                        close_all(&mut operations, reason);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    *slot.lock().await = None;
}

async fn send_subscribe_frame(conn: &mut Box<dyn WebSocketConnection>, op: &mut OperationState) {
    let payload = SubscribePayload::from(&op.request);
    let msg = Message::Subscribe {
        id: op.local_id.clone(),
        payload,
    };
    let _ = conn.send_text(msg.encode()).await;
    op.state = OpState::Active;
    if let Some(tx) = op.connected_tx.take() {
        let _ = tx.send(());
    }
}

fn close_all(operations: &mut HashMap<String, OperationState>, reason: CloseReason) {
    for (_, op) in operations.drain() {
        (op.on_close)(reason);
    }
}
