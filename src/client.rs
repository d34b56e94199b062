//! Strategy-side OMS client: logs in, keeps the heartbeat contract and
//! exposes executions, positions and errors as a typed event stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::domain::{Action, Comment, OrderType};
use crate::protocol::{
    self, ErrorCode, ExecutionItem, Heartbeat, OmsMessage, PositionAccount,
};

/// What the client surfaces to the strategy.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    ConnectionState { is_ready: bool, message: String },
    Execution(Vec<ExecutionItem>),
    Position {
        request_id: Option<i64>,
        account: Option<PositionAccount>,
    },
    Error {
        error_code: ErrorCode,
        message: String,
        request_id: Option<i64>,
    },
}

struct ClientInner {
    url: String,
    session: String,
    account: String,
    strategies: BTreeMap<String, String>,
    request_id: Mutex<Option<i64>>,
    is_connected: AtomicBool,
    is_connection_ready: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientInner {
    fn send(&self, msg: &OmsMessage) {
        let raw = match protocol::encode(msg) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: "client", error = %err, "failed to encode message");
                return;
            }
        };
        debug!(target: "client", msg_type = msg.msg_type(), "send message");
        if let Some(outbound) = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = outbound.send(Message::Text(raw));
        }
    }

    fn send_init(&self) {
        self.send(&OmsMessage::Init {
            session_id: self.session.clone(),
            account_id: self.account.clone(),
            strategies: self.strategies.clone(),
        });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_ready(&self, is_ready: bool, message: &str) {
        self.emit(ClientEvent::ConnectionState {
            is_ready,
            message: message.to_string(),
        });
    }

    fn next_request_id(&self) -> Option<i64> {
        let mut guard = self.request_id.lock().unwrap_or_else(|e| e.into_inner());
        let current = (*guard)?;
        *guard = Some(current + 1);
        Some(current)
    }
}

/// Client handle. Dropping it stops the background tasks once the sockets
/// close.
pub struct OmsClient {
    inner: Arc<ClientInner>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl OmsClient {
    /// Connect to the proxy frontend and keep a logged-in session alive,
    /// re-sending INIT with the shared doubling backoff whenever the link or
    /// the login drops.
    pub fn connect(
        url: impl Into<String>,
        session: &str,
        account: &str,
        strategies: BTreeMap<String, String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            url: url.into(),
            session: session.to_string(),
            account: account.to_string(),
            strategies,
            request_id: Mutex::new(None),
            is_connected: AtomicBool::new(false),
            is_connection_ready: AtomicBool::new(false),
            outbound: Mutex::new(None),
            events_tx,
        });

        {
            let inner = inner.clone();
            tokio::spawn(async move { run_client(inner).await });
        }
        {
            let inner = inner.clone();
            tokio::spawn(async move { run_heartbeat(inner).await });
        }

        Self { inner, events_rx }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.inner.is_connection_ready.load(Ordering::SeqCst)
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<ClientEvent> {
        &mut self.events_rx
    }

    pub async fn wait_till_ready(&self) {
        while !self.is_connected() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Allocate a request id and submit a new-order message. Returns the
    /// request id, or `None` before login completes.
    #[allow(clippy::too_many_arguments)]
    pub fn place_order(
        &self,
        market: &str,
        symbol: &str,
        order_type: OrderType,
        is_buy: bool,
        quantity: i64,
        price: f64,
        portfolio: &str,
        action: Action,
        strategy: &str,
        reference: Option<String>,
        comment: Comment,
    ) -> Option<i64> {
        let request_id = self.inner.next_request_id()?;
        self.inner.send(&OmsMessage::NewOrder {
            request_id,
            market: market.to_string(),
            symbol: symbol.to_string(),
            order_type,
            is_buy,
            quantity,
            price,
            portfolio: portfolio.to_string(),
            action,
            strategy: strategy.to_string(),
            reference,
            comment,
        });
        Some(request_id)
    }

    pub fn request_position(&self) -> Option<i64> {
        let request_id = self.inner.next_request_id()?;
        self.inner.send(&OmsMessage::Position {
            request_id: Some(request_id),
            account: None,
        });
        Some(request_id)
    }
}

async fn run_heartbeat(inner: Arc<ClientInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(Heartbeat::INTERVAL as u64));
    loop {
        ticker.tick().await;
        if inner.is_connected.load(Ordering::SeqCst) {
            let now = Utc::now().naive_utc();
            inner.send(&OmsMessage::Heartbeat {
                timestamp: protocol::wire_timestamp(now),
                next: protocol::wire_timestamp(
                    now + ChronoDuration::seconds(Heartbeat::INTERVAL),
                ),
                is_ready: None,
                message: None,
            });
        }
    }
}

async fn run_client(inner: Arc<ClientInner>) {
    let mut retry = Heartbeat::RETRY_INTERVAL;
    info!(target: "client", url = %inner.url, "start to connect");

    loop {
        let (ws, _) = match connect_async(&inner.url).await {
            Ok(ok) => ok,
            Err(err) => {
                debug!(target: "client", error = %err, "connect failed, will retry");
                tokio::time::sleep(Duration::from_secs(retry)).await;
                retry = (retry * 2).min(Heartbeat::MAX_RETRY_INTERVAL);
                continue;
            }
        };

        let (mut write, mut read) = ws.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        *inner.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(write_tx);

        inner.send_init();
        let mut last_server_heartbeat = Utc::now().naive_utc();
        let mut liveness = tokio::time::interval(Duration::from_secs(1));

        let mut relogin_backoff = false;
        loop {
            tokio::select! {
                Some(msg) = write_rx.recv() => {
                    if write.send(msg).await.is_err() {
                        break;
                    }
                }
                maybe_msg = read.next() => {
                    let text = match maybe_msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    match handle_server_message(&inner, &text, &mut last_server_heartbeat, &mut retry) {
                        ServerMessageOutcome::Continue => {}
                        ServerMessageOutcome::ReloginWithBackoff => {
                            relogin_backoff = true;
                            break;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if heartbeat_lost(&inner, last_server_heartbeat) {
                        break;
                    }
                }
            }
        }

        *inner.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        inner.is_connected.store(false, Ordering::SeqCst);
        if relogin_backoff {
            warn!(target: "client", retry, "login rejected, will retry");
            tokio::time::sleep(Duration::from_secs(retry)).await;
            retry = (retry * 2).min(Heartbeat::MAX_RETRY_INTERVAL);
        }
    }
}

enum ServerMessageOutcome {
    Continue,
    ReloginWithBackoff,
}

fn heartbeat_lost(inner: &ClientInner, last_server_heartbeat: NaiveDateTime) -> bool {
    if Heartbeat::is_expired(Some(last_server_heartbeat)) {
        if inner.is_connected.swap(false, Ordering::SeqCst) {
            warn!(target: "client", "lost heartbeat from OMS server, try to reconnect");
            inner.set_ready(false, "Lost connection to OMS");
        } else {
            warn!(target: "client", "no response from OMS yet, try to reconnect");
        }
        return true;
    }
    false
}

fn handle_server_message(
    inner: &ClientInner,
    text: &str,
    last_server_heartbeat: &mut NaiveDateTime,
    retry: &mut u64,
) -> ServerMessageOutcome {
    let decoded = match protocol::decode(text) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(target: "client", error = %err, "dropping undecodable message");
            return ServerMessageOutcome::Continue;
        }
    };
    debug!(target: "client", msg_type = decoded.msg_type(), "received message");

    if !matches!(decoded, OmsMessage::Error { .. }) {
        *last_server_heartbeat = Utc::now().naive_utc();
    }

    match decoded {
        OmsMessage::Error {
            error_code,
            message,
            request_id,
            ..
        } => match error_code {
            ErrorCode::AlreadyLoggedIn => {
                info!(target: "client", "already logged in, the INIT message is not necessary");
                ServerMessageOutcome::Continue
            }
            ErrorCode::DuplicatedSessionId | ErrorCode::NotLoggedIn | ErrorCode::InitError => {
                ServerMessageOutcome::ReloginWithBackoff
            }
            _ => {
                inner.emit(ClientEvent::Error {
                    error_code,
                    message,
                    request_id,
                });
                ServerMessageOutcome::Continue
            }
        },
        OmsMessage::Execution { items, .. } => {
            inner.emit(ClientEvent::Execution(items));
            ServerMessageOutcome::Continue
        }
        OmsMessage::Heartbeat { is_ready, .. } => {
            let is_ready = is_ready.unwrap_or(false);
            if inner.is_connection_ready.swap(is_ready, Ordering::SeqCst) != is_ready {
                let message = if is_ready {
                    "OMS is ready"
                } else {
                    "OMS is not ready"
                };
                inner.set_ready(is_ready, message);
            }
            ServerMessageOutcome::Continue
        }
        OmsMessage::NextRequestId { next_request_id } => {
            *inner.request_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(next_request_id);
            inner.is_connected.store(true, Ordering::SeqCst);
            *retry = Heartbeat::RETRY_INTERVAL;
            let ready = inner.is_connection_ready.load(Ordering::SeqCst);
            inner.set_ready(ready, "Connected to OMS");
            ServerMessageOutcome::Continue
        }
        OmsMessage::Position {
            request_id,
            account,
        } => {
            inner.emit(ClientEvent::Position {
                request_id,
                account,
            });
            ServerMessageOutcome::Continue
        }
        OmsMessage::Init { .. } | OmsMessage::NewOrder { .. } => {
            warn!(target: "client", "unexpected server-bound message type");
            ServerMessageOutcome::Continue
        }
    }
}
