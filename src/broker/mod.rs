pub mod sim;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDateTime, Utc};
use tracing::{error, info};

use crate::domain::{OrderState, OrderType};
use crate::types::BrokerConfig;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("broken pipe: {0}")]
    BrokenPipe(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway error: {0}")]
    Other(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tif {
    Gtc,
    Gtd,
}

/// Order as handed to a gateway for transmission.
#[derive(Clone, Debug)]
pub struct GatewayOrder {
    pub symbol: String,
    pub exchange: String,
    pub order_type: OrderType,
    pub is_buy: bool,
    pub quantity: i64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tif: Tif,
    pub outside_rth: bool,
    pub good_till_date: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayOrderStatus {
    Undefined,
    Submitted,
    Filled,
    PartialFilled,
    Cancelled,
    Inactive,
    Rejected,
}

/// Order state the ledger records for a gateway-reported status.
pub fn order_state_from_status(status: GatewayOrderStatus) -> OrderState {
    match status {
        GatewayOrderStatus::Undefined => OrderState::Inactive,
        GatewayOrderStatus::Submitted => OrderState::Active,
        GatewayOrderStatus::Filled => OrderState::FullyFilled,
        GatewayOrderStatus::PartialFilled => OrderState::Active,
        GatewayOrderStatus::Cancelled => OrderState::Cancelled,
        GatewayOrderStatus::Inactive => OrderState::Inactive,
        GatewayOrderStatus::Rejected => OrderState::Rejected,
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionUpdate {
    pub gateway_id: String,
    pub status: ConnectionStatus,
}

#[derive(Clone, Debug)]
pub struct ExecutionUpdate {
    pub gateway_id: String,
    pub client_id: String,
    pub exec_id: String,
    /// OMS-assigned order reference; empty when the order is foreign.
    pub order_ref: String,
    /// The gateway's own order id; zero when unknown.
    pub broker_order_id: i64,
    pub is_buy: bool,
    pub symbol: String,
    pub filled: i64,
    pub avg_price: f64,
    pub cum_qty: i64,
    pub commission: Option<f64>,
    pub currency: Option<String>,
    pub timestamp: NaiveDateTime,
}

/// Price and size fields of the order as the gateway currently sees it.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrderSnapshot {
    pub quantity: i64,
    pub price: f64,
    pub stop_price: f64,
}

#[derive(Clone, Debug)]
pub struct OrderUpdate {
    pub gateway_id: String,
    pub client_id: String,
    pub order_ref: i64,
    pub status: GatewayOrderStatus,
    pub filled: i64,
    pub remaining: i64,
    /// True when replayed from history rather than a live event.
    pub is_historical: bool,
    pub order: OrderSnapshot,
}

#[derive(Clone, Debug)]
pub struct OpenOrder {
    pub gateway_id: String,
    pub order_ref: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct OpenOrdersSnapshot {
    pub gateway_id: String,
    pub client_id: String,
    pub open_orders: Vec<OpenOrder>,
}

#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub gateway_id: String,
    pub code: i64,
    pub message: String,
    /// Present when the error refers to a specific order.
    pub order_id: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct AccountUpdate {
    pub gateway_id: String,
    pub account_id: String,
    pub cash: f64,
    pub currency: String,
}

#[derive(Clone, Debug)]
pub struct PositionUpdate {
    pub gateway_id: String,
    pub symbol: String,
    pub position: i64,
}

/// Everything a gateway can report back. Gateways push these onto the core's
/// event channel; callbacks never touch shared state directly.
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    Connection(ConnectionUpdate),
    Execution(ExecutionUpdate),
    Order(OrderUpdate),
    OpenOrders(OpenOrdersSnapshot),
    Account(AccountUpdate),
    Position(PositionUpdate),
    Error(ErrorEvent),
}

/// Order-routing counterparty. Implementations are owned by a [`Broker`]
/// adapter and report events through the channel they were constructed with.
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;
    /// Identity stamped on this gateway's own events; events carrying a
    /// different client id did not originate here.
    fn identity(&self) -> &str;
    fn is_healthy(&self) -> bool;

    fn connect(&self) -> GatewayResult<()>;
    fn disconnect(&self);
    fn ping(&self) -> GatewayResult<()>;

    fn place_order(&self, order_ref: &str, order: &GatewayOrder) -> GatewayResult<()>;
    fn modify_order(&self, order_ref: &str, order: &GatewayOrder) -> GatewayResult<()>;
    fn cancel_order(&self, broker_order_id: i64) -> GatewayResult<()>;

    fn request_executions(&self);
    fn request_open_orders(&self);
}

/// Thin wrapper around one gateway: connection bookkeeping, reconnect pacing
/// and serialised sends.
pub struct Broker {
    gateway: Arc<dyn Gateway>,
    reconnect_interval_in_sec: i64,
    last_connection_try: Mutex<NaiveDateTime>,
    is_connected: AtomicBool,
    is_connecting: AtomicBool,
    send_lock: Mutex<()>,
}

impl Broker {
    pub fn new(cfg: &BrokerConfig, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            reconnect_interval_in_sec: cfg.reconnect_interval_in_sec,
            last_connection_try: Mutex::new(Utc::now().naive_utc()),
            is_connected: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            send_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.gateway.name()
    }

    pub fn identity(&self) -> &str {
        self.gateway.identity()
    }

    pub fn is_healthy(&self) -> bool {
        self.gateway.is_healthy()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting.load(Ordering::SeqCst)
    }

    pub fn reconnect_interval_in_sec(&self) -> i64 {
        self.reconnect_interval_in_sec
    }

    /// Toggle the connected flag. On the disconnected→connected edge, ask the
    /// gateway to replay executions and open orders so the core can reconcile
    /// anything missed.
    pub fn set_connected(&self, val: bool) {
        info!(target: "broker", broker = self.name(), connected = val, "set connected");
        let changed = self.is_connected.swap(val, Ordering::SeqCst) != val;
        if val && changed {
            self.gateway.request_executions();
            self.gateway.request_open_orders();
        }
    }

    pub fn connect(&self) {
        self.is_connecting.store(true, Ordering::SeqCst);
        let result = {
            let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.gateway.connect()
        };
        self.is_connecting.store(false, Ordering::SeqCst);
        if let Err(err) = result {
            error!(target: "broker", broker = self.name(), error = %err, "connect failed");
        }
    }

    pub fn disconnect(&self) {
        self.gateway.disconnect();
    }

    pub fn ping(&self) {
        let result = {
            let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.gateway.ping()
        };
        self.check_pipe(result);
    }

    pub fn place_order(&self, order_ref: &str, order: &GatewayOrder) -> bool {
        let result = {
            let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.gateway.place_order(order_ref, order)
        };
        self.check_pipe(result)
    }

    pub fn modify_order(&self, order_ref: &str, order: &GatewayOrder) -> bool {
        let result = {
            let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.gateway.modify_order(order_ref, order)
        };
        self.check_pipe(result)
    }

    pub fn cancel_order(&self, broker_order_id: i64) -> bool {
        let result = {
            let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.gateway.cancel_order(broker_order_id)
        };
        self.check_pipe(result)
    }

    pub fn is_time_to_reconnect(&self) -> bool {
        if self.reconnect_interval_in_sec <= 0 {
            return false;
        }
        let now = Utc::now().naive_utc();
        let mut last = self
            .last_connection_try
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *last + Duration::seconds(self.reconnect_interval_in_sec) < now {
            *last = now;
            return true;
        }
        false
    }

    fn check_pipe(&self, result: GatewayResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(GatewayError::BrokenPipe(msg)) => {
                error!(target: "broker", broker = self.name(), error = %msg, "broken pipe");
                self.set_connected(false);
                self.gateway.disconnect();
                false
            }
            Err(err) => {
                error!(target: "broker", broker = self.name(), error = %err, "gateway call failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimGateway;
    use super::*;
    use tokio::sync::mpsc;

    fn sim_broker() -> (Broker, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(SimGateway::new("sim", "oms-1", tx));
        let cfg = BrokerConfig {
            name: "sim".to_string(),
            kind: crate::types::BrokerKind::Sim,
            host: None,
            port: None,
            client_id: "oms-1".to_string(),
            reconnect_interval_in_sec: 10,
        };
        (Broker::new(&cfg, gateway), rx)
    }

    #[test]
    fn broken_pipe_marks_broker_disconnected() {
        let (broker, _rx) = sim_broker();
        broker.set_connected(true);
        assert!(broker.is_connected());

        // Pinging a gateway that was never connected raises a broken pipe.
        broker.disconnect();
        broker.ping();
        assert!(!broker.is_connected());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            order_state_from_status(GatewayOrderStatus::PartialFilled),
            OrderState::Active
        );
        assert_eq!(
            order_state_from_status(GatewayOrderStatus::Filled),
            OrderState::FullyFilled
        );
        assert_eq!(
            order_state_from_status(GatewayOrderStatus::Undefined),
            OrderState::Inactive
        );
    }
}
