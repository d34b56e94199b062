use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::domain::OrderType;

use super::{
    ConnectionStatus, ConnectionUpdate, ExecutionUpdate, Gateway, GatewayError, GatewayEvent,
    GatewayOrder, GatewayOrderStatus, GatewayResult, OpenOrder, OpenOrdersSnapshot, OrderSnapshot,
    OrderUpdate,
};

struct RestingOrder {
    order: GatewayOrder,
    status: GatewayOrderStatus,
    filled: i64,
}

/// In-process gateway that acknowledges everything and fills marketable
/// orders immediately at the configured last price. Stop orders rest until
/// cancelled or released with [`SimGateway::fill_resting`].
pub struct SimGateway {
    name: String,
    identity: String,
    connected: AtomicBool,
    events: UnboundedSender<GatewayEvent>,
    last_prices: Mutex<HashMap<String, f64>>,
    orders: Mutex<HashMap<i64, RestingOrder>>,
    exec_seq: AtomicU64,
}

impl SimGateway {
    pub fn new(name: &str, identity: &str, events: UnboundedSender<GatewayEvent>) -> Self {
        Self {
            name: name.to_string(),
            identity: identity.to_string(),
            connected: AtomicBool::new(false),
            events,
            last_prices: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            exec_seq: AtomicU64::new(1),
        }
    }

    pub fn set_last_price(&self, symbol: &str, price: f64) {
        self.last_prices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), price);
    }

    pub fn open_order_ids(&self) -> Vec<i64> {
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o.status,
                    GatewayOrderStatus::Submitted | GatewayOrderStatus::PartialFilled
                )
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Release a resting order as a full fill at `price`. Used to simulate a
    /// stop trigger.
    pub fn fill_resting(&self, order_id: i64, price: f64) {
        let order = {
            let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
            match orders.get_mut(&order_id) {
                Some(resting) => {
                    resting.status = GatewayOrderStatus::Filled;
                    resting.filled = resting.order.quantity;
                    resting.order.clone()
                }
                None => return,
            }
        };
        self.emit_fill(order_id, &order, price);
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(order: &GatewayOrder) -> OrderSnapshot {
        OrderSnapshot {
            quantity: order.quantity,
            price: order.limit_price.unwrap_or(0.0),
            stop_price: order.stop_price.unwrap_or(0.0),
        }
    }

    fn emit_order_update(&self, order_ref: i64, order: &GatewayOrder, status: GatewayOrderStatus, filled: i64) {
        self.emit(GatewayEvent::Order(OrderUpdate {
            gateway_id: self.name.clone(),
            client_id: self.identity.clone(),
            order_ref,
            status,
            filled,
            remaining: order.quantity - filled,
            is_historical: false,
            order: Self::snapshot(order),
        }));
    }

    fn emit_fill(&self, order_ref: i64, order: &GatewayOrder, price: f64) {
        let seq = self.exec_seq.fetch_add(1, Ordering::SeqCst);
        self.emit(GatewayEvent::Execution(ExecutionUpdate {
            gateway_id: self.name.clone(),
            client_id: self.identity.clone(),
            exec_id: format!("sim-{seq}"),
            order_ref: order_ref.to_string(),
            broker_order_id: order_ref,
            is_buy: order.is_buy,
            symbol: order.symbol.clone(),
            filled: order.quantity,
            avg_price: price,
            cum_qty: order.quantity,
            commission: Some(0.0),
            currency: Some("USD".to_string()),
            timestamp: Utc::now().naive_utc(),
        }));
        self.emit_order_update(order_ref, order, GatewayOrderStatus::Filled, order.quantity);
    }

    fn fill_price(&self, order: &GatewayOrder) -> f64 {
        let last = self
            .last_prices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&order.symbol)
            .copied();
        match order.order_type {
            OrderType::Lmt | OrderType::StpLmt => order.limit_price.or(last).unwrap_or(0.0),
            OrderType::Mkt => last.or(order.limit_price).unwrap_or(0.0),
            OrderType::Stp => order.stop_price.or(last).unwrap_or(0.0),
        }
    }

    fn require_connected(&self) -> GatewayResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::BrokenPipe(format!(
                "sim gateway {} is not connected",
                self.name
            )))
        }
    }
}

impl Gateway for SimGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&self) -> GatewayResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(GatewayEvent::Connection(ConnectionUpdate {
            gateway_id: self.name.clone(),
            status: ConnectionStatus::Connected,
        }));
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(GatewayEvent::Connection(ConnectionUpdate {
                gateway_id: self.name.clone(),
                status: ConnectionStatus::Disconnected,
            }));
        }
    }

    fn ping(&self) -> GatewayResult<()> {
        self.require_connected()
    }

    fn place_order(&self, order_ref: &str, order: &GatewayOrder) -> GatewayResult<()> {
        self.require_connected()?;
        let id: i64 = order_ref
            .parse()
            .map_err(|_| GatewayError::Other(format!("bad order reference '{order_ref}'")))?;

        debug!(target: "broker", gateway = %self.name, order_ref = id, symbol = %order.symbol, "sim accepts order");
        self.orders.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            RestingOrder {
                order: order.clone(),
                status: GatewayOrderStatus::Submitted,
                filled: 0,
            },
        );
        self.emit_order_update(id, order, GatewayOrderStatus::Submitted, 0);

        // Marketable orders fill in full straight away; stops rest.
        if matches!(order.order_type, OrderType::Mkt | OrderType::Lmt) {
            let price = self.fill_price(order);
            {
                let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(resting) = orders.get_mut(&id) {
                    resting.status = GatewayOrderStatus::Filled;
                    resting.filled = order.quantity;
                }
            }
            self.emit_fill(id, order, price);
        }
        Ok(())
    }

    fn modify_order(&self, order_ref: &str, order: &GatewayOrder) -> GatewayResult<()> {
        self.require_connected()?;
        let id: i64 = order_ref
            .parse()
            .map_err(|_| GatewayError::Other(format!("bad order reference '{order_ref}'")))?;
        {
            let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(resting) = orders.get_mut(&id) {
                resting.order = order.clone();
            }
        }
        self.emit_order_update(id, order, GatewayOrderStatus::Submitted, 0);
        Ok(())
    }

    fn cancel_order(&self, broker_order_id: i64) -> GatewayResult<()> {
        self.require_connected()?;
        let cancelled = {
            let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
            orders.get_mut(&broker_order_id).map(|resting| {
                resting.status = GatewayOrderStatus::Cancelled;
                (resting.order.clone(), resting.filled)
            })
        };
        if let Some((order, filled)) = cancelled {
            self.emit_order_update(broker_order_id, &order, GatewayOrderStatus::Cancelled, filled);
        }
        Ok(())
    }

    fn request_executions(&self) {
        // The sim keeps no execution history to replay.
    }

    fn request_open_orders(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let open_orders = self
            .open_order_ids()
            .into_iter()
            .map(|id| OpenOrder {
                gateway_id: self.name.clone(),
                order_ref: Some(id),
            })
            .collect();
        self.emit(GatewayEvent::OpenOrders(OpenOrdersSnapshot {
            gateway_id: self.name.clone(),
            client_id: self.identity.clone(),
            open_orders,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Tif;
    use tokio::sync::mpsc;

    fn order(order_type: OrderType, is_buy: bool, quantity: i64) -> GatewayOrder {
        GatewayOrder {
            symbol: "NQZ5".to_string(),
            exchange: "CME".to_string(),
            order_type,
            is_buy,
            quantity,
            limit_price: None,
            stop_price: Some(7290.0),
            tif: Tif::Gtc,
            outside_rth: true,
            good_till_date: String::new(),
        }
    }

    #[test]
    fn market_order_fills_at_last_price() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gw = SimGateway::new("sim", "oms-1", tx);
        gw.connect().unwrap();
        gw.set_last_price("NQZ5", 7300.0);

        gw.place_order("11", &order(OrderType::Mkt, true, 1)).unwrap();

        // connection, submitted, execution, filled
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Connection(_)));
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Order(u) if u.status == GatewayOrderStatus::Submitted));
        match rx.try_recv().unwrap() {
            GatewayEvent::Execution(exec) => {
                assert_eq!(exec.avg_price, 7300.0);
                assert_eq!(exec.cum_qty, 1);
                assert_eq!(exec.broker_order_id, 11);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Order(u) if u.status == GatewayOrderStatus::Filled));
    }

    #[test]
    fn stop_orders_rest_until_released() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gw = SimGateway::new("sim", "oms-1", tx);
        gw.connect().unwrap();

        gw.place_order("21", &order(OrderType::Stp, false, 1)).unwrap();
        assert_eq!(gw.open_order_ids(), vec![21]);

        let _ = rx.try_recv(); // connection
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Order(u) if u.status == GatewayOrderStatus::Submitted));
        assert!(rx.try_recv().is_err());

        gw.fill_resting(21, 7290.0);
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Execution(_)));
        assert!(gw.open_order_ids().is_empty());
    }

    #[test]
    fn disconnected_gateway_raises_broken_pipe() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let gw = SimGateway::new("sim", "oms-1", tx);
        let err = gw.place_order("1", &order(OrderType::Mkt, true, 1));
        assert!(matches!(err, Err(GatewayError::BrokenPipe(_))));
    }
}
