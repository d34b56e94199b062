pub mod logic;
mod roll;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::broker::sim::SimGateway;
use crate::broker::{
    order_state_from_status, Broker, ConnectionStatus, ErrorEvent, ExecutionUpdate, Gateway,
    GatewayEvent, GatewayOrder, GatewayOrderStatus, OpenOrdersSnapshot, OrderUpdate, Tif,
};
use crate::domain::{Action, Comment, Direction, EntryState, OrderState, OrderType};
use crate::instruments::InstrumentRepository;
use crate::ledger::models::{ExecutionInsert, OrderInsert, OrderRow};
use crate::ledger::{EntryKey, EntryPatch, Ledger, OrderFilter, OrderPatch};
use crate::protocol::{self, ErrorCode, ExecutionItem, OmsMessage};
use crate::proxy::TransportFrame;
use crate::transport;
use crate::types::{AppConfig, BrokerKind, MessagingConfig};

use session::ClientSession;

/// Strategy name stamped on OMS-originated contract-roll orders.
pub const STRATEGY_NAME: &str = "OMS";

const PING_INTERVAL_SECS: i64 = 5;

/// Pending contract-roll orders plus the condition signalled when the set
/// drains.
pub(crate) struct RollTracker {
    pending: std::sync::Mutex<HashSet<i64>>,
    notify: Notify,
}

impl RollTracker {
    fn new() -> Self {
        Self {
            pending: std::sync::Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn clear(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub(crate) fn add(&self, broker_order_id: i64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(broker_order_id);
    }

    pub(crate) fn complete(&self, broker_order_id: i64) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let removed = pending.remove(&broker_order_id);
        if removed && pending.is_empty() {
            self.notify.notify_waiters();
        }
        removed
    }

    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
            {
                return;
            }
            notified.await;
        }
    }
}

/// The OMS core. Owns the brokers, the sessions and the ledger; a single
/// router task drains the worker socket and the broker event channel, so
/// every state mutation is serialised through it.
pub struct Oms {
    messaging: MessagingConfig,
    ledger: Ledger,
    instruments: InstrumentRepository,
    brokers: Vec<Arc<Broker>>,
    sessions: tokio::sync::Mutex<HashMap<String, ClientSession>>,
    outbound_tx: mpsc::UnboundedSender<TransportFrame>,
    outbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportFrame>>>,
    broker_events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<GatewayEvent>>>,
    request_id: AtomicI64,
    workers: Arc<Semaphore>,
    pub(crate) roll_tracker: RollTracker,
}

impl Oms {
    pub fn new(
        cfg: &AppConfig,
        ledger: Ledger,
        instruments: InstrumentRepository,
    ) -> anyhow::Result<Arc<Self>> {
        if cfg.brokers.is_empty() {
            anyhow::bail!("at least one broker must be configured");
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut names = HashSet::new();
        let mut brokers = Vec::new();
        for broker_cfg in &cfg.brokers {
            if !names.insert(broker_cfg.name.clone()) {
                anyhow::bail!("Broker {} is duplicated", broker_cfg.name);
            }
            let gateway: Arc<dyn Gateway> = match broker_cfg.kind {
                BrokerKind::Sim => Arc::new(SimGateway::new(
                    &broker_cfg.name,
                    &broker_cfg.client_id,
                    event_tx.clone(),
                )),
            };
            brokers.push(Arc::new(Broker::new(broker_cfg, gateway)));
        }

        let request_id = Self::generate_request_id();
        info!(target: "oms", request_id, "initial request ID");

        Ok(Arc::new(Self {
            messaging: cfg.messaging.clone(),
            ledger,
            instruments,
            brokers,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
            broker_events_rx: std::sync::Mutex::new(Some(event_rx)),
            request_id: AtomicI64::new(request_id),
            workers: Arc::new(Semaphore::new(cfg.messaging.num_of_workers.max(1))),
            roll_tracker: RollTracker::new(),
        }))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn instruments(&self) -> &InstrumentRepository {
        &self.instruments
    }

    pub fn is_ready(&self) -> bool {
        self.brokers.iter().all(|b| b.is_connected())
    }

    pub fn get_broker(&self) -> Option<Arc<Broker>> {
        self.brokers.iter().find(|b| b.is_healthy()).cloned()
    }

    fn broker_by_name(&self, name: &str) -> Option<&Arc<Broker>> {
        self.brokers.iter().find(|b| b.name() == name)
    }

    pub fn next_request_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn generate_request_id() -> i64 {
        let now = Utc::now().naive_utc();
        format!("{}00000", now.format("%y%m%d%H%M%S"))
            .parse()
            .unwrap_or(1)
    }

    /// Queue a message to a transport identity; the router loop drains the
    /// queue into the worker socket.
    pub fn publish_to(&self, src: &str, msg: &OmsMessage) {
        match protocol::encode_value(msg) {
            Ok(payload) => {
                let _ = self.outbound_tx.send(TransportFrame {
                    src: src.to_string(),
                    payload,
                });
            }
            Err(err) => {
                error!(target: "oms", error = %err, "failed to encode outbound message");
            }
        }
    }

    /// Resolve the front-month contract, pick a healthy broker and transmit.
    /// Returns the `(broker_id, broker_order_id)` pair recorded in the ledger.
    pub fn place_order(
        &self,
        market: &str,
        symbol: &str,
        order_type: OrderType,
        is_buy: bool,
        quantity: i64,
        price: f64,
        good_till: &str,
    ) -> Option<(String, i64)> {
        let order_symbol = self.instruments.order_symbol(market, symbol);
        if order_symbol != symbol {
            info!(
                target: "oms",
                symbol,
                front_month = %order_symbol,
                "front month contract substituted on outbound order"
            );
        }

        let broker = match self.get_broker() {
            Some(broker) => broker,
            None => {
                warn!(target: "oms", "cannot find any available broker");
                return None;
            }
        };

        let req_id = self.next_request_id();
        let outside_rth = matches!(order_type, OrderType::Stp | OrderType::StpLmt);
        let (limit_price, stop_price) = match order_type {
            OrderType::Mkt => (None, None),
            OrderType::Lmt => (Some(price), None),
            OrderType::Stp => (None, Some(price)),
            OrderType::StpLmt => (Some(price), Some(price)),
        };
        let tif = if good_till.is_empty() { Tif::Gtc } else { Tif::Gtd };

        let order = GatewayOrder {
            symbol: order_symbol,
            exchange: market.to_string(),
            order_type,
            is_buy,
            quantity,
            limit_price,
            stop_price,
            tif,
            outside_rth,
            good_till_date: good_till.to_string(),
        };
        info!(
            target: "oms",
            req_id,
            broker = broker.name(),
            symbol = %order.symbol,
            order_type = order_type.as_str(),
            is_buy,
            quantity,
            price,
            "send order to broker"
        );
        if broker.place_order(&req_id.to_string(), &order) {
            Some((broker.name().to_string(), req_id))
        } else {
            None
        }
    }

    /// Issue an OMS-originated stop order and record it against the session
    /// that triggered it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn place_stop(
        &self,
        session_id: &str,
        market: &str,
        symbol: &str,
        is_buy: bool,
        quantity: i64,
        price: f64,
        portfolio: &str,
        strategy: &str,
        parent_order_id: i64,
        comment: Option<Comment>,
    ) -> Option<i64> {
        if !self.is_ready() {
            warn!(
                target: "oms",
                session = session_id,
                symbol,
                "OMS is not ready, stop order was not sent"
            );
            return None;
        }

        let (broker_id, broker_order_id) =
            self.place_order(market, symbol, OrderType::Stp, is_buy, quantity, price, "")?;

        let insert = OrderInsert {
            session_id: session_id.to_string(),
            order_id: 0,
            parent_order_id,
            broker_id,
            broker_order_id,
            market: market.to_string(),
            symbol: symbol.to_string(),
            order_type: OrderType::Stp,
            is_buy,
            quantity,
            price,
            portfolio: portfolio.to_string(),
            action: Action::StopLoss,
            strategy: strategy.to_string(),
            reference: None,
            comment,
        };
        if self.ledger.insert_order(&insert).await.is_err() {
            return Some(broker_order_id);
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.values_mut().find(|s| s.id() == session_id) {
            session.notify_unsolicited_order(broker_order_id);
        }
        Some(broker_order_id)
    }

    /// Main router loop: drains the worker socket, the broker event channel
    /// and the periodic duties. Runs until the transport shuts down.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            target: "oms",
            workers = self.messaging.num_of_workers,
            "start listening"
        );

        for broker in &self.brokers {
            info!(target: "oms", broker = broker.name(), "connecting broker");
            self.dispatch_connect(broker.clone());
        }

        {
            let oms = self.clone();
            tokio::spawn(async move {
                oms.roll_contracts().await;
            });
        }

        let backend_url = format!("ws://{}", self.messaging.backend);
        info!(target: "oms", url = %backend_url, "connect to messaging proxy");
        let mut conn = transport::connect_with_retries(backend_url);
        let sender = conn.sender();

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("OMS run loop started twice"))?;
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match serde_json::to_string(&frame) {
                    Ok(raw) => {
                        debug!(target: "oms", src = %frame.src, "OMS sends");
                        let _ = sender.send(Message::Text(raw));
                    }
                    Err(err) => {
                        error!(target: "oms", error = %err, "failed to serialise outbound frame");
                    }
                }
            }
        });

        let mut broker_rx = self
            .broker_events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("OMS run loop started twice"))?;

        let mut housekeeping = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut last_ping = NaiveDateTime::MIN;

        loop {
            tokio::select! {
                maybe_frame = conn.receiver().recv() => {
                    match maybe_frame {
                        Some(Message::Text(text)) => self.handle_client_frame(&text).await,
                        Some(_) => {}
                        None => {
                            warn!(target: "oms", "worker socket closed, exiting run loop");
                            break;
                        }
                    }
                }
                maybe_event = broker_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_gateway_event(event).await,
                        None => {
                            warn!(target: "oms", "broker event channel closed, exiting run loop");
                            break;
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    self.housekeeping(&mut last_ping).await;
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!(target: "oms", "shutting down OMS");
        for broker in &self.brokers {
            info!(target: "oms", broker = broker.name(), "disconnecting broker");
            broker.disconnect();
        }
        self.ledger.close().await;
    }

    async fn handle_client_frame(&self, text: &str) {
        let frame: TransportFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "oms", error = %err, "dropping malformed transport frame");
                return;
            }
        };
        debug!(target: "oms", src = %frame.src, "OMS receives");

        let message = match protocol::decode_value(frame.payload) {
            Ok(message) => message,
            Err(err) => {
                error!(target: "oms", src = %frame.src, error = %err, "error decoding client message");
                return;
            }
        };
        let src = frame.src;

        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(&src) {
            match &message {
                OmsMessage::Init { session_id, .. } => {
                    if sessions.values().any(|s| s.id() == session_id) {
                        let reply = OmsMessage::Error {
                            error_code: ErrorCode::DuplicatedSessionId,
                            message: format!(
                                "An OMS client with same session ID {session_id} has logged in \
                                 already."
                            ),
                            session_id: None,
                            request_id: None,
                        };
                        self.publish_to(&src, &reply);
                        return;
                    }
                    let session = ClientSession::attach(session_id, &src, self).await;
                    info!(target: "oms", session = %session_id, src = %src, "create session");
                    sessions.insert(src.clone(), session);
                }
                OmsMessage::Heartbeat { .. } => {
                    info!(target: "oms", src = %src, "ignore heartbeat from non-logged in connection");
                    return;
                }
                other => {
                    info!(
                        target: "oms",
                        src = %src,
                        msg_type = other.msg_type(),
                        "message from non-logged in connection"
                    );
                    let reply = OmsMessage::Error {
                        error_code: ErrorCode::NotLoggedIn,
                        message: format!("No OMS client with source ID {src} is logged in"),
                        session_id: None,
                        request_id: None,
                    };
                    self.publish_to(&src, &reply);
                    return;
                }
            }
        }

        if let Some(session) = sessions.get_mut(&src) {
            if let Some(reply) = session.process(self, message).await {
                self.publish_to(&src, &reply);
            }
        }
    }

    async fn handle_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Connection(update) => {
                info!(target: "oms", gateway = %update.gateway_id, status = ?update.status, "broker connection update");
                if let Some(broker) = self.broker_by_name(&update.gateway_id) {
                    broker.set_connected(update.status == ConnectionStatus::Connected);
                }
            }
            GatewayEvent::Execution(update) => self.handle_execution(update).await,
            GatewayEvent::Order(update) => self.handle_order_update(update).await,
            GatewayEvent::OpenOrders(snapshot) => self.handle_open_order_end(snapshot).await,
            GatewayEvent::Error(error) => self.handle_broker_error(error).await,
            GatewayEvent::Account(update) => {
                debug!(target: "oms", gateway = %update.gateway_id, account = %update.account_id, "account info update");
            }
            GatewayEvent::Position(update) => {
                debug!(target: "oms", gateway = %update.gateway_id, symbol = %update.symbol, "position update");
            }
        }
    }

    async fn handle_execution(&self, event: ExecutionUpdate) {
        info!(
            target: "oms",
            gateway = %event.gateway_id,
            exec_id = %event.exec_id,
            order_ref = %event.order_ref,
            filled = event.filled,
            avg_price = event.avg_price,
            "handle execution"
        );

        let Some(broker) = self.broker_by_name(&event.gateway_id) else {
            warn!(target: "oms", gateway = %event.gateway_id, "execution from unknown broker");
            return;
        };
        if broker.identity() != event.client_id {
            info!(
                target: "oms",
                client_id = %event.client_id,
                "ignore execution update due to foreign client id"
            );
            return;
        }

        match self
            .ledger
            .query_executions(&event.gateway_id, Some(&event.exec_id))
            .await
        {
            Ok(existing) if !existing.is_empty() => {
                info!(
                    target: "oms",
                    exec_id = %event.exec_id,
                    "receive old execution, nothing needs to be done"
                );
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }

        if event.order_ref.is_empty() || event.broker_order_id == 0 {
            info!(
                target: "oms",
                exec_id = %event.exec_id,
                "skip unknown order, order reference or broker order ID not recognized"
            );
            return;
        }
        let order_ref: i64 = match event.order_ref.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(target: "oms", order_ref = %event.order_ref, "unparseable order reference");
                return;
            }
        };

        info!(target: "oms", exec_id = %event.exec_id, "process new execution");
        let insert = ExecutionInsert {
            broker_id: event.gateway_id.clone(),
            broker_order_id: order_ref,
            broker_execution_id: event.exec_id.clone(),
            gateway_order_id: Some(event.broker_order_id.to_string()),
            is_buy: event.is_buy,
            contract: event.symbol.clone(),
            quantity: event.filled,
            price: event.avg_price,
            leave_quantity: None,
            commission: event.commission,
            currency: event.currency.clone(),
            execution_datetime: event.timestamp,
        };
        if self.ledger.insert_execution(&insert).await.is_err() {
            return;
        }

        let orders = match self
            .ledger
            .query_order(&OrderFilter {
                broker_id: Some(event.gateway_id.clone()),
                broker_order_id: Some(order_ref),
                ..Default::default()
            })
            .await
        {
            Ok(orders) => orders,
            Err(_) => return,
        };
        if orders.len() != 1 {
            error!(
                target: "oms",
                order_ref,
                "cannot find the order with this broker order ID, unable to update position"
            );
            return;
        }
        let order = &orders[0];

        let direction = Direction::of_entry(event.is_buy);
        let position = direction.quantity_to_position(event.filled);
        let order_quantity = order.quantity;
        let fully_filled = order_quantity - event.cum_qty == 0;

        // Contract-roll orders only move the roll bookkeeping.
        if order.strategy == STRATEGY_NAME {
            info!(target: "oms", order_ref, "order was sent by OMS, no position update");
            if fully_filled && self.roll_tracker.complete(order_ref) {
                info!(target: "oms", order_ref, "roll order has been filled completely");
            }
            return;
        }

        let mut avg_price = event.avg_price;
        match self
            .ledger
            .query_position(
                Some(&order.portfolio),
                Some(&order.strategy),
                Some(&order.market),
                Some(&order.symbol),
            )
            .await
        {
            Ok(positions) => {
                if let Some(existing) = positions.first() {
                    if existing.position != 0 {
                        avg_price = logic::blended_avg_price(
                            existing.position,
                            existing.avg_price,
                            position,
                            event.avg_price,
                        );
                        info!(
                            target: "oms",
                            existing = existing.position,
                            existing_avg = existing.avg_price,
                            new_avg = avg_price,
                            "existing position found, computed new average price"
                        );
                    }
                }
            }
            Err(_) => return,
        }
        if self
            .ledger
            .update_position(
                &order.portfolio,
                &order.strategy,
                &order.market,
                &order.symbol,
                position,
                Some(avg_price),
            )
            .await
            .is_err()
        {
            return;
        }

        if fully_filled {
            // Defensive write in case no OrderUpdate arrives while the
            // gateway was disconnected.
            let _ = self
                .ledger
                .update_order(
                    &event.gateway_id,
                    order_ref,
                    &OrderPatch {
                        remaining_quantity: Some(0),
                        filled_quantity: Some(order_quantity),
                        state: Some(OrderState::FullyFilled),
                        ..Default::default()
                    },
                )
                .await;
        }

        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.values().find(|s| s.is_own_order(order_ref)) {
                info!(target: "oms", order_ref, session = session.id(), "order belongs to session");
                session.publish_execution(self, build_execution_item(&event, order));
                let _ = session.publish_position(self).await;
            }
        }

        if event.cum_qty == order_quantity {
            let action = match order.parsed_action() {
                Ok(action) => action,
                Err(err) => {
                    warn!(target: "oms", order_ref, error = %err, "order carries unknown action");
                    return;
                }
            };
            if action.is_entry() {
                self.synthesise_stop_for_entry(&event, order, order_ref).await;
            } else if action.is_exit() {
                self.handle_exit_filled(order).await;
            }
        }
    }

    /// A fully filled ENTRY gets a derived stop-loss on the front-month
    /// contract, sized to the entry and priced off the fill.
    async fn synthesise_stop_for_entry(
        &self,
        event: &ExecutionUpdate,
        order: &OrderRow,
        order_ref: i64,
    ) {
        info!(
            target: "oms",
            order_ref,
            exec_id = %event.exec_id,
            "entry order is fully filled, send stop-loss order"
        );

        let instrument = self.instruments.find(&order.market, &order.symbol);
        let tick_size = instrument.map(|i| i.tick_size);
        let mut comment = order.comment_bag();

        let Some(stop_price) =
            logic::stop_loss_price(order.is_buy, event.avg_price, &comment, tick_size)
        else {
            warn!(
                target: "oms",
                order_ref,
                "entry comment carries neither stop_loss_offset nor stop_loss_absolute"
            );
            return;
        };
        if comment.stop_loss_absolute().is_some() {
            info!(
                target: "oms",
                order_ref,
                stop_price,
                "absolute stop-loss overrides stop-loss with offset"
            );
        }
        comment.set_cost(event.avg_price);

        let stop_is_buy = !order.is_buy;
        self.place_stop(
            &order.session_id,
            &order.market,
            &order.symbol,
            stop_is_buy,
            order.quantity,
            stop_price,
            &order.portfolio,
            &order.strategy,
            order.order_id,
            Some(comment),
        )
        .await;

        let _ = self
            .ledger
            .update_position_by_entry(
                &EntryKey::Session {
                    session_id: order.session_id.clone(),
                    order_id: order.order_id,
                },
                &EntryPatch {
                    avg_price: Some(event.avg_price),
                    state: Some(EntryState::FullyFilled),
                    ..Default::default()
                },
            )
            .await;
    }

    /// Close the entry tickets covered by a filled EXIT: a referenced exit
    /// targets its own ticket, an unreferenced one walks the open tickets
    /// newest first.
    async fn handle_exit_filled(&self, order: &OrderRow) {
        let comment = order.comment_bag();
        if let Some(order_ref) = comment.order_reference() {
            let _ = self
                .ledger
                .update_position_by_entry(
                    &EntryKey::Reference {
                        portfolio_id: order.portfolio.clone(),
                        strategy: order.strategy.clone(),
                        order_reference: order_ref.to_string(),
                    },
                    &EntryPatch {
                        state: Some(EntryState::Exited),
                        ..Default::default()
                    },
                )
                .await;
            return;
        }

        let entries = match self
            .ledger
            .query_position_by_entry(&order.portfolio, &order.strategy, &order.market, &order.symbol)
            .await
        {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let lots: Vec<i64> = entries.iter().map(|e| e.position).collect();

        for step in logic::plan_exit_allocation(&lots, order.quantity) {
            match step {
                logic::ExitStep::Exit { index } => {
                    let entry = &entries[index];
                    let _ = self
                        .ledger
                        .update_position_by_entry(
                            &EntryKey::Session {
                                session_id: entry.session_id.clone(),
                                order_id: entry.order_id,
                            },
                            &EntryPatch {
                                state: Some(EntryState::Exited),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                logic::ExitStep::Reduce {
                    index,
                    new_position,
                } => {
                    let entry = &entries[index];
                    info!(
                        target: "oms",
                        current_position = entry.position,
                        new_position,
                        "partial exit on position by entry"
                    );
                    let _ = self
                        .ledger
                        .update_position_by_entry(
                            &EntryKey::Session {
                                session_id: entry.session_id.clone(),
                                order_id: entry.order_id,
                            },
                            &EntryPatch {
                                position: Some(new_position),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.replace_stop_after_partial_exit(order, entry, new_position)
                        .await;
                }
            }
        }
    }

    /// The resting stop matching a reduced entry is re-issued at the reduced
    /// quantity, same price, parented to the original stop.
    async fn replace_stop_after_partial_exit(
        &self,
        exit_order: &OrderRow,
        entry: &crate::ledger::models::PositionByEntryRow,
        new_position: i64,
    ) {
        let Some(lot_ref) = entry.order_reference.as_deref() else {
            return;
        };
        let stops = match self
            .ledger
            .query_order(&OrderFilter {
                portfolio: Some(exit_order.portfolio.clone()),
                strategy: Some(exit_order.strategy.clone()),
                order_type: Some(OrderType::Stp),
                order_by_created: true,
                ..Default::default()
            })
            .await
        {
            Ok(stops) => stops,
            Err(_) => return,
        };

        for stop in &stops {
            let stop_comment = stop.comment_bag();
            if stop_comment.order_reference() == Some(lot_ref) && stop.quantity == entry.position {
                self.place_stop(
                    &exit_order.session_id,
                    &exit_order.market,
                    &exit_order.symbol,
                    stop.is_buy,
                    new_position,
                    stop.price,
                    &exit_order.portfolio,
                    &exit_order.strategy,
                    stop.parent_order_id,
                    Some(stop_comment),
                )
                .await;
                info!(
                    target: "oms",
                    parent_order_id = stop.parent_order_id,
                    quantity = new_position,
                    "add new stop after partial exit"
                );
                break;
            }
        }
    }

    async fn handle_order_update(&self, event: OrderUpdate) {
        info!(
            target: "oms",
            gateway = %event.gateway_id,
            order_ref = event.order_ref,
            status = ?event.status,
            filled = event.filled,
            remaining = event.remaining,
            "handle order update"
        );

        let Some(broker) = self.broker_by_name(&event.gateway_id) else {
            warn!(target: "oms", gateway = %event.gateway_id, "order update from unknown broker");
            return;
        };
        if broker.identity() != event.client_id {
            info!(
                target: "oms",
                client_id = %event.client_id,
                "ignore order update due to foreign client id"
            );
            return;
        }

        let order_ref = event.order_ref;

        // A live cancellation of an entry LMT unwinds or finalises its ticket.
        if event.status == GatewayOrderStatus::Cancelled && !event.is_historical {
            if let Ok(orders) = self
                .ledger
                .query_order(&OrderFilter {
                    broker_id: Some(event.gateway_id.clone()),
                    broker_order_id: Some(order_ref),
                    order_type: Some(OrderType::Lmt),
                    action: Some(Action::Entry),
                    ..Default::default()
                })
                .await
            {
                if orders.len() == 1 {
                    let order = &orders[0];
                    if event.filled == 0 {
                        let _ = self
                            .ledger
                            .delete_position_by_entry(&order.session_id, order.order_id)
                            .await;
                        self.housekeep_expired_order(order_ref).await;
                    } else if event.remaining > 0 {
                        self.finalise_partial_fill(order_ref, &event.gateway_id, order, event.filled)
                            .await;
                    }
                }
            }
        }

        // Detect manual edits of a resting stop order.
        let mut order_action: Option<Action> = None;
        let mut price_for_update = event.order.price;
        if let Ok(stops) = self
            .ledger
            .query_order(&OrderFilter {
                broker_id: Some(event.gateway_id.clone()),
                broker_order_id: Some(order_ref),
                order_type: Some(OrderType::Stp),
                ..Default::default()
            })
            .await
        {
            if stops.len() == 1 {
                let stop = &stops[0];
                let stop_ref = stop.comment_bag().order_reference().map(str::to_string);
                if stop_ref.is_none() {
                    warn!(
                        target: "oms",
                        order_ref,
                        "cannot find order_reference in stop order comment"
                    );
                }

                // Ledger rows for stop orders keep the stop price in the
                // price column.
                let new_stop_price = event.order.stop_price;
                price_for_update = new_stop_price;

                if (stop.price - new_stop_price).abs() > 1e-9 {
                    info!(
                        target: "oms",
                        order_ref,
                        old_price = stop.price,
                        new_price = new_stop_price,
                        "price of the STOP order has been changed, mark as manual-stop"
                    );
                    order_action = Some(Action::ManualStopLoss);
                    if let Some(order_reference) = &stop_ref {
                        let _ = self
                            .ledger
                            .insert_operation(
                                &stop.portfolio,
                                &stop.strategy,
                                Action::Amend,
                                0,
                                order_reference,
                                Some(new_stop_price),
                                Some(&event.gateway_id),
                            )
                            .await;
                    }
                }

                if stop.quantity != event.order.quantity {
                    info!(
                        target: "oms",
                        order_ref,
                        old_quantity = stop.quantity,
                        new_quantity = event.order.quantity,
                        "quantity of the STOP order has been changed, position will be updated"
                    );
                    let sessions = self.sessions.lock().await;
                    if let Some(session) = sessions.values().find(|s| s.is_own_order(order_ref)) {
                        debug!(target: "oms", order_ref, session = session.id(), "order belongs to session");
                        order_action = Some(Action::ManualStopLoss);
                        let direction: i64 = if stop.is_buy { -1 } else { 1 };
                        let adjustment = event.order.quantity - stop.quantity;
                        let _ = self
                            .ledger
                            .update_position(
                                &stop.portfolio,
                                &stop.strategy,
                                &stop.market,
                                &stop.symbol,
                                adjustment * direction,
                                None,
                            )
                            .await;
                        if let Some(order_reference) = &stop_ref {
                            let manual_action = if event.order.quantity < stop.quantity {
                                Action::Reduce
                            } else {
                                Action::Increase
                            };
                            let _ = self
                                .ledger
                                .insert_operation(
                                    &stop.portfolio,
                                    &stop.strategy,
                                    manual_action,
                                    adjustment,
                                    order_reference,
                                    None,
                                    Some(&event.gateway_id),
                                )
                                .await;
                        }
                        let _ = session.publish_position_renew(self).await;
                    } else {
                        error!(target: "oms", order_ref, "cannot find any session owning the order");
                    }
                }
            }
        }

        let _ = self
            .ledger
            .update_order(
                &event.gateway_id,
                order_ref,
                &OrderPatch {
                    quantity: Some(event.order.quantity),
                    price: Some(price_for_update),
                    remaining_quantity: Some(event.remaining),
                    filled_quantity: Some(event.filled),
                    state: Some(order_state_from_status(event.status)),
                    action: order_action,
                },
            )
            .await;
    }

    /// Treat a partially filled LMT entry as a fully filled order of the
    /// traded size at the original limit price. Idempotent: the path can be
    /// reached from both OrderUpdate and an OpenOrders snapshot.
    async fn finalise_partial_fill(
        &self,
        order_ref: i64,
        broker_id: &str,
        order: &OrderRow,
        traded: i64,
    ) {
        if matches!(order.parsed_state(), Ok(OrderState::FullyFilled)) {
            return;
        }

        if self
            .ledger
            .update_order(
                broker_id,
                order_ref,
                &OrderPatch {
                    quantity: Some(traded),
                    remaining_quantity: Some(0),
                    filled_quantity: Some(traded),
                    state: Some(OrderState::FullyFilled),
                    ..Default::default()
                },
            )
            .await
            .is_err()
        {
            return;
        }

        let _ = self
            .ledger
            .update_position_by_entry(
                &EntryKey::Session {
                    session_id: order.session_id.clone(),
                    order_id: order.order_id,
                },
                &EntryPatch {
                    position: Some(traded),
                    avg_price: Some(order.price),
                    state: Some(EntryState::FullyFilled),
                    ..Default::default()
                },
            )
            .await;

        {
            let sessions = self.sessions.lock().await;
            if !sessions.values().any(|s| s.is_own_order(order_ref)) {
                warn!(target: "oms", order_ref, "failed to find the session owning the order");
                return;
            }
        }

        self.place_stop(
            &order.session_id,
            &order.market,
            &order.symbol,
            !order.is_buy,
            traded,
            order.price,
            &order.portfolio,
            &order.strategy,
            order.parent_order_id,
            Some(order.comment_bag()),
        )
        .await;

        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.values().find(|s| s.is_own_order(order_ref)) {
            let _ = session.publish_position_renew(self).await;
        }
    }

    /// Reconcile ledger-open entry orders against the broker's open-orders
    /// snapshot; anything the broker no longer shows was cancelled without a
    /// callback.
    async fn handle_open_order_end(&self, snapshot: OpenOrdersSnapshot) {
        info!(
            target: "oms",
            gateway = %snapshot.gateway_id,
            count = snapshot.open_orders.len(),
            "open orders snapshot"
        );

        let Some(broker) = self.broker_by_name(&snapshot.gateway_id) else {
            return;
        };
        if broker.identity() != snapshot.client_id {
            info!(
                target: "oms",
                client_id = %snapshot.client_id,
                "ignore open orders snapshot due to foreign client id"
            );
            return;
        }

        let available: HashSet<(String, i64)> = snapshot
            .open_orders
            .iter()
            .filter_map(|o| o.order_ref.map(|r| (o.gateway_id.clone(), r)))
            .collect();

        let orders = match self
            .ledger
            .query_order(&OrderFilter {
                broker_id: Some(snapshot.gateway_id.clone()),
                order_type: Some(OrderType::Lmt),
                action: Some(Action::Entry),
                active_orders_only: true,
                ..Default::default()
            })
            .await
        {
            Ok(orders) => orders,
            Err(_) => return,
        };

        for order in logic::missing_open_orders(&orders, &available) {
            if order.filled_quantity == 0 {
                let _ = self
                    .ledger
                    .update_order(
                        &snapshot.gateway_id,
                        order.broker_order_id,
                        &OrderPatch {
                            state: Some(OrderState::Cancelled),
                            ..Default::default()
                        },
                    )
                    .await;
                let _ = self
                    .ledger
                    .delete_position_by_entry(&order.session_id, order.order_id)
                    .await;
                self.housekeep_expired_order(order.broker_order_id).await;
            } else if order.remaining_quantity > 0 {
                self.finalise_partial_fill(
                    order.broker_order_id,
                    &snapshot.gateway_id,
                    order,
                    order.filled_quantity,
                )
                .await;
            }
        }
    }

    /// Tell the owning strategy the order was cancelled so it can revert its
    /// projected position.
    async fn housekeep_expired_order(&self, order_ref: i64) {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.values().find(|s| s.is_own_order(order_ref)) else {
            warn!(target: "oms", order_ref, "failed to find the session owning the order");
            return;
        };
        let Some(session_order_id) = session.find_session_order_id(order_ref) else {
            warn!(target: "oms", order_ref, "failed to find the session order id");
            return;
        };
        session.publish_order_rejected(self, session_order_id, "Order Cancelled");
    }

    async fn handle_broker_error(&self, event: ErrorEvent) {
        info!(
            target: "oms",
            gateway = %event.gateway_id,
            code = event.code,
            order_id = ?event.order_id,
            "handle broker error: {}",
            event.message
        );

        match event.order_id {
            Some(order_id) => match logic::classify_order_error(event.code) {
                logic::OrderErrorDisposition::MarkInactive => {
                    let _ = self
                        .ledger
                        .update_order(
                            &event.gateway_id,
                            order_id,
                            &OrderPatch {
                                state: Some(OrderState::Inactive),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                logic::OrderErrorDisposition::RejectEntry => {
                    let sessions = self.sessions.lock().await;
                    let Some(session) = sessions.values().find(|s| s.is_own_order(order_id)) else {
                        return;
                    };
                    info!(target: "oms", order_id, session = session.id(), "order belongs to session");
                    let Some(session_order_id) = session.find_session_order_id(order_id) else {
                        return;
                    };
                    let entry_orders = self
                        .ledger
                        .query_order(&OrderFilter {
                            broker_id: Some(event.gateway_id.clone()),
                            broker_order_id: Some(order_id),
                            action: Some(Action::Entry),
                            ..Default::default()
                        })
                        .await
                        .unwrap_or_default();
                    if entry_orders.len() == 1 {
                        // Remove the position-by-entry record of the rejected
                        // entry order.
                        let _ = self
                            .ledger
                            .delete_position_by_entry(session.id(), session_order_id)
                            .await;
                    }
                    // The reject triggers the strategy client to reset its
                    // projected position.
                    session.publish_order_rejected(self, session_order_id, &event.message);
                }
                _ => {
                    let sessions = self.sessions.lock().await;
                    if let Some(session) = sessions.values().find(|s| s.is_own_order(order_id)) {
                        session.publish_order_error(self, order_id, &event.message);
                    }
                }
            },
            None => match logic::classify_order_error(event.code) {
                logic::OrderErrorDisposition::DisconnectBroker => {
                    if let Some(broker) = self.broker_by_name(&event.gateway_id) {
                        broker.set_connected(false);
                    }
                }
                logic::OrderErrorDisposition::ReconnectBroker => {
                    if let Some(broker) = self.broker_by_name(&event.gateway_id) {
                        broker.set_connected(true);
                    }
                }
                _ => {}
            },
        }
    }

    async fn housekeeping(&self, last_ping: &mut NaiveDateTime) {
        let now = Utc::now().naive_utc();

        for broker in &self.brokers {
            if !broker.is_connected() && broker.is_time_to_reconnect() {
                if broker.is_connecting() {
                    info!(target: "oms", broker = broker.name(), "broker is already trying to reconnect");
                } else {
                    info!(
                        target: "oms",
                        broker = broker.name(),
                        retry_interval = broker.reconnect_interval_in_sec(),
                        "try to reconnect broker"
                    );
                    self.dispatch_connect(broker.clone());
                }
            } else if broker.is_connected()
                && now - *last_ping > ChronoDuration::seconds(PING_INTERVAL_SECS)
            {
                *last_ping = now;
                self.dispatch_ping(broker.clone());
            }
        }

        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired())
            .map(|(src, _)| src.clone())
            .collect();
        for src in expired {
            if let Some(mut session) = sessions.remove(&src) {
                warn!(
                    target: "oms",
                    session = session.id(),
                    src = %src,
                    "lost heartbeat from client, disconnecting"
                );
                session.disconnect();
            }
        }

        for session in sessions.values_mut() {
            if session.is_heartbeat_due() {
                session.send_heartbeat(self);
            }
            if session.require_stop_check() {
                match session.validate_stop_orders(self).await {
                    Ok(Some(mismatch)) => {
                        // Not sent to the client; strategies only handle
                        // order rejects.
                        warn!(target: "oms", session = session.id(), "{mismatch}");
                    }
                    Ok(None) | Err(_) => {}
                }
            }
        }
    }

    fn dispatch_connect(&self, broker: Arc<Broker>) {
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let _ = tokio::task::spawn_blocking(move || broker.connect()).await;
        });
    }

    fn dispatch_ping(&self, broker: Arc<Broker>) {
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let _ = tokio::task::spawn_blocking(move || broker.ping()).await;
        });
    }
}

fn build_execution_item(event: &ExecutionUpdate, order: &OrderRow) -> ExecutionItem {
    ExecutionItem {
        order_id: order.order_id,
        execution_id: event.exec_id.clone(),
        execution_time: protocol::wire_timestamp(event.timestamp),
        market: order.market.clone(),
        symbol: order.symbol.clone(),
        is_buy: order.is_buy,
        quantity: event.filled,
        price: event.avg_price,
        remaining_quantity: order.quantity - event.cum_qty,
        portfolio: order.portfolio.clone(),
        strategy: order.strategy.clone(),
        action: order.parsed_action().unwrap_or(Action::Entry),
        reference: order.reference.clone(),
        comment: order.comment.as_deref().and_then(Comment::from_json_str),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_tracker_drains() {
        let tracker = RollTracker::new();
        tracker.add(1);
        tracker.add(2);
        assert!(tracker.complete(1));
        assert!(!tracker.complete(1));
        assert!(tracker.complete(2));
    }

    #[tokio::test]
    async fn roll_tracker_wait_returns_when_empty() {
        let tracker = Arc::new(RollTracker::new());
        // Nothing pending: the wait returns immediately.
        tracker.wait_drained().await;

        tracker.add(7);
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_drained().await })
        };
        tokio::task::yield_now().await;
        tracker.complete(7);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[test]
    fn generated_request_id_is_timestamp_shaped() {
        let id = Oms::generate_request_id();
        // yymmddHHMMSS followed by five zeros
        assert!(id > 10_000_000_000_000_000);
        assert_eq!(id % 100_000, 0);
    }
}
