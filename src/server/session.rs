use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::{Action, Comment, OrderType};
use crate::ledger::models::OrderInsert;
use crate::ledger::{LedgerResult, OrderFilter};
use crate::protocol::{
    self, ErrorCode, ExecutionItem, Heartbeat, OmsMessage, OperationItem, OrderItem,
    PositionAccount, PositionByEntryItem, PositionItem, PositionPortfolio,
};
use crate::server::logic;

use super::Oms;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    LoggedIn,
    Disconnected,
}

/// Per-client state: login, heartbeat, request-id sequence and order
/// ownership. Sessions are owned by the core's router task, so no internal
/// locking is needed.
pub struct ClientSession {
    state: SessionState,
    session_id: String,
    src_id: String,
    account_id: Option<String>,
    next_request_id: Option<i64>,
    /// session_order_id -> broker_order_id for solicited orders.
    orders: HashMap<i64, i64>,
    /// Broker order ids the OMS issued on this session's behalf.
    unsolicited_orders: Vec<i64>,
    last_heartbeat_from_client: Option<NaiveDateTime>,
    next_heartbeat: NaiveDateTime,
    last_stopcheck: NaiveDateTime,
}

impl ClientSession {
    /// Create a session and adopt any outstanding orders the ledger still
    /// holds for this session id.
    pub async fn attach(session_id: &str, src_id: &str, oms: &Oms) -> Self {
        let mut session = Self {
            state: SessionState::New,
            session_id: session_id.to_string(),
            src_id: src_id.to_string(),
            account_id: None,
            next_request_id: None,
            orders: HashMap::new(),
            unsolicited_orders: Vec::new(),
            last_heartbeat_from_client: None,
            next_heartbeat: Utc::now().naive_utc(),
            last_stopcheck: Utc::now().naive_utc(),
        };

        let filter = OrderFilter {
            session_id: Some(session_id.to_string()),
            active_orders_only: true,
            ..Default::default()
        };
        match oms.ledger().query_order(&filter).await {
            Ok(orders) if !orders.is_empty() => {
                info!(
                    target: "session",
                    session = session_id,
                    count = orders.len(),
                    "found outstanding order(s), assigning back to the session"
                );
                for order in orders {
                    if order.order_id == 0 {
                        session.unsolicited_orders.push(order.broker_order_id);
                    } else {
                        session.orders.insert(order.order_id, order.broker_order_id);
                    }
                    debug!(
                        target: "session",
                        session = session_id,
                        order_id = order.order_id,
                        broker_order_id = order.broker_order_id,
                        "adopted order"
                    );
                }
            }
            Ok(_) => {
                info!(target: "session", session = session_id, "no outstanding order(s) found");
            }
            Err(_) => {
                warn!(target: "session", session = session_id, "could not load outstanding orders");
            }
        }
        session
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn src_id(&self) -> &str {
        &self.src_id
    }

    pub fn account(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::LoggedIn
    }

    pub fn is_expired(&self) -> bool {
        Heartbeat::is_expired(self.last_heartbeat_from_client)
    }

    pub fn is_heartbeat_due(&self) -> bool {
        Utc::now().naive_utc() > self.next_heartbeat
    }

    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }

    pub fn is_own_order(&self, broker_order_id: i64) -> bool {
        self.find_session_order_id(broker_order_id).is_some()
    }

    pub fn find_session_order_id(&self, broker_order_id: i64) -> Option<i64> {
        for (session_order_id, bid) in &self.orders {
            if *bid == broker_order_id {
                return Some(*session_order_id);
            }
        }
        if self.unsolicited_orders.contains(&broker_order_id) {
            return Some(0);
        }
        None
    }

    pub fn notify_unsolicited_order(&mut self, broker_order_id: i64) {
        self.unsolicited_orders.push(broker_order_id);
    }

    /// Route one inbound message. The returned message, if any, is the direct
    /// reply for the requesting connection.
    pub async fn process(&mut self, oms: &Oms, message: OmsMessage) -> Option<OmsMessage> {
        if message.carries_request_id() {
            if let Err(err) = oms.ledger().increment_next_request_id(&self.session_id).await {
                error!(target: "session", session = %self.session_id, error = %err, "request id bump failed");
            }
        }

        match message {
            OmsMessage::Init {
                session_id: _,
                account_id,
                strategies,
            } => match self.process_init(oms, &account_id, &strategies).await {
                Ok(reply) => Some(reply),
                Err(err) => {
                    error!(target: "session", session = %self.session_id, error = %err, "init aborted");
                    None
                }
            },
            OmsMessage::NextRequestId { .. } => None,
            OmsMessage::Heartbeat { .. } => {
                self.last_heartbeat_from_client = Some(Utc::now().naive_utc());
                debug!(target: "session", session = %self.session_id, "received heartbeat from client");
                None
            }
            other => {
                if !self.is_logged_in() {
                    return Some(self.build_error_reply(
                        ErrorCode::NotLoggedIn,
                        "Session is not logged in yet",
                        None,
                    ));
                }
                if let Some(reply) = self.check_next_request_id(other.request_id()) {
                    return Some(reply);
                }
                match other {
                    OmsMessage::NewOrder {
                        request_id,
                        market,
                        symbol,
                        order_type,
                        is_buy,
                        quantity,
                        price,
                        portfolio,
                        action,
                        strategy,
                        reference,
                        comment,
                    } => {
                        if let Err(err) = self
                            .place_order(
                                oms, request_id, &market, &symbol, is_buy, order_type, quantity,
                                price, &portfolio, action, &strategy, reference, comment, None,
                            )
                            .await
                        {
                            error!(target: "session", session = %self.session_id, error = %err, "order placement aborted");
                        }
                        None
                    }
                    OmsMessage::Position { request_id, .. } => {
                        match self.build_position_message(oms, request_id, false).await {
                            Ok(reply) => Some(reply),
                            Err(err) => {
                                error!(target: "session", session = %self.session_id, error = %err, "position reply aborted");
                                None
                            }
                        }
                    }
                    unknown => Some(self.build_error_reply(
                        ErrorCode::SystemError,
                        &format!("Unknown message type {} received", unknown.msg_type()),
                        None,
                    )),
                }
            }
        }
    }

    async fn process_init(
        &mut self,
        oms: &Oms,
        account_id: &str,
        strategies: &std::collections::BTreeMap<String, String>,
    ) -> LedgerResult<OmsMessage> {
        if self.state != SessionState::New {
            return Ok(self.build_error_reply(
                ErrorCode::AlreadyLoggedIn,
                &format!("Session {} is logged in already", self.session_id),
                None,
            ));
        }

        let ledger = oms.ledger();
        let account = match ledger.query_account(account_id).await? {
            Some(account) => account,
            None => {
                self.invalidate();
                return Ok(self.build_error_reply(
                    ErrorCode::InitError,
                    &format!("Account {account_id} not found in OMS"),
                    None,
                ));
            }
        };
        self.account_id = Some(account.id.clone());
        info!(target: "session", session = %self.session_id, account = %account.id, "session associated with account");

        for (strategy, portfolio) in strategies {
            if !ledger
                .verify_account_portfolio_strategy(&account.id, portfolio, strategy)
                .await?
            {
                warn!(target: "session", strategy = %strategy, "strategy not found in OMS database, adding it");
                ledger.insert_strategy(strategy).await?;
            }
            if !ledger
                .verify_account_portfolio_strategy(&account.id, portfolio, strategy)
                .await?
            {
                let msg = format!(
                    "Either account: {account_id}/portfolio: {portfolio}/strategy: {strategy} \
                     doesn't exist in OMS database"
                );
                error!(target: "session", session = %self.session_id, "{msg}");
                self.invalidate();
                return Ok(self.build_error_reply(ErrorCode::InitError, &msg, None));
            }
        }

        self.last_heartbeat_from_client = Some(Utc::now().naive_utc());
        let next_request_id = match ledger.query_session(&self.session_id).await? {
            Some(row) => {
                info!(
                    target: "session",
                    session = %self.session_id,
                    next_request_id = row.next_request_id,
                    "found session, returning stored next request ID"
                );
                row.next_request_id
            }
            None => {
                info!(target: "session", session = %self.session_id, "new session ID, adding record");
                ledger.insert_session(&self.session_id).await?;
                1
            }
        };
        self.next_request_id = Some(next_request_id);
        self.state = SessionState::LoggedIn;
        Ok(OmsMessage::NextRequestId { next_request_id })
    }

    fn check_next_request_id(&self, request_id: Option<i64>) -> Option<OmsMessage> {
        let (request_id, next) = (request_id?, self.next_request_id?);
        if request_id < next {
            return Some(self.build_error_reply(
                ErrorCode::BadRequestId,
                &format!("Request ID received {request_id} < {next}"),
                Some(request_id),
            ));
        }
        None
    }

    /// Place an order on the session's behalf after the policy checks: OMS
    /// readiness, account/portfolio/strategy validity and the optional
    /// long-only/short-only constraint. EXIT orders first pull their resting
    /// stop orders.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &mut self,
        oms: &Oms,
        session_order_id: i64,
        market: &str,
        symbol: &str,
        is_buy: bool,
        order_type: OrderType,
        quantity: i64,
        price: f64,
        portfolio: &str,
        action: Action,
        strategy: &str,
        reference: Option<String>,
        comment: Comment,
        session_parent_order_id: Option<i64>,
    ) -> LedgerResult<()> {
        if !oms.is_ready() {
            self.publish_order_rejected(oms, session_order_id, "Gateway is down");
            return Ok(());
        }

        let account = self.account_id.clone().unwrap_or_default();
        if !oms
            .ledger()
            .verify_account_portfolio_strategy(&account, portfolio, strategy)
            .await?
        {
            self.publish_order_rejected(
                oms,
                session_order_id,
                &format!(
                    "Either account: {account}/portfolio: {portfolio}/strategy: {strategy} \
                     doesn't exist in OMS database"
                ),
            );
            return Ok(());
        }

        if let Err(err) = comment.validate() {
            self.publish_order_rejected(oms, session_order_id, &err.to_string());
            return Ok(());
        }

        if let Some(constraint) = comment.constraint() {
            let positions = oms
                .ledger()
                .query_position(Some(portfolio), Some(strategy), Some(market), Some(symbol))
                .await?;
            // A new strategy with no position record skips the check.
            if let Some(row) = positions.first() {
                if let Err(reason) =
                    logic::check_constraint(constraint, row.position, is_buy, quantity)
                {
                    self.publish_order_rejected(oms, session_order_id, &reason);
                    return Ok(());
                }
            }
        }

        let session_parent_order_id = session_parent_order_id.unwrap_or(session_order_id);

        if action.is_exit() {
            self.pull_stop_orders(oms, portfolio, strategy, market, symbol, &comment)
                .await?;
        }

        let good_till = comment.good_till().unwrap_or("").to_string();
        let placed =
            oms.place_order(market, symbol, order_type, is_buy, quantity, price, &good_till);

        let (broker_id, broker_order_id) = match placed {
            Some(ids) => ids,
            None => {
                warn!(
                    target: "session",
                    session = %self.session_id,
                    order_id = session_order_id,
                    symbol,
                    "order was not sent"
                );
                return Ok(());
            }
        };

        self.orders.insert(session_order_id, broker_order_id);
        oms.ledger()
            .insert_order(&OrderInsert {
                session_id: self.session_id.clone(),
                order_id: session_order_id,
                parent_order_id: session_parent_order_id,
                broker_id: broker_id.clone(),
                broker_order_id,
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
                comment: Some(comment.clone()),
            })
            .await?;

        if action.is_entry() {
            if let Some(order_ref) = comment.order_reference() {
                info!(
                    target: "session",
                    session = %self.session_id,
                    order_reference = order_ref,
                    "found order reference in ENTRY order, adding a position-by-entry row"
                );
                oms.ledger()
                    .insert_position_by_entry(
                        portfolio,
                        strategy,
                        market,
                        symbol,
                        quantity,
                        &self.session_id,
                        session_order_id,
                        Some(order_ref),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Cancel the resting stop orders tied to the entries an EXIT is about to
    /// close.
    async fn pull_stop_orders(
        &self,
        oms: &Oms,
        portfolio: &str,
        strategy: &str,
        market: &str,
        symbol: &str,
        comment: &Comment,
    ) -> LedgerResult<()> {
        info!(target: "session", session = %self.session_id, "remove stop-loss order before sending exit order");

        let mut order_refs: Vec<String> = Vec::new();
        match comment.order_reference() {
            Some(order_ref) => order_refs.push(order_ref.to_string()),
            None => {
                let entries = oms
                    .ledger()
                    .query_position_by_entry(portfolio, strategy, market, symbol)
                    .await?;
                order_refs.extend(entries.iter().filter_map(|e| e.order_reference.clone()));
            }
        }

        let stops = oms
            .ledger()
            .query_order(&OrderFilter {
                portfolio: Some(portfolio.to_string()),
                strategy: Some(strategy.to_string()),
                order_type: Some(OrderType::Stp),
                active_orders_only: true,
                order_by_created: true,
                ..Default::default()
            })
            .await?;

        if order_refs.is_empty() {
            // No order references anywhere, assume a single-entry book and
            // pull the most recently created stop.
            match stops.last() {
                Some(order) => {
                    info!(target: "session", broker_order_id = order.broker_order_id, "remove stop-loss order");
                    if let Some(broker) = oms.get_broker() {
                        broker.cancel_order(order.broker_order_id);
                    }
                }
                None => {
                    error!(
                        target: "session",
                        portfolio, symbol, strategy,
                        "fail to remove stop-loss order: order was missed"
                    );
                }
            }
            return Ok(());
        }

        let mut removed: Vec<String> = Vec::new();
        for order in &stops {
            let stp_ref = match order.comment_bag().order_reference() {
                Some(r) => r.to_string(),
                None => continue,
            };
            if order_refs.contains(&stp_ref) {
                info!(
                    target: "session",
                    broker_order_id = order.broker_order_id,
                    order_reference = %stp_ref,
                    "remove stop-loss order"
                );
                if let Some(broker) = oms.get_broker() {
                    broker.cancel_order(order.broker_order_id);
                }
                removed.push(stp_ref);
            }
        }
        let not_pulled: Vec<&String> = order_refs.iter().filter(|r| !removed.contains(r)).collect();
        if !not_pulled.is_empty() {
            info!(
                target: "session",
                references = ?not_pulled,
                "no stop-loss order found for these order references when handling exit"
            );
        }
        Ok(())
    }

    pub fn publish_execution(&self, oms: &Oms, item: ExecutionItem) {
        self.send_msg(
            oms,
            &OmsMessage::Execution {
                request_id: None,
                items: vec![item],
            },
        );
    }

    pub fn publish_order_error(&self, oms: &Oms, broker_order_id: i64, message: &str) {
        let session_order_id = self.find_session_order_id(broker_order_id);
        let reply = self.build_error_reply(ErrorCode::OrderError, message, session_order_id);
        self.send_msg(oms, &reply);
    }

    pub fn publish_order_rejected(&self, oms: &Oms, order_id: i64, message: &str) {
        let reply = self.build_error_reply(ErrorCode::OrderRejected, message, Some(order_id));
        self.send_msg(oms, &reply);
    }

    pub async fn publish_position(&self, oms: &Oms) -> LedgerResult<()> {
        let msg = self.build_position_message(oms, None, false).await?;
        self.send_msg(oms, &msg);
        Ok(())
    }

    pub async fn publish_position_renew(&self, oms: &Oms) -> LedgerResult<()> {
        let msg = self.build_position_message(oms, None, true).await?;
        self.send_msg(oms, &msg);
        Ok(())
    }

    pub async fn publish_next_request_id(&self, oms: &Oms) -> LedgerResult<()> {
        if let Some(row) = oms.ledger().query_session(&self.session_id).await? {
            self.send_msg(
                oms,
                &OmsMessage::NextRequestId {
                    next_request_id: row.next_request_id,
                },
            );
        }
        Ok(())
    }

    /// Send the periodic server heartbeat and schedule the next one.
    pub fn send_heartbeat(&mut self, oms: &Oms) {
        let now = Utc::now().naive_utc();
        self.next_heartbeat = now + Duration::seconds(Heartbeat::INTERVAL);
        let msg = OmsMessage::Heartbeat {
            timestamp: protocol::wire_timestamp(now),
            next: protocol::wire_timestamp(self.next_heartbeat),
            is_ready: Some(oms.is_ready()),
            message: None,
        };
        self.send_msg(oms, &msg);
    }

    pub fn require_stop_check(&mut self) -> bool {
        let now = Utc::now().naive_utc();
        if now - self.last_stopcheck > Duration::minutes(5) {
            self.last_stopcheck = now;
            return true;
        }
        false
    }

    /// Assert every non-zero position is covered by the strategy's active
    /// stop orders. Returns a description of the first mismatch.
    pub async fn validate_stop_orders(&self, oms: &Oms) -> LedgerResult<Option<String>> {
        let strategy = self.session_id.clone();
        let positions = oms
            .ledger()
            .query_position(None, Some(&strategy), None, None)
            .await?;
        for record in positions {
            if record.position == 0 {
                continue;
            }
            let stops = oms
                .ledger()
                .query_order(&OrderFilter {
                    portfolio: Some(record.portfolio_id.clone()),
                    session_id: Some(strategy.clone()),
                    order_type: Some(OrderType::Stp),
                    active_orders_only: true,
                    ..Default::default()
                })
                .await?;
            let quantities: Vec<(bool, i64)> =
                stops.iter().map(|o| (o.is_buy, o.quantity)).collect();
            if let Some(covered) = logic::stop_coverage_gap(record.position, &quantities) {
                return Ok(Some(format!(
                    "Stop order check failed for strategy '{strategy}'. Strategy position is {} \
                     but the total STP order quantity is {}",
                    record.position, -covered
                )));
            }
        }
        Ok(None)
    }

    /// Build the nested account → portfolios → positions → entries reply,
    /// filtered to this session's strategy.
    pub async fn build_position_message(
        &self,
        oms: &Oms,
        request_id: Option<i64>,
        force_renew: bool,
    ) -> LedgerResult<OmsMessage> {
        let ledger = oms.ledger();
        let account_id = self.account_id.clone().unwrap_or_default();
        let account_row = ledger.query_account(&account_id).await?;

        let mut account = PositionAccount {
            id: account_id.clone(),
            cash: account_row.as_ref().map(|a| a.cash),
            currency: account_row.map(|a| a.currency),
            portfolios: Vec::new(),
        };

        for portfolio in ledger.query_portfolio(None, Some(&account_id)).await? {
            let mut msg_portfolio = PositionPortfolio {
                id: portfolio.id.clone(),
                positions: Vec::new(),
            };

            for pos in ledger
                .query_position(Some(&portfolio.id), None, None, None)
                .await?
            {
                if pos.strategy != self.session_id {
                    continue;
                }

                let mut item = PositionItem {
                    strategy: pos.strategy.clone(),
                    market: pos.market.clone(),
                    symbol: pos.symbol.clone(),
                    position: pos.position,
                    avg_price: pos.avg_price,
                    force_renew,
                    positions_by_entry: Vec::new(),
                };

                for entry in ledger
                    .query_position_by_entry(&portfolio.id, &pos.strategy, &pos.market, &pos.symbol)
                    .await?
                {
                    let mut operations = Vec::new();
                    if let Some(order_ref) = &entry.order_reference {
                        for op in ledger
                            .query_operation(&portfolio.id, &pos.strategy, order_ref)
                            .await?
                        {
                            operations.push(OperationItem {
                                created: protocol::wire_timestamp(op.created),
                                action: op.action.parse().unwrap_or(Action::Amend),
                                position: op.position,
                                price: op.price,
                                identity: op.identity,
                            });
                        }
                        if !operations.is_empty() {
                            info!(
                                target: "session",
                                order_reference = %order_ref,
                                count = operations.len(),
                                "found operations for entry"
                            );
                        }
                    }

                    let order = OrderItem {
                        order_id: entry.order_id,
                        market: pos.market.clone(),
                        symbol: pos.symbol.clone(),
                        order_type: entry.order_type.parse().unwrap_or(OrderType::Mkt),
                        is_buy: entry.is_buy,
                        quantity: entry.quantity,
                        price: entry.price,
                        portfolio: portfolio.id.clone(),
                        action: entry.action.parse().unwrap_or(Action::Entry),
                        strategy: pos.strategy.clone(),
                        reference: entry.reference.clone(),
                        comment: entry
                            .comment
                            .as_deref()
                            .and_then(crate::domain::Comment::from_json_str),
                    };

                    item.positions_by_entry.push(PositionByEntryItem {
                        position: entry.position,
                        avg_price: entry.avg_price,
                        state: entry.parsed_state().unwrap_or(crate::domain::EntryState::Pending),
                        created: Some(protocol::wire_timestamp(entry.created)),
                        operations,
                        order: Some(order),
                    });
                }

                msg_portfolio.positions.push(item);
            }
            account.portfolios.push(msg_portfolio);
        }

        Ok(OmsMessage::Position {
            request_id,
            account: Some(account),
        })
    }

    fn build_error_reply(
        &self,
        code: ErrorCode,
        message: &str,
        request_id: Option<i64>,
    ) -> OmsMessage {
        error!(
            target: "session",
            session = %self.session_id,
            request_id = ?request_id,
            code = u16::from(code),
            "return error to client: {message}"
        );
        OmsMessage::Error {
            error_code: code,
            message: message.to_string(),
            session_id: Some(self.session_id.clone()),
            request_id,
        }
    }

    fn send_msg(&self, oms: &Oms, msg: &OmsMessage) {
        oms.publish_to(&self.src_id, msg);
    }

    fn invalidate(&mut self) {
        self.last_heartbeat_from_client = Some(NaiveDateTime::MIN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_session() -> ClientSession {
        ClientSession {
            state: SessionState::New,
            session_id: "S1".to_string(),
            src_id: "src-1".to_string(),
            account_id: None,
            next_request_id: Some(5),
            orders: HashMap::new(),
            unsolicited_orders: Vec::new(),
            last_heartbeat_from_client: None,
            next_heartbeat: Utc::now().naive_utc(),
            last_stopcheck: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn stale_request_id_is_rejected() {
        let session = bare_session();
        let reply = session.check_next_request_id(Some(4)).unwrap();
        match reply {
            OmsMessage::Error {
                error_code,
                request_id,
                ..
            } => {
                assert_eq!(error_code, ErrorCode::BadRequestId);
                assert_eq!(request_id, Some(4));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(session.check_next_request_id(Some(5)).is_none());
        assert!(session.check_next_request_id(Some(9)).is_none());
        assert!(session.check_next_request_id(None).is_none());
    }

    #[test]
    fn order_ownership_lookup() {
        let mut session = bare_session();
        session.orders.insert(3, 4711);
        session.notify_unsolicited_order(4712);

        assert_eq!(session.find_session_order_id(4711), Some(3));
        assert_eq!(session.find_session_order_id(4712), Some(0));
        assert_eq!(session.find_session_order_id(9999), None);
        assert!(session.is_own_order(4711));
    }

    #[test]
    fn invalidated_session_expires() {
        let mut session = bare_session();
        assert!(!session.is_expired());
        session.invalidate();
        assert!(session.is_expired());
    }
}
