//! Contract-roll reconciliation, invoked once at startup: detect expiring
//! front months, flatten and re-establish the aggregate position in the new
//! contract, then re-issue the per-strategy stop orders.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::domain::{Action, OrderType};
use crate::instruments::{Instrument, RollInstruction};
use crate::ledger::models::OrderInsert;
use crate::ledger::OrderFilter;

use super::{logic, Oms, STRATEGY_NAME};

const BROKER_WAIT: Duration = Duration::from_secs(30);

impl Oms {
    pub(crate) async fn roll_contracts(&self) {
        info!(target: "oms", "check if OMS needs to roll any contract");

        let roll_list = match self.reconcile_instruments().await {
            Ok(list) => list,
            Err(_) => return,
        };
        if roll_list.is_empty() {
            info!(target: "oms", "no contract requires rolling");
            return;
        }

        info!(target: "oms", "contract roll is required, waiting for all broker connections");
        self.wait_for_brokers(BROKER_WAIT).await;
        for broker in &self.brokers {
            if !broker.is_connected() {
                info!(
                    target: "oms",
                    broker = broker.name(),
                    "broker is not connected yet, skip contract roll this time"
                );
                return;
            }
        }
        info!(target: "oms", "all brokers are connected");

        for (last_month_code, instrument) in roll_list {
            info!(target: "oms", symbol = %instrument.symbol, "roll contract");

            let Some(instruction) = instrument.roll_instruction.clone() else {
                info!(
                    target: "oms",
                    symbol = %instrument.symbol,
                    "no roll instruction, no rolling occurred"
                );
                continue;
            };

            let today = instrument.today_in_exchange_tz();
            if !logic::roll_is_due(
                &instruction,
                &last_month_code,
                &instrument.front_month.code,
                today,
            ) {
                info!(
                    target: "oms",
                    from = %last_month_code,
                    to = %instrument.front_month.code,
                    date = %today,
                    "cannot find any roll instruction for this transition today, no rolling occurred"
                );
                continue;
            }
            info!(
                target: "oms",
                from = %instruction.from,
                to = %instruction.to,
                date = %instruction.date,
                offset = instruction.offset,
                position = instruction.net_position,
                "roll instruction found, can carry out rolling"
            );

            let total_position = match self.ledger().query_total_position(&instrument.symbol).await
            {
                Ok(total) => total,
                Err(_) => continue,
            };
            if total_position != instruction.net_position {
                error!(
                    target: "oms",
                    symbol = %instrument.symbol,
                    expected = instruction.net_position,
                    actual = total_position,
                    "roll position mismatch, skipping roll for this symbol"
                );
                continue;
            }

            self.roll_one_symbol(&instrument, &instruction, total_position)
                .await;
        }
    }

    /// Compare the repository's contract months with the ledger; upsert
    /// changed rows and return the `(old_code, instrument)` pairs that rolled.
    async fn reconcile_instruments(
        &self,
    ) -> Result<Vec<(String, Instrument)>, crate::ledger::LedgerError> {
        let db_instruments = self.ledger().query_instruments().await?;

        let mut roll_list = Vec::new();
        for instrument in self.instruments().instruments() {
            let existing = db_instruments
                .iter()
                .find(|db| db.market == instrument.market && db.symbol == instrument.symbol);

            match existing {
                Some(db) => {
                    if logic::roll_required(&db.code, db.expiry, &instrument.front_month) {
                        info!(
                            target: "oms",
                            symbol = %instrument.symbol,
                            from = %db.code,
                            to = %instrument.front_month.code,
                            "contract roll detected, updating front month contract"
                        );
                        roll_list.push((db.code.clone(), instrument.clone()));
                        self.ledger()
                            .update_instrument(
                                &instrument.market,
                                &instrument.symbol,
                                &instrument.front_month.code,
                                instrument.front_month.expiry,
                            )
                            .await?;
                    }
                }
                None => {
                    info!(
                        target: "oms",
                        symbol = %instrument.symbol,
                        code = %instrument.front_month.code,
                        "instrument not found in OMS before, adding it"
                    );
                    self.ledger()
                        .update_instrument(
                            &instrument.market,
                            &instrument.symbol,
                            &instrument.front_month.code,
                            instrument.front_month.expiry,
                        )
                        .await?;
                }
            }
        }
        Ok(roll_list)
    }

    async fn roll_one_symbol(
        &self,
        instrument: &Instrument,
        instruction: &RollInstruction,
        total_position: i64,
    ) {
        if total_position == 0 {
            info!(
                target: "oms",
                symbol = %instrument.symbol,
                "aggregated position is 0, no position rolling is required"
            );
        } else {
            info!(
                target: "oms",
                symbol = %instrument.symbol,
                position = total_position,
                "aggregated position is non-zero, position rolling is required"
            );

            let portfolio = match self.ledger().query_portfolio(None, None).await {
                Ok(portfolios) if !portfolios.is_empty() => portfolios[0].id.clone(),
                _ => {
                    error!(target: "oms", "no portfolio found, cannot roll");
                    return;
                }
            };

            self.roll_tracker.clear();

            // Liquidate the expiring front month, then re-establish in the
            // next month.
            let is_buy = total_position < 0;
            self.send_roll_order(
                &instrument.market,
                &instrument.symbol,
                &instruction.from,
                is_buy,
                total_position,
                &portfolio,
            )
            .await;
            self.send_roll_order(
                &instrument.market,
                &instrument.symbol,
                &instruction.to,
                !is_buy,
                total_position,
                &portfolio,
            )
            .await;

            info!(target: "oms", "waiting for all roll orders to be filled");
            self.roll_tracker.wait_drained().await;
            info!(target: "oms", "all roll orders have been filled");
        }

        // Stop orders roll whenever a strategy holds a position, even when
        // the net position across strategies is 0.
        self.roll_stop_loss_orders(instrument, instruction).await;
    }

    async fn send_roll_order(
        &self,
        market: &str,
        symbol: &str,
        contract: &str,
        is_buy: bool,
        quantity: i64,
        portfolio: &str,
    ) {
        let qty = quantity.abs();
        // The explicit contract code is unknown to the repository, so it goes
        // on the wire unsubstituted.
        let Some((broker_id, broker_order_id)) =
            self.place_order(market, contract, OrderType::Mkt, is_buy, qty, 0.0, "")
        else {
            error!(target: "oms", contract, "roll order was not sent");
            return;
        };

        let _ = self
            .ledger()
            .insert_order(&OrderInsert {
                session_id: STRATEGY_NAME.to_string(),
                order_id: 0,
                parent_order_id: 0,
                broker_id,
                broker_order_id,
                market: market.to_string(),
                symbol: symbol.to_string(),
                order_type: OrderType::Mkt,
                is_buy,
                quantity: qty,
                price: 0.0,
                portfolio: portfolio.to_string(),
                action: Action::Roll,
                strategy: STRATEGY_NAME.to_string(),
                reference: None,
                comment: None,
            })
            .await;
        self.roll_tracker.add(broker_order_id);
    }

    /// Per strategy holding a position in the rolled symbol: cancel the most
    /// recently modified active stop and replace it offset by the
    /// instruction.
    async fn roll_stop_loss_orders(&self, instrument: &Instrument, instruction: &RollInstruction) {
        let positions = match self
            .ledger()
            .query_position(None, None, None, Some(&instrument.symbol))
            .await
        {
            Ok(positions) => positions,
            Err(_) => return,
        };

        for pos in positions {
            if pos.position == 0 {
                info!(
                    target: "oms",
                    strategy = %pos.strategy,
                    "strategy has no position, no stop order to roll"
                );
                continue;
            }
            info!(
                target: "oms",
                strategy = %pos.strategy,
                position = pos.position,
                "strategy holds a position, roll the stop order"
            );

            let stops = match self
                .ledger()
                .query_order(&OrderFilter {
                    strategy: Some(pos.strategy.clone()),
                    symbol: Some(instrument.symbol.clone()),
                    order_type: Some(OrderType::Stp),
                    action: Some(Action::StopLoss),
                    active_orders_only: true,
                    order_by_last_modified: true,
                    ..Default::default()
                })
                .await
            {
                Ok(stops) => stops,
                Err(_) => continue,
            };
            let Some(stop) = stops.first() else {
                warn!(
                    target: "oms",
                    strategy = %pos.strategy,
                    position = pos.position,
                    "strategy has a position but no active stop order, skip rolling the stop"
                );
                continue;
            };

            info!(target: "oms", broker_order_id = stop.broker_order_id, "remove original stop-loss order");
            if let Some(broker) = self.get_broker() {
                broker.cancel_order(stop.broker_order_id);
            }

            let new_price = stop.price + instruction.offset;
            info!(
                target: "oms",
                is_buy = stop.is_buy,
                quantity = stop.quantity,
                price = new_price,
                "place new stop-loss order"
            );
            let Some((broker_id, broker_order_id)) = self.place_order(
                &instrument.market,
                &instrument.symbol,
                OrderType::Stp,
                stop.is_buy,
                stop.quantity,
                new_price,
                "",
            ) else {
                continue;
            };
            let _ = self
                .ledger()
                .insert_order(&OrderInsert {
                    session_id: stop.strategy.clone(),
                    order_id: 0,
                    parent_order_id: stop.parent_order_id,
                    broker_id,
                    broker_order_id,
                    market: instrument.market.clone(),
                    symbol: instrument.symbol.clone(),
                    order_type: OrderType::Stp,
                    is_buy: stop.is_buy,
                    quantity: stop.quantity,
                    price: new_price,
                    portfolio: stop.portfolio.clone(),
                    action: Action::StopLoss,
                    strategy: stop.strategy.clone(),
                    reference: None,
                    comment: stop
                        .comment
                        .as_deref()
                        .and_then(crate::domain::Comment::from_json_str),
                })
                .await;
        }
    }

    async fn wait_for_brokers(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.brokers.iter().all(|b| b.is_connected()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
