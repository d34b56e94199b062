//! Durable store of sessions, orders, executions, positions, per-entry
//! positions, operations and instruments.
//!
//! The schema is shared with operator tooling and is preserved verbatim
//! (created via migrations):
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS account (
//!   id        TEXT PRIMARY KEY,
//!   cash      DOUBLE PRECISION NOT NULL,
//!   currency  TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS broker (
//!   id          TEXT PRIMARY KEY,
//!   description TEXT
//! );
//! CREATE TABLE IF NOT EXISTS market (
//!   market TEXT PRIMARY KEY
//! );
//! CREATE TABLE IF NOT EXISTS strategy (
//!   id          TEXT PRIMARY KEY,
//!   description TEXT
//! );
//! CREATE TABLE IF NOT EXISTS portfolio (
//!   id         TEXT PRIMARY KEY,
//!   account_id TEXT NOT NULL REFERENCES account (id)
//! );
//! CREATE TABLE IF NOT EXISTS session (
//!   id              TEXT PRIMARY KEY,
//!   next_request_id BIGINT NOT NULL,
//!   ip              TEXT
//! );
//! CREATE TABLE IF NOT EXISTS order_ (
//!   session_id         TEXT NOT NULL,
//!   order_id           BIGINT NOT NULL,
//!   parent_order_id    BIGINT NOT NULL,
//!   broker_id          TEXT NOT NULL,
//!   broker_order_id    BIGINT NOT NULL,
//!   market             TEXT NOT NULL,
//!   symbol             TEXT NOT NULL,
//!   type               TEXT NOT NULL,
//!   is_buy             BOOLEAN NOT NULL,
//!   quantity           BIGINT NOT NULL,
//!   price              DOUBLE PRECISION NOT NULL,
//!   state              TEXT NOT NULL,
//!   filled_quantity    BIGINT NOT NULL DEFAULT 0,
//!   remaining_quantity BIGINT NOT NULL DEFAULT 0,
//!   qualifier          TEXT,
//!   portfolio          TEXT NOT NULL,
//!   action             TEXT NOT NULL,
//!   strategy           TEXT NOT NULL,
//!   reference          TEXT,
//!   comment            TEXT,
//!   created            TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc'),
//!   last_modified      TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc'),
//!   PRIMARY KEY (broker_id, broker_order_id)
//! );
//! CREATE TABLE IF NOT EXISTS execution (
//!   broker_id           TEXT NOT NULL,
//!   broker_order_id     BIGINT NOT NULL,
//!   broker_execution_id TEXT NOT NULL,
//!   gateway_order_id    TEXT,
//!   is_buy              BOOLEAN NOT NULL,
//!   contract            TEXT NOT NULL,
//!   quantity            BIGINT NOT NULL,
//!   price               DOUBLE PRECISION NOT NULL,
//!   leave_quantity      BIGINT,
//!   commission          DOUBLE PRECISION,
//!   currency            TEXT,
//!   execution_datetime  TIMESTAMP NOT NULL,
//!   PRIMARY KEY (broker_id, broker_execution_id)
//! );
//! CREATE TABLE IF NOT EXISTS position (
//!   portfolio_id TEXT NOT NULL,
//!   strategy     TEXT NOT NULL,
//!   market       TEXT NOT NULL,
//!   symbol       TEXT NOT NULL,
//!   position     BIGINT NOT NULL,
//!   avg_price    DOUBLE PRECISION NOT NULL DEFAULT 0,
//!   PRIMARY KEY (portfolio_id, strategy, market, symbol)
//! );
//! CREATE TABLE IF NOT EXISTS position_by_entry (
//!   portfolio_id    TEXT NOT NULL,
//!   strategy        TEXT NOT NULL,
//!   market          TEXT NOT NULL,
//!   symbol          TEXT NOT NULL,
//!   position        BIGINT NOT NULL,
//!   avg_price       DOUBLE PRECISION NOT NULL DEFAULT 0,
//!   session_id      TEXT NOT NULL,
//!   order_id        BIGINT NOT NULL,
//!   state           TEXT NOT NULL,
//!   order_reference TEXT,
//!   created         TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc'),
//!   PRIMARY KEY (session_id, order_id)
//! );
//! CREATE TABLE IF NOT EXISTS operation (
//!   portfolio_id    TEXT NOT NULL,
//!   strategy        TEXT NOT NULL,
//!   action          TEXT NOT NULL,
//!   position        BIGINT NOT NULL,
//!   price           DOUBLE PRECISION,
//!   order_reference TEXT,
//!   identity        TEXT,
//!   created         TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc')
//! );
//! CREATE TABLE IF NOT EXISTS instrument (
//!   market TEXT NOT NULL,
//!   symbol TEXT NOT NULL,
//!   code   TEXT NOT NULL,
//!   expiry TIMESTAMP NOT NULL,
//!   PRIMARY KEY (market, symbol)
//! );
//! ```

pub mod models;

use chrono::NaiveDateTime;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder};
use tracing::error;

use crate::domain::{Action, EntryState, OrderState, OrderType};
use crate::types::PostgresConfig;

use models::{
    AccountRow, ExecutionInsert, ExecutionRow, InstrumentRow, OperationRow, OrderInsert, OrderRow,
    PortfolioRow, PositionByEntryRow, PositionRow, SessionRow,
};

pub type PgPool = Pool<Postgres>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

const ORDER_COLUMNS: &str = "session_id, order_id, parent_order_id, broker_id, broker_order_id, \
     market, symbol, type, is_buy, quantity, price, state, qualifier, portfolio, action, \
     strategy, reference, comment, filled_quantity, remaining_quantity";

/// Optional filters for `query_order`; defaults select everything.
#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub broker_id: Option<String>,
    pub session_id: Option<String>,
    pub order_id: Option<i64>,
    pub broker_order_id: Option<i64>,
    pub symbol: Option<String>,
    pub action: Option<Action>,
    pub portfolio: Option<String>,
    pub strategy: Option<String>,
    pub order_type: Option<OrderType>,
    pub active_orders_only: bool,
    pub order_by_last_modified: bool,
    pub order_by_created: bool,
}

/// Optional field updates for an `order_` row; `last_modified` is always
/// refreshed.
#[derive(Clone, Debug, Default)]
pub struct OrderPatch {
    pub quantity: Option<i64>,
    pub price: Option<f64>,
    pub remaining_quantity: Option<i64>,
    pub filled_quantity: Option<i64>,
    pub state: Option<OrderState>,
    pub action: Option<Action>,
}

impl OrderPatch {
    fn is_empty(&self) -> bool {
        self.quantity.is_none()
            && self.price.is_none()
            && self.remaining_quantity.is_none()
            && self.filled_quantity.is_none()
            && self.state.is_none()
            && self.action.is_none()
    }
}

/// How a `position_by_entry` row is addressed.
#[derive(Clone, Debug)]
pub enum EntryKey {
    Session {
        session_id: String,
        order_id: i64,
    },
    Reference {
        portfolio_id: String,
        strategy: String,
        order_reference: String,
    },
}

#[derive(Clone, Debug, Default)]
pub struct EntryPatch {
    pub avg_price: Option<f64>,
    pub state: Option<EntryState>,
    pub position: Option<i64>,
}

impl EntryPatch {
    fn is_empty(&self) -> bool {
        self.avg_price.is_none() && self.state.is_none() && self.position.is_none()
    }
}

fn push_clause(qb: &mut QueryBuilder<'static, Postgres>, has_where: &mut bool, column: &str) {
    qb.push(if *has_where { " and " } else { " where " });
    *has_where = true;
    qb.push(column);
    qb.push(" = ");
}

fn active_states_list() -> String {
    OrderState::ACTIVE_STATES
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn build_order_select(filter: &OrderFilter) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("select {ORDER_COLUMNS} from order_"));
    let mut has_where = false;

    if let Some(broker_id) = &filter.broker_id {
        push_clause(&mut qb, &mut has_where, "broker_id");
        qb.push_bind(broker_id.clone());
    }
    if let Some(session_id) = &filter.session_id {
        push_clause(&mut qb, &mut has_where, "session_id");
        qb.push_bind(session_id.clone());
    }
    if let Some(order_id) = filter.order_id {
        push_clause(&mut qb, &mut has_where, "order_id");
        qb.push_bind(order_id);
    }
    if let Some(broker_order_id) = filter.broker_order_id {
        push_clause(&mut qb, &mut has_where, "broker_order_id");
        qb.push_bind(broker_order_id);
    }
    if let Some(symbol) = &filter.symbol {
        push_clause(&mut qb, &mut has_where, "symbol");
        qb.push_bind(symbol.clone());
    }
    if let Some(action) = filter.action {
        push_clause(&mut qb, &mut has_where, "action");
        qb.push_bind(action.as_str());
    }
    if let Some(portfolio) = &filter.portfolio {
        push_clause(&mut qb, &mut has_where, "portfolio");
        qb.push_bind(portfolio.clone());
    }
    if let Some(strategy) = &filter.strategy {
        push_clause(&mut qb, &mut has_where, "strategy");
        qb.push_bind(strategy.clone());
    }
    if let Some(order_type) = filter.order_type {
        push_clause(&mut qb, &mut has_where, "type");
        qb.push_bind(order_type.as_str());
    }
    if filter.active_orders_only {
        qb.push(if has_where { " and " } else { " where " });
        has_where = true;
        qb.push(format!("state in ({})", active_states_list()));
    }

    if filter.order_by_last_modified {
        qb.push(" order by last_modified desc");
    } else if filter.order_by_created {
        qb.push(" order by created");
    }

    let _ = has_where;
    qb
}

fn build_order_update(
    broker_id: &str,
    broker_order_id: i64,
    patch: &OrderPatch,
) -> QueryBuilder<'static, Postgres> {
    let mut qb =
        QueryBuilder::new("update order_ set last_modified = (now() at time zone 'utc')");

    if let Some(quantity) = patch.quantity {
        qb.push(", quantity = ");
        qb.push_bind(quantity);
    }
    if let Some(price) = patch.price {
        qb.push(", price = ");
        qb.push_bind(price);
    }
    if let Some(remaining) = patch.remaining_quantity {
        qb.push(", remaining_quantity = ");
        qb.push_bind(remaining);
    }
    if let Some(filled) = patch.filled_quantity {
        qb.push(", filled_quantity = ");
        qb.push_bind(filled);
    }
    if let Some(state) = patch.state {
        qb.push(", state = ");
        qb.push_bind(state.as_str());
    }
    if let Some(action) = patch.action {
        qb.push(", action = ");
        qb.push_bind(action.as_str());
    }

    qb.push(" where broker_id = ");
    qb.push_bind(broker_id.to_string());
    qb.push(" and broker_order_id = ");
    qb.push_bind(broker_order_id);
    qb
}

fn build_position_upsert(
    portfolio_id: &str,
    strategy: &str,
    market: &str,
    symbol: &str,
    delta: i64,
    avg_price: Option<f64>,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "insert into \"position\" (portfolio_id, strategy, market, symbol, \"position\"",
    );
    if avg_price.is_some() {
        qb.push(", avg_price");
    }
    qb.push(") values (");
    qb.push_bind(portfolio_id.to_string());
    qb.push(", ");
    qb.push_bind(strategy.to_string());
    qb.push(", ");
    qb.push_bind(market.to_string());
    qb.push(", ");
    qb.push_bind(symbol.to_string());
    qb.push(", ");
    qb.push_bind(delta);
    if let Some(avg_price) = avg_price {
        qb.push(", ");
        qb.push_bind(avg_price);
    }
    qb.push(
        ") on conflict (portfolio_id, strategy, market, symbol) do update set \
         \"position\" = \"position\".\"position\" + excluded.\"position\"",
    );
    if avg_price.is_some() {
        qb.push(", avg_price = excluded.avg_price");
    }
    qb
}

fn build_entry_update(key: &EntryKey, patch: &EntryPatch) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("update position_by_entry set ");
    let mut first = true;
    let mut push_set = |qb: &mut QueryBuilder<'static, Postgres>, col: &str| {
        if !first {
            qb.push(", ");
        }
        first = false;
        qb.push(col);
        qb.push(" = ");
    };

    if let Some(avg_price) = patch.avg_price {
        push_set(&mut qb, "avg_price");
        qb.push_bind(avg_price);
    }
    if let Some(state) = patch.state {
        push_set(&mut qb, "state");
        qb.push_bind(state.as_str());
    }
    if let Some(position) = patch.position {
        push_set(&mut qb, "\"position\"");
        qb.push_bind(position);
    }

    match key {
        EntryKey::Session {
            session_id,
            order_id,
        } => {
            qb.push(" where session_id = ");
            qb.push_bind(session_id.clone());
            qb.push(" and order_id = ");
            qb.push_bind(*order_id);
        }
        EntryKey::Reference {
            portfolio_id,
            strategy,
            order_reference,
        } => {
            qb.push(" where portfolio_id = ");
            qb.push_bind(portfolio_id.clone());
            qb.push(" and strategy = ");
            qb.push_bind(strategy.clone());
            qb.push(" and order_reference = ");
            qb.push_bind(order_reference.clone());
        }
    }
    qb
}

/// Postgres-backed ledger. All SQL runs through one pooled connection so
/// writes are serialised the way the statement log expects.
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub async fn connect(cfg: &PostgresConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(15))
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn trace_err(sql: &str, err: sqlx::Error) -> LedgerError {
        error!(target: "ledger", statement = sql, error = %err, "statement failed");
        LedgerError::Db(err)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert_session(&self, session_id: &str) -> LedgerResult<()> {
        let sql = "insert into session (id, next_request_id, ip) values ($1, 1, null)";
        sqlx::query(sql)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn query_session(&self, session_id: &str) -> LedgerResult<Option<SessionRow>> {
        let sql = "select id, next_request_id, ip from session where id = $1";
        sqlx::query_as::<_, SessionRow>(sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))
    }

    pub async fn increment_next_request_id(&self, session_id: &str) -> LedgerResult<()> {
        let sql = "update session set next_request_id = next_request_id + 1 where id = $1";
        sqlx::query(sql)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn query_account(&self, account_id: &str) -> LedgerResult<Option<AccountRow>> {
        let sql = "select id, cash, currency from account where id = $1";
        sqlx::query_as::<_, AccountRow>(sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))
    }

    pub async fn verify_account_portfolio_strategy(
        &self,
        account_id: &str,
        portfolio_id: &str,
        strategy: &str,
    ) -> LedgerResult<bool> {
        let sql = "select a.id from account as a \
                   inner join portfolio as p on p.account_id = a.id \
                   inner join strategy as s on s.id = $3 \
                   where a.id = $1 and p.id = $2";
        let row = sqlx::query(sql)
            .bind(account_id)
            .bind(portfolio_id)
            .bind(strategy)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(row.is_some())
    }

    pub async fn insert_strategy(&self, strategy: &str) -> LedgerResult<()> {
        let sql = "insert into strategy (id, description) values ($1, '') on conflict do nothing";
        sqlx::query(sql)
            .bind(strategy)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn query_portfolio(
        &self,
        portfolio_id: Option<&str>,
        account_id: Option<&str>,
    ) -> LedgerResult<Vec<PortfolioRow>> {
        let mut qb: QueryBuilder<'static, Postgres> =
            QueryBuilder::new("select id, account_id from portfolio");
        let mut has_where = false;
        if let Some(portfolio_id) = portfolio_id {
            push_clause(&mut qb, &mut has_where, "id");
            qb.push_bind(portfolio_id.to_string());
        }
        if let Some(account_id) = account_id {
            push_clause(&mut qb, &mut has_where, "account_id");
            qb.push_bind(account_id.to_string());
        }
        let sql = qb.sql().to_string();
        qb.build_query_as::<PortfolioRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))
    }

    pub async fn insert_execution(&self, exec: &ExecutionInsert) -> LedgerResult<()> {
        let sql = "insert into execution (broker_id, broker_order_id, broker_execution_id, \
                   gateway_order_id, is_buy, contract, quantity, price, leave_quantity, \
                   commission, currency, execution_datetime) \
                   values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";
        sqlx::query(sql)
            .bind(&exec.broker_id)
            .bind(exec.broker_order_id)
            .bind(&exec.broker_execution_id)
            .bind(&exec.gateway_order_id)
            .bind(exec.is_buy)
            .bind(&exec.contract)
            .bind(exec.quantity)
            .bind(exec.price)
            .bind(exec.leave_quantity)
            .bind(exec.commission)
            .bind(&exec.currency)
            .bind(exec.execution_datetime)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn query_executions(
        &self,
        broker_id: &str,
        broker_execution_id: Option<&str>,
    ) -> LedgerResult<Vec<ExecutionRow>> {
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new(
            "select broker_id, broker_order_id, broker_execution_id, gateway_order_id, is_buy, \
             contract, quantity, price, leave_quantity, commission, currency, execution_datetime \
             from execution where broker_id = ",
        );
        qb.push_bind(broker_id.to_string());
        if let Some(exec_id) = broker_execution_id {
            qb.push(" and broker_execution_id = ");
            qb.push_bind(exec_id.to_string());
        }
        let sql = qb.sql().to_string();
        qb.build_query_as::<ExecutionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))
    }

    pub async fn insert_order(&self, order: &OrderInsert) -> LedgerResult<()> {
        let comment = order.comment.as_ref().map(|c| c.to_json_string());
        let sql = "insert into order_ (session_id, order_id, parent_order_id, broker_id, \
                   broker_order_id, market, symbol, type, is_buy, quantity, price, state, \
                   qualifier, portfolio, action, strategy, reference, comment, \
                   filled_quantity, remaining_quantity) \
                   values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                   $16, $17, $18, 0, $10)";
        sqlx::query(sql)
            .bind(&order.session_id)
            .bind(order.order_id)
            .bind(order.parent_order_id)
            .bind(&order.broker_id)
            .bind(order.broker_order_id)
            .bind(&order.market)
            .bind(&order.symbol)
            .bind(order.order_type.as_str())
            .bind(order.is_buy)
            .bind(order.quantity)
            .bind(order.price)
            .bind(OrderState::New.as_str())
            .bind("none")
            .bind(&order.portfolio)
            .bind(order.action.as_str())
            .bind(&order.strategy)
            .bind(&order.reference)
            .bind(comment)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn query_order(&self, filter: &OrderFilter) -> LedgerResult<Vec<OrderRow>> {
        let mut qb = build_order_select(filter);
        let sql = qb.sql().to_string();
        qb.build_query_as::<OrderRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))
    }

    pub async fn update_order(
        &self,
        broker_id: &str,
        broker_order_id: i64,
        patch: &OrderPatch,
    ) -> LedgerResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut qb = build_order_update(broker_id, broker_order_id, patch);
        let sql = qb.sql().to_string();
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))?;
        Ok(())
    }

    pub async fn query_position(
        &self,
        portfolio_id: Option<&str>,
        strategy: Option<&str>,
        market: Option<&str>,
        symbol: Option<&str>,
    ) -> LedgerResult<Vec<PositionRow>> {
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new(
            "select portfolio_id, strategy, market, symbol, \"position\", avg_price \
             from \"position\"",
        );
        let mut has_where = false;
        if let Some(portfolio_id) = portfolio_id {
            push_clause(&mut qb, &mut has_where, "portfolio_id");
            qb.push_bind(portfolio_id.to_string());
        }
        if let Some(strategy) = strategy {
            push_clause(&mut qb, &mut has_where, "strategy");
            qb.push_bind(strategy.to_string());
        }
        if let Some(market) = market {
            push_clause(&mut qb, &mut has_where, "market");
            qb.push_bind(market.to_string());
        }
        if let Some(symbol) = symbol {
            push_clause(&mut qb, &mut has_where, "symbol");
            qb.push_bind(symbol.to_string());
        }
        let sql = qb.sql().to_string();
        qb.build_query_as::<PositionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))
    }

    /// Apply a signed position delta, optionally refreshing the average entry
    /// price. The row is created on first touch.
    pub async fn update_position(
        &self,
        portfolio_id: &str,
        strategy: &str,
        market: &str,
        symbol: &str,
        delta: i64,
        avg_price: Option<f64>,
    ) -> LedgerResult<()> {
        let mut qb = build_position_upsert(portfolio_id, strategy, market, symbol, delta, avg_price);
        let sql = qb.sql().to_string();
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))?;
        Ok(())
    }

    pub async fn query_total_position(&self, symbol: &str) -> LedgerResult<i64> {
        let sql = "select coalesce(sum(\"position\"), 0)::bigint \
                   from \"position\" where symbol = $1";
        let total: i64 = sqlx::query_scalar(sql)
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(total)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_position_by_entry(
        &self,
        portfolio_id: &str,
        strategy: &str,
        market: &str,
        symbol: &str,
        position: i64,
        session_id: &str,
        order_id: i64,
        order_reference: Option<&str>,
    ) -> LedgerResult<()> {
        let sql = "insert into position_by_entry (portfolio_id, strategy, market, symbol, \
                   \"position\", avg_price, session_id, order_id, state, order_reference) \
                   values ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9)";
        sqlx::query(sql)
            .bind(portfolio_id)
            .bind(strategy)
            .bind(market)
            .bind(symbol)
            .bind(position)
            .bind(session_id)
            .bind(order_id)
            .bind(EntryState::Pending.as_str())
            .bind(order_reference)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn update_position_by_entry(
        &self,
        key: &EntryKey,
        patch: &EntryPatch,
    ) -> LedgerResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut qb = build_entry_update(key, patch);
        let sql = qb.sql().to_string();
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(&sql, e))?;
        Ok(())
    }

    pub async fn delete_position_by_entry(
        &self,
        session_id: &str,
        order_id: i64,
    ) -> LedgerResult<()> {
        let sql = "delete from position_by_entry where session_id = $1 and order_id = $2";
        sqlx::query(sql)
            .bind(session_id)
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    /// Open entry tickets joined to their originating order, newest first.
    pub async fn query_position_by_entry(
        &self,
        portfolio_id: &str,
        strategy: &str,
        market: &str,
        symbol: &str,
    ) -> LedgerResult<Vec<PositionByEntryRow>> {
        let sql = "select p.\"position\", p.avg_price, p.order_reference, p.state, p.created, \
                   p.session_id, o.order_id, o.type, o.is_buy, o.quantity, o.price, o.action, \
                   o.reference, o.comment \
                   from position_by_entry as p \
                   inner join order_ as o \
                   on p.session_id = o.session_id and p.order_id = o.order_id \
                   where p.portfolio_id = $1 and p.strategy = $2 and p.market = $3 \
                   and p.symbol = $4 and p.state in ('PENDING','FULLY_FILLED') \
                   order by p.created desc";
        sqlx::query_as::<_, PositionByEntryRow>(sql)
            .bind(portfolio_id)
            .bind(strategy)
            .bind(market)
            .bind(symbol)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_operation(
        &self,
        portfolio_id: &str,
        strategy: &str,
        action: Action,
        position: i64,
        order_reference: &str,
        price: Option<f64>,
        identity: Option<&str>,
    ) -> LedgerResult<()> {
        let sql = "insert into operation (portfolio_id, strategy, action, \"position\", \
                   order_reference, price, identity) values ($1, $2, $3, $4, $5, $6, $7)";
        sqlx::query(sql)
            .bind(portfolio_id)
            .bind(strategy)
            .bind(action.as_str())
            .bind(position)
            .bind(order_reference)
            .bind(price)
            .bind(identity)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }

    pub async fn query_operation(
        &self,
        portfolio_id: &str,
        strategy: &str,
        order_reference: &str,
    ) -> LedgerResult<Vec<OperationRow>> {
        let sql = "select created, action, \"position\", price, identity from operation \
                   where portfolio_id = $1 and strategy = $2 and order_reference = $3";
        sqlx::query_as::<_, OperationRow>(sql)
            .bind(portfolio_id)
            .bind(strategy)
            .bind(order_reference)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))
    }

    pub async fn query_instruments(&self) -> LedgerResult<Vec<InstrumentRow>> {
        let sql = "select market, symbol, code, expiry from instrument";
        sqlx::query_as::<_, InstrumentRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))
    }

    pub async fn update_instrument(
        &self,
        market: &str,
        symbol: &str,
        code: &str,
        expiry: NaiveDateTime,
    ) -> LedgerResult<()> {
        let sql = "insert into instrument (market, symbol, code, expiry) \
                   values ($1, $2, $3, $4) \
                   on conflict (market, symbol) do update \
                   set code = excluded.code, expiry = excluded.expiry";
        sqlx::query(sql)
            .bind(market)
            .bind(symbol)
            .bind(code)
            .bind(expiry)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::trace_err(sql, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_select_with_filters() {
        let filter = OrderFilter {
            broker_id: Some("sim".to_string()),
            order_type: Some(OrderType::Stp),
            active_orders_only: true,
            order_by_last_modified: true,
            ..Default::default()
        };
        let qb = build_order_select(&filter);
        let sql = qb.sql();
        assert!(sql.contains("where broker_id = $1"));
        assert!(sql.contains("and type = $2"));
        assert!(sql.contains("state in ('NEW','PENDING','ACTIVE','PARTIALLY_FILLED')"));
        assert!(sql.ends_with("order by last_modified desc"));
    }

    #[test]
    fn order_select_without_filters_has_no_where() {
        let qb = build_order_select(&OrderFilter::default());
        assert!(!qb.sql().contains("where"));
    }

    #[test]
    fn order_update_sets_only_given_fields() {
        let patch = OrderPatch {
            remaining_quantity: Some(0),
            filled_quantity: Some(5),
            state: Some(OrderState::FullyFilled),
            ..Default::default()
        };
        let qb = build_order_update("sim", 42, &patch);
        let sql = qb.sql();
        assert!(sql.contains("last_modified = (now() at time zone 'utc')"));
        assert!(sql.contains("remaining_quantity = $1"));
        assert!(sql.contains("filled_quantity = $2"));
        assert!(sql.contains("state = $3"));
        assert!(!sql.contains("quantity = $4"));
        assert!(sql.contains("where broker_id = $4 and broker_order_id = $5"));
    }

    #[test]
    fn position_upsert_is_additive() {
        let qb = build_position_upsert("main", "S1", "CME", "NQ", 2, Some(7300.0));
        let sql = qb.sql();
        assert!(sql.contains("on conflict (portfolio_id, strategy, market, symbol)"));
        assert!(sql.contains("\"position\" = \"position\".\"position\" + excluded.\"position\""));
        assert!(sql.contains("avg_price = excluded.avg_price"));

        let qb = build_position_upsert("main", "S1", "CME", "NQ", 2, None);
        assert!(!qb.sql().contains("avg_price"));
    }

    #[test]
    fn entry_update_addressing() {
        let patch = EntryPatch {
            state: Some(EntryState::Exited),
            ..Default::default()
        };
        let by_session = build_entry_update(
            &EntryKey::Session {
                session_id: "S1".to_string(),
                order_id: 7,
            },
            &patch,
        );
        assert!(by_session
            .sql()
            .contains("where session_id = $2 and order_id = $3"));

        let by_reference = build_entry_update(
            &EntryKey::Reference {
                portfolio_id: "main".to_string(),
                strategy: "S1".to_string(),
                order_reference: "ref-1".to_string(),
            },
            &patch,
        );
        assert!(by_reference
            .sql()
            .contains("where portfolio_id = $2 and strategy = $3 and order_reference = $4"));
    }
}
