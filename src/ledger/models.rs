use chrono::NaiveDateTime;
use sqlx::FromRow;

use crate::domain::{Action, Comment, EntryState, OrderState, OrderType, ParseEnumError};

/// Row model for the `order_` table.
#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub session_id: String,
    pub order_id: i64,
    pub parent_order_id: i64,
    pub broker_id: String,
    pub broker_order_id: i64,
    pub market: String,
    pub symbol: String,
    #[sqlx(rename = "type")]
    pub order_type: String,
    pub is_buy: bool,
    pub quantity: i64,
    pub price: f64,
    pub state: String,
    pub qualifier: Option<String>,
    pub portfolio: String,
    pub action: String,
    pub strategy: String,
    pub reference: Option<String>,
    pub comment: Option<String>,
    pub filled_quantity: i64,
    pub remaining_quantity: i64,
}

impl OrderRow {
    pub fn parsed_order_type(&self) -> Result<OrderType, ParseEnumError> {
        self.order_type.parse()
    }

    pub fn parsed_state(&self) -> Result<OrderState, ParseEnumError> {
        self.state.parse()
    }

    pub fn parsed_action(&self) -> Result<Action, ParseEnumError> {
        self.action.parse()
    }

    /// Decode the opaque comment column; an absent or unreadable comment
    /// yields an empty bag.
    pub fn comment_bag(&self) -> Comment {
        self.comment
            .as_deref()
            .and_then(Comment::from_json_str)
            .unwrap_or_default()
    }
}

/// Field values for a new `order_` row; state starts at NEW with nothing
/// filled.
#[derive(Debug, Clone)]
pub struct OrderInsert {
    pub session_id: String,
    pub order_id: i64,
    pub parent_order_id: i64,
    pub broker_id: String,
    pub broker_order_id: i64,
    pub market: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub is_buy: bool,
    pub quantity: i64,
    pub price: f64,
    pub portfolio: String,
    pub action: Action,
    pub strategy: String,
    pub reference: Option<String>,
    pub comment: Option<Comment>,
}

/// Row model for the `execution` table.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub broker_id: String,
    pub broker_order_id: i64,
    pub broker_execution_id: String,
    pub gateway_order_id: Option<String>,
    pub is_buy: bool,
    pub contract: String,
    pub quantity: i64,
    pub price: f64,
    pub leave_quantity: Option<i64>,
    pub commission: Option<f64>,
    pub currency: Option<String>,
    pub execution_datetime: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct ExecutionInsert {
    pub broker_id: String,
    pub broker_order_id: i64,
    pub broker_execution_id: String,
    pub gateway_order_id: Option<String>,
    pub is_buy: bool,
    pub contract: String,
    pub quantity: i64,
    pub price: f64,
    pub leave_quantity: Option<i64>,
    pub commission: Option<f64>,
    pub currency: Option<String>,
    pub execution_datetime: NaiveDateTime,
}

/// Row model for the `position` table.
#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub portfolio_id: String,
    pub strategy: String,
    pub market: String,
    pub symbol: String,
    pub position: i64,
    pub avg_price: f64,
}

/// Join of `position_by_entry` with the originating `order_` row, newest
/// entry first.
#[derive(Debug, Clone, FromRow)]
pub struct PositionByEntryRow {
    pub position: i64,
    pub avg_price: f64,
    pub order_reference: Option<String>,
    pub state: String,
    pub created: NaiveDateTime,
    pub session_id: String,
    pub order_id: i64,
    #[sqlx(rename = "type")]
    pub order_type: String,
    pub is_buy: bool,
    pub quantity: i64,
    pub price: f64,
    pub action: String,
    pub reference: Option<String>,
    pub comment: Option<String>,
}

impl PositionByEntryRow {
    pub fn parsed_state(&self) -> Result<EntryState, ParseEnumError> {
        self.state.parse()
    }

    pub fn comment_bag(&self) -> Comment {
        self.comment
            .as_deref()
            .and_then(Comment::from_json_str)
            .unwrap_or_default()
    }
}

/// Row model for the `operation` audit table.
#[derive(Debug, Clone, FromRow)]
pub struct OperationRow {
    pub created: NaiveDateTime,
    pub action: String,
    pub position: i64,
    pub price: Option<f64>,
    pub identity: Option<String>,
}

/// Row model for the `session` table.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub next_request_id: i64,
    pub ip: Option<String>,
}

/// Row model for the `account` table.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: String,
    pub cash: f64,
    pub currency: String,
}

/// Row model for the `portfolio` table.
#[derive(Debug, Clone, FromRow)]
pub struct PortfolioRow {
    pub id: String,
    pub account_id: String,
}

/// Row model for the `instrument` table.
#[derive(Debug, Clone, FromRow)]
pub struct InstrumentRow {
    pub market: String,
    pub symbol: String,
    pub code: String,
    pub expiry: NaiveDateTime,
}
