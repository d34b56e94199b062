use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raised when a ledger string does not map back onto a domain enum.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Mkt,
    Lmt,
    Stp,
    StpLmt,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Mkt => "MKT",
            OrderType::Lmt => "LMT",
            OrderType::Stp => "STP",
            OrderType::StpLmt => "STP_LMT",
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MKT" => Ok(OrderType::Mkt),
            "LMT" => Ok(OrderType::Lmt),
            "STP" => Ok(OrderType::Stp),
            "STP_LMT" => Ok(OrderType::StpLmt),
            other => Err(ParseEnumError {
                kind: "order type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    New,
    Pending,
    Active,
    PartiallyFilled,
    FullyFilled,
    Cancelled,
    Rejected,
    Inactive,
}

impl OrderState {
    /// States a resting order can still trade from; used by ledger filters.
    pub const ACTIVE_STATES: [OrderState; 4] = [
        OrderState::New,
        OrderState::Pending,
        OrderState::Active,
        OrderState::PartiallyFilled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::New => "NEW",
            OrderState::Pending => "PENDING",
            OrderState::Active => "ACTIVE",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::FullyFilled => "FULLY_FILLED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Rejected => "REJECTED",
            OrderState::Inactive => "INACTIVE",
        }
    }
}

impl std::str::FromStr for OrderState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderState::New),
            "PENDING" => Ok(OrderState::Pending),
            "ACTIVE" => Ok(OrderState::Active),
            "PARTIALLY_FILLED" => Ok(OrderState::PartiallyFilled),
            "FULLY_FILLED" => Ok(OrderState::FullyFilled),
            "CANCELLED" => Ok(OrderState::Cancelled),
            "REJECTED" => Ok(OrderState::Rejected),
            "INACTIVE" => Ok(OrderState::Inactive),
            other => Err(ParseEnumError {
                kind: "order state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Entry,
    Exit,
    StopLoss,
    ManualStopLoss,
    Roll,
    Reduce,
    Increase,
    Amend,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Entry => "ENTRY",
            Action::Exit => "EXIT",
            Action::StopLoss => "STOP_LOSS",
            Action::ManualStopLoss => "MANUAL_STOP_LOSS",
            Action::Roll => "ROLL",
            Action::Reduce => "REDUCE",
            Action::Increase => "INCREASE",
            Action::Amend => "AMEND",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, Action::Entry)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Action::Exit)
    }
}

impl std::str::FromStr for Action {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(Action::Entry),
            "EXIT" => Ok(Action::Exit),
            "STOP_LOSS" => Ok(Action::StopLoss),
            "MANUAL_STOP_LOSS" => Ok(Action::ManualStopLoss),
            "ROLL" => Ok(Action::Roll),
            "REDUCE" => Ok(Action::Reduce),
            "INCREASE" => Ok(Action::Increase),
            "AMEND" => Ok(Action::Amend),
            other => Err(ParseEnumError {
                kind: "action",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of one entry ticket in the per-entry position book.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Pending,
    FullyFilled,
    Exited,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "PENDING",
            EntryState::FullyFilled => "FULLY_FILLED",
            EntryState::Exited => "EXITED",
        }
    }
}

impl std::str::FromStr for EntryState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryState::Pending),
            "FULLY_FILLED" => Ok(EntryState::FullyFilled),
            "EXITED" => Ok(EntryState::Exited),
            other => Err(ParseEnumError {
                kind: "entry state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn of_entry(is_buy: bool) -> Self {
        if is_buy {
            Direction::Long
        } else {
            Direction::Short
        }
    }

    pub fn sign(&self) -> i64 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
        }
    }

    /// Signed position contributed by a fill of `quantity` contracts.
    pub fn quantity_to_position(&self, quantity: i64) -> i64 {
        self.sign() * quantity
    }

    /// Snap a stop target onto the instrument tick grid, rounding towards the
    /// "worse" side: up for a long position, down for a short. A price already
    /// on the grid is returned unchanged.
    pub fn nearest_worse_tick(&self, price: f64, tick: f64) -> f64 {
        if tick <= 0.0 {
            return price;
        }
        let steps = price / tick;
        let snapped = steps.round();
        if (steps - snapped).abs() < 1e-9 {
            return snapped * tick;
        }
        let steps = match self {
            Direction::Long => steps.ceil(),
            Direction::Short => steps.floor(),
        };
        steps * tick
    }
}

/// Position-book constraint a strategy may attach to an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraint {
    LongOnly,
    ShortOnly,
}

impl Constraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Constraint::LongOnly => "long-only",
            Constraint::ShortOnly => "short-only",
        }
    }
}

/// Recognised keys of the order comment bag.
pub mod comment_keys {
    pub const ATTACHMENT: &str = "attachment";
    pub const CONSTRAINT: &str = "constraint";
    pub const COST: &str = "cost";
    pub const CUSTOMIZED_QUANTITY: &str = "customized_quantity";
    pub const GOOD_TILL: &str = "good_till";
    pub const ORDER_REFERENCE: &str = "order_reference";
    pub const PATTERN_NAME: &str = "pattern_name";
    pub const EXCHANGE_TIMESTAMP: &str = "exchange_timestamp";
    pub const STOP_LOSS_ABSOLUTE: &str = "stop_loss_absolute";
    pub const STOP_LOSS_OFFSET: &str = "stop_loss_offset";
    pub const RISK_FACTOR: &str = "risk_factor";
}

#[derive(Debug, thiserror::Error)]
#[error("invalid comment key '{key}': {reason}")]
pub struct CommentError {
    pub key: &'static str,
    pub reason: String,
}

/// Free-form string-keyed bag carried on orders.
///
/// Stored opaquely in the ledger; the known keys are validated on ingress and
/// unknown keys pass through untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Comment(pub serde_json::Map<String, Value>);

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

impl Comment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_json_str(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    fn str_value(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn num_value(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(value_as_f64)
    }

    pub fn constraint(&self) -> Option<Constraint> {
        match self.str_value(comment_keys::CONSTRAINT)? {
            "long-only" => Some(Constraint::LongOnly),
            "short-only" => Some(Constraint::ShortOnly),
            _ => None,
        }
    }

    pub fn good_till(&self) -> Option<&str> {
        self.str_value(comment_keys::GOOD_TILL)
    }

    pub fn order_reference(&self) -> Option<&str> {
        self.str_value(comment_keys::ORDER_REFERENCE)
    }

    pub fn stop_loss_offset(&self) -> Option<f64> {
        self.num_value(comment_keys::STOP_LOSS_OFFSET)
    }

    pub fn stop_loss_absolute(&self) -> Option<f64> {
        self.num_value(comment_keys::STOP_LOSS_ABSOLUTE)
    }

    pub fn set_cost(&mut self, cost: f64) {
        if let Some(n) = serde_json::Number::from_f64(cost) {
            self.0
                .insert(comment_keys::COST.to_string(), Value::Number(n));
        }
    }

    /// Check the types of the recognised keys. Unknown keys are permitted.
    pub fn validate(&self) -> Result<(), CommentError> {
        use comment_keys::*;

        if let Some(v) = self.0.get(CONSTRAINT) {
            let ok = matches!(v.as_str(), Some("long-only") | Some("short-only"));
            if !ok {
                return Err(CommentError {
                    key: CONSTRAINT,
                    reason: format!("expected 'long-only' or 'short-only', got {v}"),
                });
            }
        }
        for key in [STOP_LOSS_OFFSET, STOP_LOSS_ABSOLUTE, COST, RISK_FACTOR, CUSTOMIZED_QUANTITY] {
            if let Some(v) = self.0.get(key) {
                if value_as_f64(v).is_none() {
                    return Err(CommentError {
                        key,
                        reason: format!("expected a number, got {v}"),
                    });
                }
            }
        }
        for key in [ATTACHMENT, GOOD_TILL, ORDER_REFERENCE, PATTERN_NAME, EXCHANGE_TIMESTAMP] {
            if let Some(v) = self.0.get(key) {
                if !v.is_string() {
                    return Err(CommentError {
                        key,
                        reason: format!("expected a string, got {v}"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment_from(v: Value) -> Comment {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn order_type_round_trip() {
        for (t, s) in [
            (OrderType::Mkt, "MKT"),
            (OrderType::Lmt, "LMT"),
            (OrderType::Stp, "STP"),
            (OrderType::StpLmt, "STP_LMT"),
        ] {
            assert_eq!(t.as_str(), s);
            assert_eq!(s.parse::<OrderType>().unwrap(), t);
        }
        assert!("IOC".parse::<OrderType>().is_err());
    }

    #[test]
    fn nearest_worse_tick_rounds_away() {
        let tick = 0.25;
        assert_eq!(Direction::Long.nearest_worse_tick(7290.0, tick), 7290.0);
        assert_eq!(Direction::Long.nearest_worse_tick(7290.1, tick), 7290.25);
        assert_eq!(Direction::Short.nearest_worse_tick(7290.1, tick), 7290.0);
        assert_eq!(Direction::Short.nearest_worse_tick(7289.9, tick), 7289.75);
    }

    #[test]
    fn direction_signs() {
        assert_eq!(Direction::Long.quantity_to_position(3), 3);
        assert_eq!(Direction::Short.quantity_to_position(3), -3);
        assert_eq!(Direction::of_entry(false), Direction::Short);
    }

    #[test]
    fn comment_accessors_accept_numeric_strings() {
        let c = comment_from(json!({
            "stop_loss_offset": "-10",
            "constraint": "long-only",
            "order_reference": "ref-1"
        }));
        assert_eq!(c.stop_loss_offset(), Some(-10.0));
        assert_eq!(c.constraint(), Some(Constraint::LongOnly));
        assert_eq!(c.order_reference(), Some("ref-1"));
        assert!(c.stop_loss_absolute().is_none());
        c.validate().unwrap();
    }

    #[test]
    fn comment_validation_rejects_bad_constraint() {
        let c = comment_from(json!({ "constraint": "flat-only" }));
        assert!(c.validate().is_err());

        let c = comment_from(json!({ "stop_loss_offset": {"nested": true} }));
        assert!(c.validate().is_err());
    }
}
