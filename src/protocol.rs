use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Action, Comment, EntryState, OrderType};

/// Envelope group every OMS payload must carry.
pub const GROUP: &str = "oms";

const MSG_TYPES: [&str; 7] = [
    "init",
    "next_request_id",
    "heartbeat",
    "new_order",
    "position",
    "execution",
    "error",
];

/// Heartbeat contract shared between server and client.
///
/// All change must be deployed to both sides.
pub struct Heartbeat;

impl Heartbeat {
    /// Heartbeat sent every n seconds.
    pub const INTERVAL: i64 = 15;
    /// At most this many heartbeats can be missed.
    pub const LIVENESS: i64 = 5;
    /// Wait this long before the first reconnect attempt.
    pub const RETRY_INTERVAL: u64 = 2;
    /// Cap on the doubling reconnect backoff.
    pub const MAX_RETRY_INTERVAL: u64 = 32;

    pub fn is_expired(last: Option<NaiveDateTime>) -> bool {
        Self::is_expired_at(last, Utc::now().naive_utc())
    }

    pub fn is_expired_at(last: Option<NaiveDateTime>, now: NaiveDateTime) -> bool {
        match last {
            Some(last) => now > last + Duration::seconds(Self::LIVENESS * Self::INTERVAL),
            None => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    SystemError,
    DuplicatedSessionId,
    BadRequestId,
    AlreadyLoggedIn,
    NotLoggedIn,
    InitError,
    OrderError,
    OrderRejected,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::SystemError => 100,
            ErrorCode::DuplicatedSessionId => 101,
            ErrorCode::BadRequestId => 102,
            ErrorCode::AlreadyLoggedIn => 103,
            ErrorCode::NotLoggedIn => 104,
            ErrorCode::InitError => 105,
            ErrorCode::OrderError => 106,
            ErrorCode::OrderRejected => 107,
        }
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            100 => Ok(ErrorCode::SystemError),
            101 => Ok(ErrorCode::DuplicatedSessionId),
            102 => Ok(ErrorCode::BadRequestId),
            103 => Ok(ErrorCode::AlreadyLoggedIn),
            104 => Ok(ErrorCode::NotLoggedIn),
            105 => Ok(ErrorCode::InitError),
            106 => Ok(ErrorCode::OrderError),
            107 => Ok(ErrorCode::OrderRejected),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected message group '{GROUP}', got '{0}'")]
    WrongGroup(String),

    #[error("unsupported message type: {0}")]
    UnknownMsgType(String),
}

/// One fill reported back to the owning session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionItem {
    pub order_id: i64,
    pub execution_id: String,
    pub execution_time: String,
    pub market: String,
    pub symbol: String,
    pub is_buy: bool,
    pub quantity: i64,
    pub price: f64,
    pub remaining_quantity: i64,
    pub portfolio: String,
    pub strategy: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<Comment>,
}

/// The order that opened a per-entry position, echoed in position replies.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub order_id: i64,
    pub market: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub is_buy: bool,
    pub quantity: i64,
    pub price: f64,
    pub portfolio: String,
    pub action: Action,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<Comment>,
}

/// Manual adjustment recorded against an entry's order reference.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OperationItem {
    pub created: String,
    pub action: Action,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionByEntryItem {
    pub position: i64,
    pub avg_price: f64,
    pub state: EntryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionItem {
    pub strategy: String,
    pub market: String,
    pub symbol: String,
    pub position: i64,
    pub avg_price: f64,
    #[serde(default)]
    pub force_renew: bool,
    #[serde(default)]
    pub positions_by_entry: Vec<PositionByEntryItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionPortfolio {
    pub id: String,
    #[serde(default)]
    pub positions: Vec<PositionItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cash: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default)]
    pub portfolios: Vec<PositionPortfolio>,
}

/// Every message exchanged between strategy clients and the OMS.
///
/// The `msg_type` tag picks the variant; the envelope additionally carries
/// `group = "oms"`, checked by [`decode`] and stamped by [`encode`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum OmsMessage {
    Init {
        session_id: String,
        account_id: String,
        strategies: BTreeMap<String, String>,
    },
    NextRequestId {
        next_request_id: i64,
    },
    Heartbeat {
        timestamp: String,
        next: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_ready: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    NewOrder {
        request_id: i64,
        market: String,
        symbol: String,
        order_type: OrderType,
        is_buy: bool,
        quantity: i64,
        price: f64,
        portfolio: String,
        action: Action,
        strategy: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default)]
        comment: Comment,
    },
    Position {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<PositionAccount>,
    },
    Execution {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<i64>,
        #[serde(default)]
        items: Vec<ExecutionItem>,
    },
    Error {
        error_code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<i64>,
    },
}

impl OmsMessage {
    /// Whether this message kind carries a `request_id` field. Every such
    /// message advances the session's persistent request counter.
    pub fn carries_request_id(&self) -> bool {
        matches!(
            self,
            OmsMessage::NewOrder { .. } | OmsMessage::Position { .. } | OmsMessage::Execution { .. }
        )
    }

    pub fn request_id(&self) -> Option<i64> {
        match self {
            OmsMessage::NewOrder { request_id, .. } => Some(*request_id),
            OmsMessage::Position { request_id, .. } => *request_id,
            OmsMessage::Execution { request_id, .. } => *request_id,
            OmsMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            OmsMessage::Init { .. } => "init",
            OmsMessage::NextRequestId { .. } => "next_request_id",
            OmsMessage::Heartbeat { .. } => "heartbeat",
            OmsMessage::NewOrder { .. } => "new_order",
            OmsMessage::Position { .. } => "position",
            OmsMessage::Execution { .. } => "execution",
            OmsMessage::Error { .. } => "error",
        }
    }
}

/// ISO-8601 wire form of a UTC-naive timestamp.
pub fn wire_timestamp(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub fn decode_value(value: Value) -> Result<OmsMessage, CodecError> {
    let group = value.get("group").and_then(Value::as_str).unwrap_or("");
    if group != GROUP {
        return Err(CodecError::WrongGroup(group.to_string()));
    }

    let msg_type = value
        .get("msg_type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if !MSG_TYPES.contains(&msg_type.as_str()) {
        return Err(CodecError::UnknownMsgType(msg_type));
    }

    Ok(serde_json::from_value(value)?)
}

pub fn decode(raw: &str) -> Result<OmsMessage, CodecError> {
    decode_value(serde_json::from_str(raw)?)
}

pub fn encode_value(msg: &OmsMessage) -> Result<Value, CodecError> {
    let mut value = serde_json::to_value(msg)?;
    if let Value::Object(map) = &mut value {
        map.insert("group".to_string(), Value::String(GROUP.to_string()));
    }
    Ok(value)
}

pub fn encode(msg: &OmsMessage) -> Result<String, CodecError> {
    Ok(encode_value(msg)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn decode_rejects_wrong_group() {
        let raw = r#"{"group":"md","msg_type":"heartbeat","timestamp":"t","next":"n"}"#;
        assert!(matches!(decode(raw), Err(CodecError::WrongGroup(g)) if g == "md"));
    }

    #[test]
    fn decode_rejects_unknown_msg_type() {
        let raw = r#"{"group":"oms","msg_type":"modify_order"}"#;
        assert!(matches!(decode(raw), Err(CodecError::UnknownMsgType(t)) if t == "modify_order"));
    }

    #[test]
    fn init_round_trip() {
        let msg = OmsMessage::Init {
            session_id: "S1".to_string(),
            account_id: "ACC".to_string(),
            strategies: [("S1".to_string(), "main".to_string())].into_iter().collect(),
        };
        let raw = encode(&msg).unwrap();
        assert!(raw.contains(r#""group":"oms""#));
        assert!(raw.contains(r#""msg_type":"init""#));
        assert_eq!(decode(&raw).unwrap(), msg);
    }

    #[test]
    fn new_order_carries_request_id() {
        let raw = r#"{
            "group": "oms",
            "msg_type": "new_order",
            "request_id": 7,
            "market": "CME",
            "symbol": "NQ",
            "order_type": "MKT",
            "is_buy": true,
            "quantity": 1,
            "price": 0.0,
            "portfolio": "main",
            "action": "ENTRY",
            "strategy": "S1",
            "comment": {"stop_loss_offset": -10}
        }"#;
        let msg = decode(raw).unwrap();
        assert!(msg.carries_request_id());
        assert_eq!(msg.request_id(), Some(7));
        match &msg {
            OmsMessage::NewOrder { comment, .. } => {
                assert_eq!(comment.stop_loss_offset(), Some(-10.0));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_code_on_the_wire_is_numeric() {
        let msg = OmsMessage::Error {
            error_code: ErrorCode::DuplicatedSessionId,
            message: "dup".to_string(),
            session_id: None,
            request_id: None,
        };
        let raw = encode(&msg).unwrap();
        assert!(raw.contains(r#""error_code":101"#));
        assert_eq!(decode(&raw).unwrap(), msg);
    }

    #[test]
    fn heartbeat_expiry_window() {
        let last = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let inside = last + Duration::seconds(Heartbeat::LIVENESS * Heartbeat::INTERVAL);
        let outside = inside + Duration::seconds(1);
        assert!(!Heartbeat::is_expired_at(Some(last), inside));
        assert!(Heartbeat::is_expired_at(Some(last), outside));
        assert!(!Heartbeat::is_expired_at(None, outside));
    }
}
