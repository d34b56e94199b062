//! Pure decision logic for the broker-event state machine. Everything here
//! is a free function over plain data so the invariants can be tested
//! without a ledger or a gateway.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::domain::{Comment, Constraint, Direction};
use crate::instruments::{ContractMonth, RollInstruction};
use crate::ledger::models::OrderRow;

/// Average-price law: blending a fill of `fill_position` at `fill_price`
/// into an existing same-sign position of `existing_position` at
/// `existing_avg`.
pub fn blended_avg_price(
    existing_position: i64,
    existing_avg: f64,
    fill_position: i64,
    fill_price: f64,
) -> f64 {
    let existing = existing_position.abs() as f64;
    let fill = fill_position.abs() as f64;
    if existing == 0.0 {
        return fill_price;
    }
    (fill_price * fill + existing_avg * existing) / (fill + existing)
}

/// Long-only / short-only check against the projected position. Returns the
/// rejection reason when violated.
pub fn check_constraint(
    constraint: Constraint,
    current_position: i64,
    is_buy: bool,
    quantity: i64,
) -> Result<(), String> {
    let projected = current_position + if is_buy { quantity } else { -quantity };
    let violated = match constraint {
        Constraint::LongOnly => projected < 0,
        Constraint::ShortOnly => projected > 0,
    };
    if violated {
        Err(format!(
            "Violated '{}' constraint with projected position equals {}",
            constraint.as_str(),
            projected
        ))
    } else {
        Ok(())
    }
}

/// Price for the stop-loss synthesised when an entry fills.
///
/// `stop_loss_absolute` in the comment overrides the offset calculation;
/// otherwise the target is `avg_price + stop_loss_offset` snapped onto the
/// tick grid towards the worse side of the entry. Returns `None` when the
/// comment carries neither key.
pub fn stop_loss_price(
    entry_is_buy: bool,
    avg_price: f64,
    comment: &Comment,
    tick_size: Option<f64>,
) -> Option<f64> {
    if let Some(absolute) = comment.stop_loss_absolute() {
        return Some(absolute);
    }
    let offset = comment.stop_loss_offset()?;
    let direction = Direction::of_entry(entry_is_buy);
    Some(direction.nearest_worse_tick(avg_price + offset, tick_size.unwrap_or(0.0)))
}

/// One step of covering an exit against the open entry tickets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStep {
    /// The lot at `index` is fully covered and becomes EXITED.
    Exit { index: usize },
    /// The lot at `index` is partially covered and shrinks to `new_position`;
    /// its resting stop must be replaced with the reduced quantity.
    Reduce { index: usize, new_position: i64 },
}

/// Allocate an exit of `exit_quantity` contracts across the open entry lots,
/// walked in the order given (the ledger returns them newest first).
pub fn plan_exit_allocation(lot_positions: &[i64], exit_quantity: i64) -> Vec<ExitStep> {
    let mut remaining = exit_quantity;
    let mut steps = Vec::new();
    for (index, &position) in lot_positions.iter().enumerate() {
        if remaining <= 0 {
            break;
        }
        if position <= 0 {
            continue;
        }
        if remaining < position {
            steps.push(ExitStep::Reduce {
                index,
                new_position: position - remaining,
            });
            remaining = 0;
        } else {
            steps.push(ExitStep::Exit { index });
            remaining -= position;
        }
    }
    steps
}

/// Ledger-open entry orders missing from a broker open-orders snapshot.
pub fn missing_open_orders<'a>(
    ledger_open: &'a [OrderRow],
    available: &HashSet<(String, i64)>,
) -> Vec<&'a OrderRow> {
    ledger_open
        .iter()
        .filter(|order| {
            !available.contains(&(order.broker_id.clone(), order.broker_order_id))
        })
        .collect()
}

/// What the core does with a broker-reported order error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderErrorDisposition {
    /// Unwind the entry ticket and publish ORDER_REJECTED.
    RejectEntry,
    /// Mark the order INACTIVE.
    MarkInactive,
    DisconnectBroker,
    ReconnectBroker,
    /// Forward to the owning session as ORDER_ERROR.
    Forward,
}

pub fn classify_order_error(code: i64) -> OrderErrorDisposition {
    match code {
        103 | 107 | 109 | 110 | 116 | 200 | 201 | 10149 => OrderErrorDisposition::RejectEntry,
        10147 => OrderErrorDisposition::MarkInactive,
        502 | 504 | 1100 => OrderErrorDisposition::DisconnectBroker,
        1101 | 1102 => OrderErrorDisposition::ReconnectBroker,
        _ => OrderErrorDisposition::Forward,
    }
}

/// Sum the stop quantities covering a position (buy stops count against).
/// Returns the covered quantity when it disagrees with the position.
pub fn stop_coverage_gap(position: i64, stops: &[(bool, i64)]) -> Option<i64> {
    let covered: i64 = stops
        .iter()
        .map(|(is_buy, quantity)| if *is_buy { -quantity } else { *quantity })
        .sum();
    (position != covered).then_some(covered)
}

/// Whether the ledger's view of an instrument is behind the repository's
/// front month.
pub fn roll_required(db_code: &str, db_expiry: chrono::NaiveDateTime, front: &ContractMonth) -> bool {
    db_code != front.code && db_expiry < front.expiry
}

/// A roll proceeds only when the operator instruction matches the detected
/// transition and is dated today in the exchange timezone.
pub fn roll_is_due(
    instruction: &RollInstruction,
    last_month_code: &str,
    front_month_code: &str,
    today_in_exchange_tz: NaiveDate,
) -> bool {
    instruction.roll_on_next_start
        && instruction.from == last_month_code
        && instruction.to == front_month_code
        && instruction.date == today_in_exchange_tz
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment(v: serde_json::Value) -> Comment {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn avg_price_blends_by_magnitude() {
        // 1 @ 7300 onto an empty book
        assert_eq!(blended_avg_price(0, 0.0, 1, 7300.0), 7300.0);
        // 1 @ 110 onto 1 @ 100 -> 105
        assert_eq!(blended_avg_price(1, 100.0, 1, 110.0), 105.0);
        // shorts blend by magnitude too
        assert_eq!(blended_avg_price(-3, 100.0, -1, 120.0), 105.0);
    }

    #[test]
    fn constraint_rejection_message() {
        let err = check_constraint(Constraint::LongOnly, 2, false, 5).unwrap_err();
        assert_eq!(
            err,
            "Violated 'long-only' constraint with projected position equals -3"
        );
        assert!(check_constraint(Constraint::LongOnly, 2, false, 2).is_ok());
        assert!(check_constraint(Constraint::ShortOnly, -2, true, 5).is_err());
    }

    #[test]
    fn stop_price_from_offset() {
        let c = comment(json!({"stop_loss_offset": -10}));
        assert_eq!(stop_loss_price(true, 7300.0, &c, Some(0.25)), Some(7290.0));
        // off-grid targets round towards the worse side of the entry
        let c = comment(json!({"stop_loss_offset": -10.1}));
        assert_eq!(stop_loss_price(true, 7300.0, &c, Some(0.25)), Some(7290.0));
        assert_eq!(stop_loss_price(false, 7300.0, &c, Some(0.25)), Some(7289.75));
    }

    #[test]
    fn absolute_stop_overrides_offset() {
        let c = comment(json!({"stop_loss_offset": -10, "stop_loss_absolute": 7299}));
        assert_eq!(stop_loss_price(true, 7300.0, &c, Some(0.25)), Some(7299.0));
    }

    #[test]
    fn stop_price_requires_offset_or_absolute() {
        assert_eq!(stop_loss_price(true, 7300.0, &Comment::new(), Some(0.25)), None);
    }

    #[test]
    fn exit_allocation_exhausts_newest_first() {
        // lots: 2, 3, 5 (newest first); exit 4 -> first lot exits, second
        // shrinks to 1
        let steps = plan_exit_allocation(&[2, 3, 5], 4);
        assert_eq!(
            steps,
            vec![
                ExitStep::Exit { index: 0 },
                ExitStep::Reduce {
                    index: 1,
                    new_position: 1
                },
            ]
        );
    }

    #[test]
    fn exit_allocation_full_cover() {
        let steps = plan_exit_allocation(&[2, 3], 5);
        assert_eq!(
            steps,
            vec![ExitStep::Exit { index: 0 }, ExitStep::Exit { index: 1 }]
        );
        // an over-sized exit stops at the last lot
        assert_eq!(plan_exit_allocation(&[2], 5), vec![ExitStep::Exit { index: 0 }]);
        assert!(plan_exit_allocation(&[2, 3], 0).is_empty());
    }

    #[test]
    fn order_error_classification() {
        assert_eq!(classify_order_error(201), OrderErrorDisposition::RejectEntry);
        assert_eq!(classify_order_error(10149), OrderErrorDisposition::RejectEntry);
        assert_eq!(classify_order_error(10147), OrderErrorDisposition::MarkInactive);
        assert_eq!(classify_order_error(1100), OrderErrorDisposition::DisconnectBroker);
        assert_eq!(classify_order_error(1101), OrderErrorDisposition::ReconnectBroker);
        assert_eq!(classify_order_error(399), OrderErrorDisposition::Forward);
    }

    #[test]
    fn stop_coverage_detects_gaps() {
        // +3 long covered by a single sell stop of 3
        assert_eq!(stop_coverage_gap(3, &[(false, 3)]), None);
        // a missing contract shows up as a gap
        assert_eq!(stop_coverage_gap(3, &[(false, 2)]), Some(2));
        // -2 short covered by a buy stop of 2
        assert_eq!(stop_coverage_gap(-2, &[(true, 2)]), None);
        assert_eq!(stop_coverage_gap(0, &[]), None);
    }

    #[test]
    fn roll_gating() {
        let instruction = RollInstruction {
            roll_on_next_start: true,
            from: "NQU5".to_string(),
            to: "NQZ5".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 9, 12).unwrap(),
            offset: 25.0,
            net_position: 3,
        };
        let today = NaiveDate::from_ymd_opt(2025, 9, 12).unwrap();
        assert!(roll_is_due(&instruction, "NQU5", "NQZ5", today));
        assert!(!roll_is_due(&instruction, "NQU5", "NQZ5", today.succ_opt().unwrap()));
        assert!(!roll_is_due(&instruction, "NQM5", "NQZ5", today));
    }
}
