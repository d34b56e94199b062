//! Book-keeping laws exercised end to end over fill sequences: position
//! conservation, the average-price law, the per-entry lifecycle and stop
//! coverage across partial exits.

use futures_oms::domain::{Direction, EntryState};
use futures_oms::server::logic::{
    blended_avg_price, plan_exit_allocation, stop_coverage_gap, ExitStep,
};

/// Net position folded from signed fills must equal the additive updates the
/// ledger applies per execution.
#[test]
fn position_conservation_over_a_fill_sequence() {
    let fills: [(bool, i64, f64); 4] = [
        (true, 1, 7300.0),
        (true, 2, 7310.0),
        (false, 1, 7320.0),
        (true, 3, 7305.0),
    ];

    let mut position = 0i64;
    for (is_buy, quantity, _) in fills {
        position += Direction::of_entry(is_buy).quantity_to_position(quantity);
    }

    let expected: i64 = fills
        .iter()
        .map(|(is_buy, q, _)| if *is_buy { *q } else { -q })
        .sum();
    assert_eq!(position, expected);
    assert_eq!(position, 5);
}

/// Blending same-sign fills keeps the average inside the traded price range
/// and weights by magnitude.
#[test]
fn average_price_law_over_accumulation() {
    let mut position = 0i64;
    let mut avg = 0.0;
    for (quantity, price) in [(1i64, 7300.0), (2, 7310.0), (1, 7290.0)] {
        avg = blended_avg_price(position, avg, quantity, price);
        position += quantity;
    }
    assert_eq!(position, 4);
    // (1*7300 + 2*7310 + 1*7290) / 4
    assert!((avg - 7302.5).abs() < 1e-9);
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Lot {
    position: i64,
    state: EntryState,
}

fn apply_exit(lots: &mut [Lot], exit_quantity: i64) {
    let positions: Vec<i64> = lots.iter().map(|l| l.position).collect();
    for step in plan_exit_allocation(&positions, exit_quantity) {
        match step {
            ExitStep::Exit { index } => lots[index].state = EntryState::Exited,
            ExitStep::Reduce {
                index,
                new_position,
            } => lots[index].position = new_position,
        }
    }
}

/// Every lot that reaches EXITED was FULLY_FILLED beforehand; partially
/// covered lots shrink without changing state.
#[test]
fn entry_lifecycle_exits_through_fully_filled() {
    let mut lots = vec![
        Lot {
            position: 2,
            state: EntryState::FullyFilled,
        },
        Lot {
            position: 3,
            state: EntryState::FullyFilled,
        },
    ];

    apply_exit(&mut lots, 4);

    assert_eq!(lots[0].state, EntryState::Exited);
    assert_eq!(lots[1].state, EntryState::FullyFilled);
    assert_eq!(lots[1].position, 1);

    apply_exit(&mut lots[1..], 1);
    assert_eq!(lots[1].state, EntryState::Exited);
}

/// After a partial exit the replacement stop carries the reduced quantity,
/// so coverage holds again.
#[test]
fn stop_replacement_after_partial_exit_restores_coverage() {
    let mut lots = vec![Lot {
        position: 3,
        state: EntryState::FullyFilled,
    }];
    // long 3, covered by one resting sell stop of 3
    let mut stops: Vec<(bool, i64)> = vec![(false, 3)];
    assert_eq!(stop_coverage_gap(3, &stops), None);

    // the exit pre-hook pulls the stop, then 1 contract exits
    stops.clear();
    apply_exit(&mut lots, 1);
    assert_eq!(lots[0].position, 2);
    assert_eq!(lots[0].state, EntryState::FullyFilled);

    // the replacement stop is re-issued at the reduced quantity
    stops.push((false, lots[0].position));
    assert_eq!(stop_coverage_gap(lots[0].position, &stops), None);

    // a short book mirrors with buy stops
    assert_eq!(stop_coverage_gap(-2, &[(true, 2)]), None);
    assert_eq!(stop_coverage_gap(-2, &[(true, 1)]), Some(-1));
}
