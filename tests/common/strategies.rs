use proptest::prelude::*;

/// Per-unit output counts for a batch of 1..=12 units
pub fn unit_outputs_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..50, 1..=12)
}

/// A delivery order over `n` units in which every unit appears at least once and
/// some are repeated, modelling worker retries
pub fn delivery_order_strategy(n: usize) -> impl Strategy<Value = Vec<usize>> {
    (
        Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
        prop::collection::vec((0..n, 0..=n), 0..n.max(1) * 2),
    )
        .prop_map(|(mut order, duplicates)| {
            for (unit, position) in duplicates {
                let at = position.min(order.len());
                order.insert(at, unit);
            }
            order
        })
}

/// Batches plus their delivery orders
pub fn batch_delivery_strategy() -> impl Strategy<Value = (Vec<u64>, Vec<usize>)> {
    unit_outputs_strategy().prop_flat_map(|outputs| {
        let n = outputs.len();
        (Just(outputs), delivery_order_strategy(n))
    })
}

/// Staged rows per unit as (key index, value) pairs; keys overlap across units
pub fn staged_keys_strategy() -> impl Strategy<Value = Vec<Vec<(u8, i64)>>> {
    prop::collection::vec(prop::collection::vec((0u8..20, any::<i64>()), 1..8), 1..6)
}
