use crate::error::TraceError;
use crate::markets;
use crate::rpc::MAX_IN_FLIGHT;
use crate::scanner::{BlockRange, ProgressFn, Scanner, TransferEvent};
use alloy_primitives::{Address, U256};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Branching factor and significance threshold for pruning. The threshold is
/// a fraction of the ROOT's total outflow in basis points, applied at every
/// level so leaves always represent a consistent fraction of the traced
/// total.
#[derive(Debug, Clone, Copy)]
pub struct TraceParams {
    pub top_n: usize,
    pub threshold_bps: u32,
}

impl Default for TraceParams {
    fn default() -> Self {
        TraceParams {
            top_n: 10,
            threshold_bps: 1_000,
        }
    }
}

/// Recipients folded away below the significance threshold. Their aggregate
/// always sums with the retained branches back to the parent's total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrunedSummary {
    pub count: usize,
    #[serde(serialize_with = "ser_u256_dec")]
    pub amount: U256,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowNode {
    pub address: Address,
    /// Amount this address received from its parent in the tree.
    #[serde(serialize_with = "ser_u256_dec")]
    pub amount: U256,
    /// This address's own total outflow over the range; `None` when the node
    /// was not expanded (known receipt-token sink or maximum depth).
    #[serde(serialize_with = "ser_opt_u256_dec")]
    pub outflow_total: Option<U256>,
    pub children: Vec<FlowNode>,
    pub pruned: Option<PrunedSummary>,
}

/// Two-level flow graph rooted at a traced address. Plain data; rendering is
/// the presentation layer's concern.
#[derive(Debug, Clone, Serialize)]
pub struct FlowTree {
    pub root: Address,
    #[serde(serialize_with = "ser_u256_dec")]
    pub total: U256,
    pub branches: Vec<FlowNode>,
    pub pruned: Option<PrunedSummary>,
}

/// Sum outgoing transfer values by recipient. Burns (zero-address recipients)
/// and events not sent by `source` are ignored. Returns the aggregated total
/// alongside the per-recipient map.
pub fn aggregate_outflows(
    events: &[TransferEvent],
    source: Address,
) -> (U256, HashMap<Address, U256>) {
    let mut totals: HashMap<Address, U256> = HashMap::new();
    for event in events {
        if event.from != source || event.to == Address::ZERO {
            continue;
        }
        let entry = totals.entry(event.to).or_insert(U256::ZERO);
        *entry = entry.saturating_add(event.value);
    }

    let total = totals.values().fold(U256::ZERO, |acc, v| acc.saturating_add(*v));
    (total, totals)
}

fn is_significant(amount: U256, root_total: U256, threshold_bps: u32) -> bool {
    amount.saturating_mul(U256::from(10_000u64))
        >= root_total.saturating_mul(U256::from(threshold_bps))
}

/// Pick the branches to expand: recipients sorted by amount descending, kept
/// only while within the top-N cap AND at or above the significance
/// threshold relative to `root_total`. Everything else folds into one
/// `PrunedSummary`, preserving `Σ(kept) + pruned == Σ(totals)` exactly.
pub fn select_branches(
    totals: &HashMap<Address, U256>,
    root_total: U256,
    params: &TraceParams,
) -> (Vec<(Address, U256)>, Option<PrunedSummary>) {
    let mut sorted: Vec<(Address, U256)> = totals.iter().map(|(a, v)| (*a, *v)).collect();
    sorted.sort_by(|(addr_a, amt_a), (addr_b, amt_b)| {
        amt_b.cmp(amt_a).then_with(|| addr_a.cmp(addr_b))
    });

    let keep = sorted
        .iter()
        .take(params.top_n)
        .take_while(|(_, amount)| is_significant(*amount, root_total, params.threshold_bps))
        .count();

    let pruned_branches = &sorted[keep..];
    let pruned = if pruned_branches.is_empty() {
        None
    } else {
        Some(PrunedSummary {
            count: pruned_branches.len(),
            amount: pruned_branches
                .iter()
                .fold(U256::ZERO, |acc, (_, v)| acc.saturating_add(*v)),
        })
    };

    sorted.truncate(keep);
    (sorted, pruned)
}

/// Trace the outflows of `source` for the `underlying` token over `range`,
/// two levels deep. Level-1 recipients are expanded concurrently (bounded
/// pool) unless they are known receipt-token sinks; level-2 expansion prunes
/// against the original root total, never the local one.
pub async fn trace_outflows(
    scanner: &Scanner,
    chain_id: u64,
    underlying: Address,
    source: Address,
    range: BlockRange,
    params: &TraceParams,
    progress: Option<&ProgressFn>,
) -> Result<FlowTree, TraceError> {
    info!(
        "Tracing outflows of {:?} for token {:?} over blocks {}-{}",
        source, underlying, range.from, range.to
    );

    let events = scanner
        .scan_outflows(underlying, source, range, progress)
        .await?;
    let (root_total, totals) = aggregate_outflows(&events, source);
    let (level1, pruned_root) = select_branches(&totals, root_total, params);

    debug!(
        "Root total {} across {} recipient(s), expanding {}",
        root_total,
        totals.len(),
        level1.len()
    );

    // Level-2 scans only start once the level-1 selection is final: the set
    // of recipients to expand depends on it.
    let branches: Vec<FlowNode> = futures::stream::iter(level1)
        .map(|(recipient, amount)| async move {
            if markets::receipt_token_label(recipient, chain_id).is_some() {
                return Ok::<_, TraceError>(FlowNode {
                    address: recipient,
                    amount,
                    outflow_total: None,
                    children: Vec::new(),
                    pruned: None,
                });
            }

            let events = scanner
                .scan_outflows(underlying, recipient, range, None)
                .await?;
            let (outflow_total, recipient_totals) = aggregate_outflows(&events, recipient);
            let (kept, pruned) = select_branches(&recipient_totals, root_total, params);

            let children = kept
                .into_iter()
                .map(|(address, amount)| FlowNode {
                    address,
                    amount,
                    outflow_total: None,
                    children: Vec::new(),
                    pruned: None,
                })
                .collect();

            Ok(FlowNode {
                address: recipient,
                amount,
                outflow_total: Some(outflow_total),
                children,
                pruned,
            })
        })
        .buffered(MAX_IN_FLIGHT)
        .try_collect()
        .await?;

    Ok(FlowTree {
        root: source,
        total: root_total,
        branches,
        pruned: pruned_root,
    })
}

/// Share of `total` that `amount` represents, for display.
pub fn share_percent(amount: U256, total: U256) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    let amount: f64 = amount.to_string().parse().unwrap_or(0.0);
    let total: f64 = total.to_string().parse().unwrap_or(f64::MAX);
    amount / total * 100.0
}

fn ser_u256_dec<S: serde::Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

fn ser_opt_u256_dec<S: serde::Serializer>(
    value: &Option<U256>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_some(&v.to_string()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn totals(entries: &[(u8, u64)]) -> HashMap<Address, U256> {
        entries
            .iter()
            .map(|(a, v)| (addr(*a), U256::from(*v)))
            .collect()
    }

    #[test]
    fn prunes_below_threshold() {
        // root total 1000, θ=10%, N=3: W at 50 < 100 is pruned.
        let totals = totals(&[(1, 500), (2, 300), (3, 150), (4, 50)]);
        let params = TraceParams {
            top_n: 3,
            threshold_bps: 1_000,
        };

        let (kept, pruned) = select_branches(&totals, U256::from(1_000), &params);

        assert_eq!(
            kept,
            vec![
                (addr(1), U256::from(500)),
                (addr(2), U256::from(300)),
                (addr(3), U256::from(150)),
            ]
        );
        assert_eq!(
            pruned,
            Some(PrunedSummary {
                count: 1,
                amount: U256::from(50)
            })
        );
    }

    #[test]
    fn top_n_cap_applies_even_when_significant() {
        let totals = totals(&[(1, 500), (2, 300), (3, 150), (4, 50)]);
        let params = TraceParams {
            top_n: 2,
            threshold_bps: 1_000,
        };

        let (kept, pruned) = select_branches(&totals, U256::from(1_000), &params);

        assert_eq!(kept.len(), 2);
        assert_eq!(
            pruned,
            Some(PrunedSummary {
                count: 2,
                amount: U256::from(200)
            })
        );
    }

    #[test]
    fn kept_plus_pruned_equals_total() {
        let partitions: &[&[(u8, u64)]] = &[
            &[(1, 999), (2, 1)],
            &[(1, 250), (2, 250), (3, 250), (4, 250)],
            &[(1, 10), (2, 20), (3, 30), (4, 40), (5, 900)],
            &[(1, 1)],
        ];

        for partition in partitions {
            let totals = totals(partition);
            let total = totals.values().fold(U256::ZERO, |a, v| a + v);
            let params = TraceParams {
                top_n: 2,
                threshold_bps: 1_000,
            };

            let (kept, pruned) = select_branches(&totals, total, &params);
            let kept_sum = kept.iter().fold(U256::ZERO, |a, (_, v)| a + v);
            let pruned_sum = pruned.map(|p| p.amount).unwrap_or(U256::ZERO);
            assert_eq!(kept_sum + pruned_sum, total);
        }
    }

    #[test]
    fn nothing_pruned_when_all_kept() {
        let totals = totals(&[(1, 600), (2, 400)]);
        let params = TraceParams::default();

        let (kept, pruned) = select_branches(&totals, U256::from(1_000), &params);
        assert_eq!(kept.len(), 2);
        assert_eq!(pruned, None);
    }

    #[test]
    fn zero_root_total_keeps_nothing_significant() {
        let totals: HashMap<Address, U256> = HashMap::new();
        let (kept, pruned) = select_branches(&totals, U256::ZERO, &TraceParams::default());
        assert!(kept.is_empty());
        assert_eq!(pruned, None);
    }

    #[test]
    fn aggregates_by_recipient_skipping_burns_and_foreign_events() {
        let source = addr(1);
        let events = vec![
            TransferEvent {
                from: source,
                to: addr(2),
                value: U256::from(30),
                block_number: 1,
            },
            TransferEvent {
                from: source,
                to: addr(2),
                value: U256::from(20),
                block_number: 2,
            },
            TransferEvent {
                from: source,
                to: addr(3),
                value: U256::from(10),
                block_number: 3,
            },
            // burn: no recipient to attribute
            TransferEvent {
                from: source,
                to: Address::ZERO,
                value: U256::from(99),
                block_number: 4,
            },
            // not sent by source
            TransferEvent {
                from: addr(9),
                to: addr(2),
                value: U256::from(1_000),
                block_number: 5,
            },
        ];

        let (total, totals) = aggregate_outflows(&events, source);
        assert_eq!(total, U256::from(60));
        assert_eq!(totals[&addr(2)], U256::from(50));
        assert_eq!(totals[&addr(3)], U256::from(10));
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn share_percent_is_stable_at_edges() {
        assert_eq!(share_percent(U256::from(0), U256::ZERO), 0.0);
        assert!((share_percent(U256::from(500), U256::from(1_000)) - 50.0).abs() < 1e-9);
    }
}
