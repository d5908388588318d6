use crate::error::TraceError;
use crate::scanner::{BlockRange, ProgressFn, Scanner, TransferEvent};
use alloy_primitives::{Address, U256};
use std::collections::HashMap;
use tracing::{info, warn};

/// An ERC20-like contract whose Transfer log is the source of truth.
#[derive(Debug, Clone)]
pub struct Token {
    pub address: Address,
    pub name: String,
    pub deployment_block: u64,
}

/// Result of folding a transfer history: per-address balances plus the count
/// of clamped underflows observed along the way.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ledger {
    pub balances: HashMap<Address, U256>,
    pub underflows: u64,
}

impl Ledger {
    /// Addresses with a strictly positive balance. Zero-balance entries may
    /// remain internally but are never reported.
    pub fn holders(&self) -> HashMap<Address, U256> {
        self.balances
            .iter()
            .filter(|(_, balance)| **balance > U256::ZERO)
            .map(|(address, balance)| (*address, *balance))
            .collect()
    }
}

/// Fold transfer events into per-address balances.
///
/// The zero address is the mint/burn sentinel and is never tracked. A
/// subtraction that would underflow means the event stream is missing an
/// earlier prefix (scan started past the true deployment); the balance is
/// clamped to zero and the inconsistency reported, never wrapped around.
pub fn fold_balances(events: &[TransferEvent]) -> Ledger {
    let mut ledger = Ledger::default();

    for event in events {
        if event.from != Address::ZERO {
            let balance = ledger.balances.entry(event.from).or_insert(U256::ZERO);
            if *balance < event.value {
                warn!(
                    "Balance underflow for {:?} at block {}: {} < {}, clamping to zero \
                     (incomplete event history?)",
                    event.from, event.block_number, balance, event.value
                );
                ledger.underflows += 1;
                *balance = U256::ZERO;
            } else {
                *balance -= event.value;
            }
        }

        if event.to != Address::ZERO {
            let balance = ledger.balances.entry(event.to).or_insert(U256::ZERO);
            *balance = balance.saturating_add(event.value);
        }
    }

    ledger
}

/// Reconstruct the holder set of `token` at `end_block` by replaying its
/// transfer history from the deployment block.
pub async fn token_holders(
    scanner: &Scanner,
    token: &Token,
    end_block: u64,
    progress: Option<&ProgressFn>,
) -> Result<Ledger, TraceError> {
    let range = BlockRange::new(token.deployment_block, end_block)?;
    info!(
        "Reconstructing holders of {} ({:?}) at block {}",
        token.name, token.address, end_block
    );

    let events = scanner.scan_transfers(token.address, range, progress).await?;
    let ledger = fold_balances(&events);

    if ledger.underflows > 0 {
        warn!(
            "{} underflow(s) clamped while folding {}; holder set may be incomplete",
            ledger.underflows, token.name
        );
    }
    info!(
        "{} holds a non-zero balance out of {} addresses seen",
        ledger.holders().len(),
        ledger.balances.len()
    );
    Ok(ledger)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: Address, to: Address, value: u64, block: u64) -> TransferEvent {
        TransferEvent {
            from,
            to,
            value: U256::from(value),
            block_number: block,
        }
    }

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn mint_transfer_chain() {
        let events = vec![
            transfer(Address::ZERO, addr(1), 100, 1),
            transfer(addr(1), addr(2), 40, 2),
            transfer(addr(2), addr(3), 10, 3),
        ];

        let ledger = fold_balances(&events);
        let holders = ledger.holders();

        assert_eq!(holders[&addr(1)], U256::from(60));
        assert_eq!(holders[&addr(2)], U256::from(30));
        assert_eq!(holders[&addr(3)], U256::from(10));
        assert_eq!(ledger.underflows, 0);
    }

    #[test]
    fn zero_address_is_never_a_holder() {
        let events = vec![
            transfer(Address::ZERO, addr(1), 100, 1),
            transfer(addr(1), Address::ZERO, 30, 2),
        ];

        let ledger = fold_balances(&events);
        assert!(!ledger.balances.contains_key(&Address::ZERO));
        assert_eq!(ledger.holders()[&addr(1)], U256::from(70));
    }

    #[test]
    fn fully_spent_addresses_are_not_holders() {
        let events = vec![
            transfer(Address::ZERO, addr(1), 100, 1),
            transfer(addr(1), addr(2), 100, 2),
        ];

        let ledger = fold_balances(&events);
        let holders = ledger.holders();
        assert!(!holders.contains_key(&addr(1)));
        assert_eq!(holders[&addr(2)], U256::from(100));
    }

    #[test]
    fn underflow_is_clamped_and_reported() {
        // History starts after addr(1) was funded, so its first outgoing
        // transfer would underflow.
        let events = vec![
            transfer(addr(1), addr(2), 50, 10),
            transfer(Address::ZERO, addr(1), 20, 11),
        ];

        let ledger = fold_balances(&events);
        assert_eq!(ledger.underflows, 1);
        let holders = ledger.holders();
        assert_eq!(holders[&addr(1)], U256::from(20));
        assert_eq!(holders[&addr(2)], U256::from(50));
    }

    #[test]
    fn holder_sum_matches_mints_minus_burns() {
        let events = vec![
            transfer(Address::ZERO, addr(1), 1_000, 1),
            transfer(Address::ZERO, addr(2), 500, 2),
            transfer(addr(1), addr(3), 400, 3),
            transfer(addr(2), Address::ZERO, 100, 4),
            transfer(addr(3), addr(2), 150, 5),
        ];

        let ledger = fold_balances(&events);
        let total: U256 = ledger
            .holders()
            .values()
            .fold(U256::ZERO, |acc, v| acc + v);
        // 1500 minted - 100 burned
        assert_eq!(total, U256::from(1_400));
    }

    #[test]
    fn fold_is_idempotent() {
        let events = vec![
            transfer(Address::ZERO, addr(1), 100, 1),
            transfer(addr(1), addr(2), 40, 2),
        ];

        assert_eq!(fold_balances(&events), fold_balances(&events));
    }

    /// 100 events in 4-event periods: each period mints to its spender
    /// before the spender's transfers, so any split or chunk reordering at
    /// period boundaries stays underflow-free and the fold is a pure net sum.
    fn funded_periods() -> Vec<TransferEvent> {
        let mut events = Vec::new();
        for k in 0u64..25 {
            let spender = addr((k % 5) as u8 + 1);
            let block = k * 4;
            events.push(transfer(Address::ZERO, spender, 100, block));
            events.push(transfer(spender, addr(((k + 1) % 5) as u8 + 1), 30, block + 1));
            events.push(transfer(spender, addr(((k + 2) % 5) as u8 + 1), 20, block + 2));
            events.push(transfer(spender, addr(((k + 3) % 5) as u8 + 1), 10, block + 3));
        }
        events
    }

    #[test]
    fn chunked_folds_merge_to_the_whole() {
        let events = funded_periods();
        let whole = fold_balances(&events);
        assert_eq!(whole.underflows, 0);

        // chunk sizes are period multiples, so every chunk is self-contained
        for chunk_size in [4usize, 12, 20, 100] {
            let mut merged: HashMap<Address, U256> = HashMap::new();
            for chunk in events.chunks(chunk_size) {
                let ledger = fold_balances(chunk);
                assert_eq!(ledger.underflows, 0);
                for (address, balance) in ledger.balances {
                    let entry = merged.entry(address).or_insert(U256::ZERO);
                    *entry = entry.saturating_add(balance);
                }
            }
            assert_eq!(merged, whole.balances);
        }
    }

    #[test]
    fn chunk_order_does_not_change_the_fold() {
        let events = funded_periods();
        let whole = fold_balances(&events);

        let reordered: Vec<TransferEvent> = events
            .chunks(20)
            .rev()
            .flat_map(|chunk| chunk.to_vec())
            .collect();
        assert_ne!(reordered, events);

        let ledger = fold_balances(&reordered);
        assert_eq!(ledger.underflows, 0);
        assert_eq!(ledger.balances, whole.balances);
    }
}
