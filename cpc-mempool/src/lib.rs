//! Shared transaction pool: admission with signature and nonce rules,
//! gas-price priority with FIFO tie-break, per-sender nonce queues with
//! gap parking, replace-by-fee, capacity eviction and TTL expiry.
//!
//! Admission and drain are serialized behind one internal mutex; the pool
//! is shared by the RPC submitter, the P2P relay and the proposer.

use cpc_core::{AccountAddress, Amount, ChainEvent, EventBus, Hash32, Transaction, TxError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub max_size: usize,
    pub tx_ttl_seconds: u64,
    /// Minimum relative gas-price bump, in bps, for a same-nonce
    /// replacement to be accepted.
    pub price_bump_bps: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5_000,
            tx_ttl_seconds: 3_600,
            price_bump_bps: 1_000,
        }
    }
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    /// The previous same-nonce transaction was displaced by a higher bid.
    Replaced { old: Hash32 },
    Rejected(TxError),
}

#[derive(Debug, Clone)]
struct Entry {
    tx: Transaction,
    id: Hash32,
    inserted_at: u64,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    /// Per-sender queues keyed by nonce; the first gap blocks the rest.
    by_sender: BTreeMap<AccountAddress, BTreeMap<u64, Entry>>,
    ids: HashSet<Hash32>,
    seq: u64,
    len: usize,
}

pub struct Mempool {
    inner: Mutex<Inner>,
    events: EventBus,
    config: MempoolConfig,
}

impl Mempool {
    pub fn new(config: MempoolConfig, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a transaction. `state_nonce` is the sender's next expected
    /// nonce in committed state; `now` is unix seconds.
    pub fn insert(&self, tx: Transaction, state_nonce: u64, now: u64) -> InsertOutcome {
        if let Err(e) = tx.validate_shape() {
            return InsertOutcome::Rejected(e);
        }
        if let Err(e) = verify_envelope(&tx) {
            return InsertOutcome::Rejected(e);
        }
        if tx.nonce < state_nonce {
            return InsertOutcome::Rejected(TxError::InvalidNonce {
                expected: state_nonce,
                got: tx.nonce,
            });
        }

        let id = tx.id();
        let mut inner = self.inner.lock();
        if inner.ids.contains(&id) {
            return InsertOutcome::Rejected(TxError::DuplicateNonce);
        }

        // Same (sender, nonce) slot: replacement needs a real bump.
        let replaced = match inner
            .by_sender
            .get(&tx.sender)
            .and_then(|q| q.get(&tx.nonce))
        {
            Some(existing) => {
                let floor = existing.tx.gas_price
                    + cpc_core::mul_bps(existing.tx.gas_price, self.config.price_bump_bps);
                if tx.gas_price < floor.max(existing.tx.gas_price + Amount::from(1u64)) {
                    return InsertOutcome::Rejected(TxError::DuplicateNonce);
                }
                Some(existing.id)
            }
            None => None,
        };

        if let Some(old) = replaced {
            self.remove_entry(&mut inner, &tx.sender, tx.nonce);
            self.events.publish(ChainEvent::TxFailed {
                tx_id: old,
                reason: TxError::Evicted,
            });
            self.push(&mut inner, tx, now);
            return InsertOutcome::Replaced { old };
        }

        // Capacity: a full pool admits only bids above the current floor.
        if inner.len >= self.config.max_size {
            match self.lowest_priority(&inner) {
                Some((sender, nonce, price)) if tx.gas_price > price => {
                    let victim = self.remove_entry(&mut inner, &sender, nonce);
                    if let Some(victim) = victim {
                        self.events.publish(ChainEvent::TxFailed {
                            tx_id: victim.id,
                            reason: TxError::Evicted,
                        });
                    }
                }
                _ => return InsertOutcome::Rejected(TxError::MempoolFull),
            }
        }

        self.push(&mut inner, tx, now);
        InsertOutcome::Accepted
    }

    fn push(&self, inner: &mut Inner, tx: Transaction, now: u64) {
        let id = tx.id();
        inner.seq += 1;
        let entry = Entry {
            id,
            inserted_at: now,
            seq: inner.seq,
            tx,
        };
        inner.ids.insert(id);
        inner
            .by_sender
            .entry(entry.tx.sender.clone())
            .or_default()
            .insert(entry.tx.nonce, entry);
        inner.len += 1;
        self.events.publish(ChainEvent::TxAccepted { tx_id: id });
    }

    fn remove_entry(&self, inner: &mut Inner, sender: &AccountAddress, nonce: u64) -> Option<Entry> {
        let queue = inner.by_sender.get_mut(sender)?;
        let entry = queue.remove(&nonce)?;
        if queue.is_empty() {
            inner.by_sender.remove(sender);
        }
        inner.ids.remove(&entry.id);
        inner.len -= 1;
        Some(entry)
    }

    /// The entry a full pool would evict first: lowest gas price, newest
    /// insertion on ties.
    fn lowest_priority(&self, inner: &Inner) -> Option<(AccountAddress, u64, Amount)> {
        inner
            .by_sender
            .iter()
            .flat_map(|(sender, q)| q.values().map(move |e| (sender, e)))
            .min_by(|(_, a), (_, b)| a.tx.gas_price.cmp(&b.tx.gas_price).then(b.seq.cmp(&a.seq)))
            .map(|(sender, e)| (sender.clone(), e.tx.nonce, e.tx.gas_price))
    }

    /// Select transactions for the next block: ready transactions in
    /// decreasing gas price, FIFO on ties; consuming a sender's ready
    /// transaction may unblock its next nonce within the same block.
    pub fn drain_for_block<F>(
        &self,
        state_nonce: F,
        block_gas_limit: u64,
        max_txs: usize,
    ) -> Vec<Transaction>
    where
        F: Fn(&AccountAddress) -> u64,
    {
        let inner = self.inner.lock();
        let mut next_nonce: BTreeMap<AccountAddress, u64> = inner
            .by_sender
            .keys()
            .map(|sender| (sender.clone(), state_nonce(sender)))
            .collect();
        let mut selected = Vec::new();
        let mut gas_used = 0u64;

        while selected.len() < max_txs {
            let best = inner
                .by_sender
                .iter()
                .filter_map(|(sender, queue)| {
                    let wanted = *next_nonce.get(sender)?;
                    queue.get(&wanted)
                })
                .filter(|e| gas_used + e.tx.kind.base_gas() <= block_gas_limit)
                .min_by(|a, b| b.tx.gas_price.cmp(&a.tx.gas_price).then(a.seq.cmp(&b.seq)));
            let Some(entry) = best else {
                break;
            };
            gas_used += entry.tx.kind.base_gas();
            *next_nonce.entry(entry.tx.sender.clone()).or_default() = entry.tx.nonce + 1;
            selected.push(entry.tx.clone());
        }
        selected
    }

    /// Drop transactions included in an applied block, plus anything whose
    /// nonce the block made permanently stale.
    pub fn on_block_applied<F>(&self, applied: &[Hash32], state_nonce: F)
    where
        F: Fn(&AccountAddress) -> u64,
    {
        let applied: HashSet<&Hash32> = applied.iter().collect();
        let mut inner = self.inner.lock();
        let mut stale: Vec<(AccountAddress, u64, Hash32, u64)> = Vec::new();
        for (sender, queue) in inner.by_sender.iter() {
            let expected = state_nonce(sender);
            for entry in queue.values() {
                if applied.contains(&entry.id) {
                    stale.push((sender.clone(), entry.tx.nonce, entry.id, expected));
                } else if entry.tx.nonce < expected {
                    stale.push((sender.clone(), entry.tx.nonce, entry.id, expected));
                }
            }
        }
        for (sender, nonce, id, expected) in stale {
            self.remove_entry(&mut inner, &sender, nonce);
            if !applied.contains(&id) {
                self.events.publish(ChainEvent::TxFailed {
                    tx_id: id,
                    reason: TxError::InvalidNonce {
                        expected,
                        got: nonce,
                    },
                });
            }
        }
    }

    /// TTL sweep. Entries at or past `insertion + ttl` expire.
    pub fn tick(&self, now: u64) {
        let ttl = self.config.tx_ttl_seconds;
        let mut inner = self.inner.lock();
        let expired: Vec<(AccountAddress, u64, Hash32)> = inner
            .by_sender
            .iter()
            .flat_map(|(sender, q)| {
                q.values()
                    .filter(|e| now >= e.inserted_at + ttl)
                    .map(move |e| (sender.clone(), e.tx.nonce, e.id))
            })
            .collect();
        for (sender, nonce, id) in expired {
            self.remove_entry(&mut inner, &sender, nonce);
            debug!(tx_id = %id, "mempool entry expired");
            self.events.publish(ChainEvent::TxFailed {
                tx_id: id,
                reason: TxError::Expired,
            });
        }
    }
}

fn verify_envelope(tx: &Transaction) -> Result<(), TxError> {
    let signing = tx
        .signing_bytes()
        .map_err(|e| TxError::Malformed(e.to_string()))?;
    let valid = cpc_crypto::verify(&tx.pubkey, &signing, &tx.signature)
        .map_err(|_| TxError::InvalidSignature)?;
    if !valid {
        return Err(TxError::InvalidSignature);
    }
    let derived = cpc_crypto::account_address(&tx.pubkey).map_err(|_| TxError::UnknownKey)?;
    if derived != tx.sender {
        return Err(TxError::InvalidSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpc_core::{cpc, TxKind};
    use cpc_crypto::KeyMaterial;

    struct Sender {
        key: KeyMaterial,
        addr: AccountAddress,
    }

    fn sender() -> Sender {
        let key = cpc_crypto::generate_keypair();
        let addr = cpc_crypto::account_address(&key.public_key).unwrap();
        Sender { key, addr }
    }

    fn tx(from: &Sender, nonce: u64, gas_price: u64) -> Transaction {
        let mut tx = Transaction {
            kind: TxKind::Transfer,
            sender: from.addr.clone(),
            recipient: Some(AccountAddress("cpcrecipient".into())),
            amount: cpc(1),
            nonce,
            gas_limit: TxKind::Transfer.base_gas(),
            gas_price: Amount::from(gas_price),
            payload: vec![],
            pubkey: from.key.public_key.clone(),
            signature: vec![],
        };
        let signing = tx.signing_bytes().unwrap();
        tx.signature = cpc_crypto::sign(&from.key.secret_key, &signing).unwrap();
        tx
    }

    fn pool(max_size: usize) -> Mempool {
        Mempool::new(
            MempoolConfig {
                max_size,
                tx_ttl_seconds: 3_600,
                price_bump_bps: 1_000,
            },
            EventBus::new(64),
        )
    }

    #[test]
    fn rejects_bad_signatures() {
        let pool = pool(10);
        let alice = sender();
        let mut bad = tx(&alice, 0, 1_000);
        bad.amount = cpc(2);
        assert_eq!(
            pool.insert(bad, 0, 0),
            InsertOutcome::Rejected(TxError::InvalidSignature)
        );
    }

    /// S5: a nonce gap parks the transaction; filling the gap drains all
    /// three in nonce order within one block.
    #[test]
    fn nonce_gap_parks_and_unblocks_in_one_block() {
        let pool = pool(10);
        let alice = sender();
        // State nonce is 3; nonce 5 arrives first.
        assert_eq!(pool.insert(tx(&alice, 5, 1_000), 3, 0), InsertOutcome::Accepted);
        // Nothing is ready yet.
        assert!(pool.drain_for_block(|_| 3, 30_000_000, 100).is_empty());

        assert_eq!(pool.insert(tx(&alice, 3, 1_000), 3, 0), InsertOutcome::Accepted);
        assert_eq!(pool.insert(tx(&alice, 4, 1_000), 3, 0), InsertOutcome::Accepted);

        let drained = pool.drain_for_block(|_| 3, 30_000_000, 100);
        let nonces: Vec<u64> = drained.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![3, 4, 5]);
    }

    #[test]
    fn drain_orders_by_gas_price_then_fifo() {
        let pool = pool(10);
        let a = sender();
        let b = sender();
        let c = sender();
        let tx_a = tx(&a, 0, 500);
        let tx_b = tx(&b, 0, 2_000);
        let tx_c = tx(&c, 0, 500);
        pool.insert(tx_a.clone(), 0, 0);
        pool.insert(tx_b.clone(), 0, 0);
        pool.insert(tx_c.clone(), 0, 0);

        let drained = pool.drain_for_block(|_| 0, 30_000_000, 100);
        assert_eq!(drained[0].id(), tx_b.id());
        // Equal prices resolve by insertion order.
        assert_eq!(drained[1].id(), tx_a.id());
        assert_eq!(drained[2].id(), tx_c.id());
    }

    #[test]
    fn replacement_needs_a_price_bump() {
        let pool = pool(10);
        let alice = sender();
        let original = tx(&alice, 0, 1_000);
        let original_id = original.id();
        pool.insert(original, 0, 0);

        // Not enough of a bump (needs +10%).
        assert_eq!(
            pool.insert(tx(&alice, 0, 1_050), 0, 0),
            InsertOutcome::Rejected(TxError::DuplicateNonce)
        );
        assert_eq!(
            pool.insert(tx(&alice, 0, 1_100), 0, 0),
            InsertOutcome::Replaced { old: original_id }
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn full_pool_evicts_only_below_the_new_bid() {
        let pool = pool(2);
        let a = sender();
        let b = sender();
        let c = sender();
        pool.insert(tx(&a, 0, 1_000), 0, 0);
        pool.insert(tx(&b, 0, 2_000), 0, 0);

        // Equal to the floor: rejected.
        assert_eq!(
            pool.insert(tx(&c, 0, 1_000), 0, 0),
            InsertOutcome::Rejected(TxError::MempoolFull)
        );
        // Above the floor: the cheapest entry is evicted.
        assert_eq!(pool.insert(tx(&c, 0, 1_500), 0, 0), InsertOutcome::Accepted);
        assert_eq!(pool.len(), 2);
        let drained = pool.drain_for_block(|_| 0, 30_000_000, 100);
        assert!(drained.iter().all(|t| t.sender != a.addr));
    }

    #[test]
    fn ttl_expiry_is_inclusive_and_emits_failure() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let pool = Mempool::new(
            MempoolConfig {
                max_size: 10,
                tx_ttl_seconds: 100,
                price_bump_bps: 1_000,
            },
            bus,
        );
        let alice = sender();
        let t = tx(&alice, 0, 1_000);
        let id = t.id();
        pool.insert(t, 0, 50);

        // One second early: still alive.
        pool.tick(149);
        assert_eq!(pool.len(), 1);
        // Exactly insertion + ttl: expired.
        pool.tick(150);
        assert_eq!(pool.len(), 0);

        // First event is the acceptance, then the expiry.
        assert_eq!(rx.try_recv().unwrap(), ChainEvent::TxAccepted { tx_id: id });
        assert_eq!(
            rx.try_recv().unwrap(),
            ChainEvent::TxFailed {
                tx_id: id,
                reason: TxError::Expired,
            }
        );
    }

    #[test]
    fn applied_and_stale_entries_are_dropped() {
        let pool = pool(10);
        let alice = sender();
        let t0 = tx(&alice, 0, 1_000);
        let t1 = tx(&alice, 1, 1_000);
        pool.insert(t0.clone(), 0, 0);
        pool.insert(t1.clone(), 0, 0);

        // Block applied both; state nonce advanced to 2.
        pool.on_block_applied(&[t0.id(), t1.id()], |_| 2);
        assert!(pool.is_empty());

        // A parked transaction under the new nonce is purged as stale.
        let stale = tx(&alice, 1, 2_000);
        pool.insert(stale, 1, 0);
        pool.on_block_applied(&[], |_| 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn drain_respects_gas_and_count_limits() {
        let pool = pool(10);
        let senders: Vec<Sender> = (0..4).map(|_| sender()).collect();
        for s in &senders {
            pool.insert(tx(s, 0, 1_000), 0, 0);
        }
        // Budget for exactly two transfers.
        let drained = pool.drain_for_block(|_| 0, 2 * TxKind::Transfer.base_gas(), 100);
        assert_eq!(drained.len(), 2);
        // Count cap wins when tighter than gas.
        let drained = pool.drain_for_block(|_| 0, 30_000_000, 3);
        assert_eq!(drained.len(), 3);
    }

    #[test]
    fn below_state_nonce_is_rejected_at_admission() {
        let pool = pool(10);
        let alice = sender();
        assert_eq!(
            pool.insert(tx(&alice, 1, 1_000), 3, 0),
            InsertOutcome::Rejected(TxError::InvalidNonce { expected: 3, got: 1 })
        );
    }
}
