//! Non-consensus economic tracking: per-block aggregates and a rolling
//! transactions-per-second window. The consensus-relevant totals
//! (`total_minted`, `total_burned`) live in the state machine and feed the
//! state root; these numbers only feed the status surface.

use std::collections::VecDeque;

pub struct EconomicMetrics {
    total_transactions: u64,
    total_gas_used: u64,
    window: VecDeque<(u64, u64)>,
    window_secs: u64,
}

impl EconomicMetrics {
    pub fn new(window_secs: u64) -> Self {
        Self {
            total_transactions: 0,
            total_gas_used: 0,
            window: VecDeque::new(),
            window_secs: window_secs.max(1),
        }
    }

    pub fn record_block(&mut self, timestamp: u64, tx_count: u64, gas_used: u64) {
        self.total_transactions += tx_count;
        self.total_gas_used += gas_used;
        self.window.push_back((timestamp, tx_count));
        let cutoff = timestamp.saturating_sub(self.window_secs);
        while matches!(self.window.front(), Some((t, _)) if *t < cutoff) {
            self.window.pop_front();
        }
    }

    pub fn total_transactions(&self) -> u64 {
        self.total_transactions
    }

    pub fn total_gas_used(&self) -> u64 {
        self.total_gas_used
    }

    pub fn rolling_tps(&self) -> f64 {
        let txs: u64 = self.window.iter().map(|(_, c)| c).sum();
        txs as f64 / self.window_secs as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_slides_and_totals_accumulate() {
        let mut m = EconomicMetrics::new(60);
        m.record_block(100, 30, 630_000);
        m.record_block(130, 30, 630_000);
        assert_eq!(m.total_transactions(), 60);
        assert_eq!(m.total_gas_used(), 1_260_000);
        assert!((m.rolling_tps() - 1.0).abs() < f64::EPSILON);

        // A block far in the future evicts the old samples.
        m.record_block(1_000, 60, 0);
        assert!((m.rolling_tps() - 1.0).abs() < f64::EPSILON);
        assert_eq!(m.total_transactions(), 120);
    }
}
