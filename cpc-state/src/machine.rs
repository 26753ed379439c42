//! Per-transaction validation and application. Every check runs before the
//! first mutation, so a failed transaction leaves the state untouched and
//! is simply skipped by the block-apply loop.

use crate::account::UnbondingEntry;
use crate::validator::{Delegation, Validator};
use crate::ChainState;
use cpc_core::{mul_bps, Amount, Transaction, TxError, TxKind};

impl ChainState {
    /// Validate and apply one transaction at `current_height`. Returns the
    /// gas used. On error nothing is charged and nothing changes.
    pub fn apply_transaction(&mut self, tx: &Transaction, current_height: u64) -> Result<u64, TxError> {
        tx.validate_shape()?;
        self.authenticate(tx)?;

        let expected = self.nonce_of(&tx.sender);
        if tx.nonce != expected {
            return Err(TxError::InvalidNonce {
                expected,
                got: tx.nonce,
            });
        }

        let gas_used = tx.kind.base_gas();
        let fee = Amount::from(gas_used) * tx.gas_price;
        let balance = self
            .accounts
            .get(&tx.sender)
            .map(|a| a.balance)
            .unwrap_or_default();
        // UNSTAKE and UNJAIL move value out of self-stake, not balance.
        let required = match tx.kind {
            TxKind::Unstake => fee,
            TxKind::Unjail => fee + self.params.unjail_fee,
            _ => tx.amount + fee,
        };
        if balance < required {
            return Err(TxError::InsufficientFunds);
        }

        match tx.kind {
            TxKind::Transfer => self.apply_transfer(tx)?,
            TxKind::Stake => self.apply_stake(tx, current_height)?,
            TxKind::Unstake => self.apply_unstake(tx, current_height)?,
            TxKind::UpdateValidator => self.apply_update_validator(tx)?,
            TxKind::Delegate => self.apply_delegate(tx, current_height)?,
            TxKind::Undelegate => self.apply_undelegate(tx, current_height)?,
            TxKind::Unjail => self.apply_unjail(tx)?,
            TxKind::SubmitResult => self.apply_submit_result(tx)?,
        }

        self.settle(tx, fee);
        Ok(gas_used)
    }

    fn authenticate(&self, tx: &Transaction) -> Result<(), TxError> {
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

    /// Nonce bump, pubkey caching and fee settlement, after the
    /// kind-specific effects succeeded.
    fn settle(&mut self, tx: &Transaction, fee: Amount) {
        let burn_share = mul_bps(fee, self.params.fee_burn_bps);
        let treasury_share = fee - burn_share;
        {
            let sender = self.account_mut(&tx.sender);
            sender.balance -= fee;
            sender.nonce += 1;
            if sender.pubkey.is_none() {
                sender.pubkey = Some(hex::encode(&tx.pubkey));
            }
        }
        self.burn(burn_share);
        if !treasury_share.is_zero() {
            self.account_mut(&cpc_core::AccountAddress::treasury()).balance += treasury_share;
        }
    }

    fn apply_transfer(&mut self, tx: &Transaction) -> Result<(), TxError> {
        let recipient = tx.recipient.clone().ok_or(TxError::InvalidAmount)?;
        cpc_crypto::validate_account_address(&recipient)
            .map_err(|e| TxError::Malformed(e.to_string()))?;
        self.account_mut(&tx.sender).balance -= tx.amount;
        self.account_mut(&recipient).balance += tx.amount;
        Ok(())
    }

    fn apply_stake(&mut self, tx: &Transaction, current_height: u64) -> Result<(), TxError> {
        if tx.amount.is_zero() {
            return Err(TxError::InvalidAmount);
        }
        match self.validator_addr_by_operator(&tx.sender) {
            Some(addr) => {
                let v = self.validators.get_mut(&addr).ok_or(TxError::UnknownValidator)?;
                if v.jail_count >= self.params.ejection_threshold_jails {
                    return Err(TxError::EjectionPermanent);
                }
                v.self_stake += tx.amount;
                v.power += tx.amount;
            }
            None => {
                let consensus_addr = cpc_crypto::consensus_address(&tx.pubkey)
                    .map_err(|_| TxError::UnknownKey)?;
                if self.validators.contains_key(&consensus_addr) {
                    return Err(TxError::ValidatorExists);
                }
                let validator = Validator::new(
                    consensus_addr.clone(),
                    tx.sender.clone(),
                    hex::encode(&tx.pubkey),
                    tx.amount,
                    current_height,
                );
                // Inactive until the next epoch boundary admits it.
                self.validators.insert(consensus_addr, validator);
            }
        }
        self.account_mut(&tx.sender).balance -= tx.amount;
        Ok(())
    }

    fn apply_unstake(&mut self, tx: &Transaction, current_height: u64) -> Result<(), TxError> {
        if tx.amount.is_zero() {
            return Err(TxError::InvalidAmount);
        }
        let addr = self
            .validator_addr_by_operator(&tx.sender)
            .ok_or(TxError::UnknownValidator)?;
        let penalty_bps = self.params.jail_unstake_penalty_bps;
        let (credited, penalty) = {
            let v = self.validators.get_mut(&addr).ok_or(TxError::UnknownValidator)?;
            if tx.amount > v.self_stake {
                return Err(TxError::InvalidAmount);
            }
            let penalty = if v.is_jailed(current_height) {
                mul_bps(tx.amount, penalty_bps)
            } else {
                Amount::zero()
            };
            v.self_stake -= tx.amount;
            v.power -= tx.amount;
            if v.power.is_zero() {
                v.is_active = false;
            }
            (tx.amount - penalty, penalty)
        };
        self.account_mut(&tx.sender).balance += credited;
        self.burn(penalty);
        Ok(())
    }

    fn apply_update_validator(&mut self, tx: &Transaction) -> Result<(), TxError> {
        if !tx.amount.is_zero() {
            return Err(TxError::InvalidAmount);
        }
        let update = tx.decode_validator_update()?;
        update.metadata.validate()?;
        if update.commission_rate_bps > self.params.max_commission_rate_bps {
            return Err(TxError::InvalidCommission);
        }
        let addr = self
            .validator_addr_by_operator(&tx.sender)
            .ok_or(TxError::UnknownValidator)?;
        let v = self.validators.get_mut(&addr).ok_or(TxError::UnknownValidator)?;
        v.metadata = update.metadata;
        v.commission_rate_bps = update.commission_rate_bps;
        Ok(())
    }

    fn apply_delegate(&mut self, tx: &Transaction, current_height: u64) -> Result<(), TxError> {
        if tx.amount < self.params.min_delegation {
            return Err(TxError::MinDelegationNotMet);
        }
        let target = tx.decode_delegation_target()?.validator;
        let already_delegating = self
            .accounts
            .get(&tx.sender)
            .map(|a| a.delegations_out.contains(&target))
            .unwrap_or(false);
        if !already_delegating {
            let participations = self
                .accounts
                .get(&tx.sender)
                .map(|a| a.delegations_out.len())
                .unwrap_or(0);
            if participations >= self.params.max_validators_per_delegator {
                return Err(TxError::MaxValidatorsPerDelegatorExceeded);
            }
        }
        {
            let v = self.validators.get(&target).ok_or(TxError::UnknownValidator)?;
            if v.jail_count >= self.params.ejection_threshold_jails {
                return Err(TxError::EjectionPermanent);
            }
        }
        // The concentration cap binds once the network has alternatives; a
        // single-validator network is exempt by construction.
        if self.validators.len() > 1 {
            let new_power = self.validators[&target].power + tx.amount;
            let new_total = self.total_staked_power() + tx.amount;
            if new_power > mul_bps(new_total, self.params.max_validator_power_share_bps) {
                return Err(TxError::MaxValidatorPowerShareExceeded);
            }
        }

        self.account_mut(&tx.sender).balance -= tx.amount;
        self.account_mut(&tx.sender).delegations_out.insert(target.clone());
        let v = self.validators.get_mut(&target).ok_or(TxError::UnknownValidator)?;
        match v.delegation_of_mut(&tx.sender) {
            Some(existing) => existing.amount += tx.amount,
            None => v.delegations_in.push(Delegation {
                delegator: tx.sender.clone(),
                amount: tx.amount,
                created_height: current_height,
            }),
        }
        v.total_delegated += tx.amount;
        v.power += tx.amount;
        Ok(())
    }

    fn apply_undelegate(&mut self, tx: &Transaction, current_height: u64) -> Result<(), TxError> {
        if tx.amount.is_zero() {
            return Err(TxError::InvalidAmount);
        }
        let target = tx.decode_delegation_target()?.validator;
        let completion_height = current_height + self.params.unbonding_blocks;
        let emptied = {
            let v = self.validators.get_mut(&target).ok_or(TxError::UnknownValidator)?;
            let existing = v
                .delegation_of_mut(&tx.sender)
                .ok_or(TxError::InvalidAmount)?;
            if existing.amount < tx.amount {
                return Err(TxError::InvalidAmount);
            }
            existing.amount -= tx.amount;
            let emptied = existing.amount.is_zero();
            if emptied {
                v.delegations_in.retain(|d| d.delegator != tx.sender);
            }
            v.total_delegated -= tx.amount;
            v.power -= tx.amount;
            emptied
        };
        if emptied {
            self.account_mut(&tx.sender).delegations_out.remove(&target);
        }
        self.account_mut(&tx.sender).push_unbonding(UnbondingEntry {
            validator: target,
            amount: tx.amount,
            completion_height,
        });
        Ok(())
    }

    fn apply_unjail(&mut self, tx: &Transaction) -> Result<(), TxError> {
        if !tx.amount.is_zero() {
            return Err(TxError::InvalidAmount);
        }
        let addr = self
            .validator_addr_by_operator(&tx.sender)
            .ok_or(TxError::UnknownValidator)?;
        let unjail_fee = self.params.unjail_fee;
        {
            let v = self.validators.get_mut(&addr).ok_or(TxError::UnknownValidator)?;
            if v.jail_count >= self.params.ejection_threshold_jails {
                return Err(TxError::EjectionPermanent);
            }
            v.jailed_until_height = 0;
            v.missed_blocks = 0;
            v.is_active = true;
        }
        self.account_mut(&tx.sender).balance -= unjail_fee;
        self.burn(unjail_fee);
        Ok(())
    }

    fn apply_submit_result(&mut self, tx: &Transaction) -> Result<(), TxError> {
        if !tx.amount.is_zero() {
            return Err(TxError::InvalidAmount);
        }
        let commitment = tx.decode_compute_commitment()?;
        self.compute_results.push(commitment);
        Ok(())
    }
}
