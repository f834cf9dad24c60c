//! Quota accounts and balance arithmetic.
//!
//! Every account accrues quota at a per-level charge rate, banks at most
//! `max_charge_seconds` worth of it, and is debited one quota-second per
//! second for every task it funds at a level. Balances always stay within
//! `[0, cap]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;
use crate::util::serde::{AccountId, Priority};

/// Admin-supplied account configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Quota accrued per second at each priority level. Missing trailing
    /// levels accrue nothing.
    pub charge_rates: Vec<f64>,
    /// Seconds of accrual an account may bank; the cap at level `p` is
    /// `max_charge_seconds * charge_rates[p]`.
    pub max_charge_seconds: f64,
    /// Maximum concurrently running tasks this account funds. `0` means no
    /// limit.
    pub max_fanout: u32,
    /// When set, requests of this account never run on free capacity.
    pub disable_free_tasks: bool,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            charge_rates: Vec::new(),
            max_charge_seconds: 0.0,
            max_fanout: 0,
            disable_free_tasks: false,
        }
    }
}

impl AccountConfig {
    /// Charge rate at `level`.
    pub fn rate(&self, level: Priority) -> f64 {
        self.charge_rates.get(level).copied().unwrap_or(0.0)
    }

    /// Balance cap at `level`.
    pub fn cap(&self, level: Priority) -> f64 {
        self.rate(level) * self.max_charge_seconds
    }

    /// Whether `running` funded tasks leave room for one more.
    pub const fn has_fanout_room(&self, running: u32) -> bool {
        self.max_fanout == 0 || running < self.max_fanout
    }

    /// Validate against the pool's number of priority levels.
    pub fn validate(&self, levels: usize) -> Result<(), SchedulerError> {
        if self.charge_rates.len() > levels {
            return Err(SchedulerError::InvalidRequest(format!(
                "{} charge rates given for a pool with {levels} priority levels",
                self.charge_rates.len()
            )));
        }
        if self
            .charge_rates
            .iter()
            .any(|r| !r.is_finite() || *r < 0.0)
        {
            return Err(SchedulerError::InvalidRequest(
                "charge rates must be finite and non-negative".into(),
            ));
        }
        if !self.max_charge_seconds.is_finite() || self.max_charge_seconds < 0.0 {
            return Err(SchedulerError::InvalidRequest(
                "max_charge_seconds must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// An account and its current balance vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    pub id: AccountId,
    /// Current configuration.
    pub config: AccountConfig,
    /// One balance per priority level.
    pub balance: Vec<f64>,
}

impl Account {
    fn new(id: AccountId, config: AccountConfig, levels: usize) -> Self {
        Self {
            id,
            config,
            balance: vec![0.0; levels],
        }
    }

    /// Balance at `level`, zero when out of range.
    pub fn balance_at(&self, level: Priority) -> f64 {
        self.balance.get(level).copied().unwrap_or(0.0)
    }

    /// First level at or below `priority` (numerically `>=`) with a positive
    /// balance. This is the charge-rate cascade: an account out of quota at
    /// its requested level still funds the task at a cheaper level.
    ///
    /// Balances are clamped at zero, so a balance of exactly zero is an
    /// exhausted level and does not fund.
    pub fn fundable_level(&self, priority: Priority) -> Option<Priority> {
        (priority..self.balance.len()).find(|&level| self.balance[level] > 0.0)
    }

    fn clamp(&mut self) {
        for (level, value) in self.balance.iter_mut().enumerate() {
            let cap = self.config.cap(level);
            *value = value.min(cap).max(0.0);
        }
    }
}

/// All accounts of one pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    accounts: BTreeMap<AccountId, Account>,
}

impl Ledger {
    /// Look up an account.
    pub fn get(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    /// Iterate accounts in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the ledger holds no accounts.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Create an account with a zero balance, or reconfigure an existing one
    /// keeping its balance (clamped to the new caps).
    pub fn upsert(&mut self, id: &str, config: AccountConfig, levels: usize) {
        match self.accounts.get_mut(id) {
            Some(account) => {
                account.config = config;
                account.balance.resize(levels, 0.0);
                account.clamp();
            }
            None => {
                self.accounts
                    .insert(id.to_string(), Account::new(id.to_string(), config, levels));
            }
        }
    }

    /// Delete an account. Returns whether it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        self.accounts.remove(id).is_some()
    }

    /// Zero every balance, keeping configuration.
    pub fn reset_balances(&mut self) {
        for account in self.accounts.values_mut() {
            account.balance.iter_mut().for_each(|b| *b = 0.0);
        }
    }

    /// Change the number of priority levels tracked per account.
    pub fn resize_levels(&mut self, levels: usize) {
        for account in self.accounts.values_mut() {
            account.balance.resize(levels, 0.0);
        }
    }

    /// Subtract `seconds` of quota at `level`, never going below zero.
    pub fn debit(&mut self, id: &str, level: Priority, seconds: f64) {
        if let Some(value) = self
            .accounts
            .get_mut(id)
            .and_then(|a| a.balance.get_mut(level))
        {
            *value = (*value - seconds).max(0.0);
        }
    }

    /// Move every account forward by `elapsed_secs`.
    ///
    /// `running` maps an account to the number of tasks it funds at each level;
    /// those are debited first, then the charge rate is accrued up to the cap.
    pub fn advance(&mut self, elapsed_secs: f64, running: &BTreeMap<AccountId, Vec<u32>>) {
        if elapsed_secs <= 0.0 {
            return;
        }
        for account in self.accounts.values_mut() {
            let counts = running.get(&account.id);
            for level in 0..account.balance.len() {
                let tasks = counts.and_then(|c| c.get(level)).copied().unwrap_or(0);
                let cap = account.config.cap(level);
                let mut value = account.balance[level] - elapsed_secs * f64::from(tasks);
                if value < cap {
                    value = (value + elapsed_secs * account.config.rate(level)).min(cap);
                }
                account.balance[level] = value.min(cap).max(0.0);
            }
        }
    }

    /// Funding level available to `id` for a task at `priority`, given how many
    /// tasks it already funds. `None` when the account is unknown, out of
    /// fanout, or has no positive balance at or below `priority`.
    pub fn can_fund(&self, id: &str, priority: Priority, running: u32) -> Option<Priority> {
        let account = self.accounts.get(id)?;
        if !account.config.has_fanout_room(running) {
            return None;
        }
        account.fundable_level(priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(rates: &[f64], max_secs: f64, fanout: u32) -> AccountConfig {
        AccountConfig {
            charge_rates: rates.to_vec(),
            max_charge_seconds: max_secs,
            max_fanout: fanout,
            disable_free_tasks: false,
        }
    }

    #[test]
    fn test_accrual_within_cap() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[2.0, 0.0], 10.0, 1), 2);
        ledger.advance(5.0, &BTreeMap::new());
        let a = ledger.get("a").unwrap();
        assert_eq!(a.balance_at(0), 10.0);
        assert_eq!(a.balance_at(1), 0.0);
    }

    #[test]
    fn test_accrual_clamps_at_cap() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[2.0], 10.0, 0), 1);
        ledger.advance(11.0, &BTreeMap::new());
        assert_eq!(ledger.get("a").unwrap().balance_at(0), 20.0);
        ledger.advance(100.0, &BTreeMap::new());
        assert_eq!(ledger.get("a").unwrap().balance_at(0), 20.0);
    }

    #[test]
    fn test_running_tasks_debit_before_accrual() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[1.0], 100.0, 0), 1);
        ledger.advance(10.0, &BTreeMap::new());
        let running = BTreeMap::from([("a".to_string(), vec![3])]);
        // 10 - 30 + 10, floored at zero
        ledger.advance(10.0, &running);
        assert_eq!(ledger.get("a").unwrap().balance_at(0), 0.0);
    }

    #[test]
    fn test_balance_never_negative_or_over_cap() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[3.0, 1.0], 4.0, 0), 2);
        let running = BTreeMap::from([("a".to_string(), vec![1, 5])]);
        for step in 0..50 {
            ledger.advance(f64::from(step % 7) * 0.5, &running);
            let a = ledger.get("a").unwrap();
            for level in 0..2 {
                assert!(a.balance_at(level) >= 0.0);
                assert!(a.balance_at(level) <= a.config.cap(level));
            }
        }
    }

    #[test]
    fn test_cascade_to_cheaper_level() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[0.0, 1.0, 1.0], 10.0, 0), 3);
        ledger.advance(1.0, &BTreeMap::new());
        assert_eq!(ledger.can_fund("a", 0, 0), Some(1));
        assert_eq!(ledger.can_fund("a", 2, 0), Some(2));
        ledger.debit("a", 1, 100.0);
        assert_eq!(ledger.can_fund("a", 0, 0), Some(2));
    }

    #[test]
    fn test_exhausted_balance_does_not_fund() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[1.0, 1.0], 10.0, 0), 2);
        assert_eq!(ledger.can_fund("a", 0, 0), None);
        ledger.advance(2.0, &BTreeMap::new());
        ledger.debit("a", 0, 2.0);
        ledger.debit("a", 1, 5.0);
        assert_eq!(ledger.get("a").unwrap().balance_at(0), 0.0);
        assert_eq!(ledger.get("a").unwrap().fundable_level(0), None);
        assert_eq!(ledger.can_fund("a", 0, 0), None);
    }

    #[test]
    fn test_fanout_blocks_funding() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[1.0], 10.0, 1), 1);
        ledger.advance(1.0, &BTreeMap::new());
        assert_eq!(ledger.can_fund("a", 0, 0), Some(0));
        assert_eq!(ledger.can_fund("a", 0, 1), None);
        assert_eq!(ledger.can_fund("missing", 0, 0), None);
    }

    #[test]
    fn test_reconfigure_clamps_existing_balance() {
        let mut ledger = Ledger::default();
        ledger.upsert("a", account(&[2.0], 10.0, 0), 1);
        ledger.advance(10.0, &BTreeMap::new());
        ledger.upsert("a", account(&[1.0], 5.0, 0), 1);
        assert_eq!(ledger.get("a").unwrap().balance_at(0), 5.0);
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        assert!(account(&[1.0, 2.0], 1.0, 0).validate(1).is_err());
        assert!(account(&[-1.0], 1.0, 0).validate(1).is_err());
        assert!(account(&[f64::NAN], 1.0, 0).validate(1).is_err());
        assert!(account(&[1.0], -1.0, 0).validate(1).is_err());
        assert!(account(&[1.0], 1.0, 0).validate(3).is_ok());
    }
}
