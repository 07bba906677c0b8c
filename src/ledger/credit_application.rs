//! Credit application engine
//!
//! Allocates an outstanding usage cost across available credit balances in the
//! order given (soonest-expiring first), one greedy pass, and records each
//! allocation as a usage credit application plus its debit/credit entry pair.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerResult;
use crate::ledger::balance::UsageCreditBalance;
use crate::ledger::transaction::EntryContext;
use crate::traits::*;
use crate::types::*;

/// Part of a debt covered by one credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAllocation {
    pub usage_credit_id: String,
    pub amount: i64,
}

/// Greedily allocate `outstanding` across `credits` in the order given
///
/// Credits with no positive balance are skipped. The result never allocates more
/// than a credit's balance, and never more than `outstanding` in total.
pub fn allocate_credits(outstanding: i64, credits: &[UsageCreditBalance]) -> Vec<CreditAllocation> {
    let mut remaining = outstanding.max(0);
    let mut allocations = Vec::new();

    for credit in credits {
        if remaining == 0 {
            break;
        }
        if credit.balance <= 0 {
            continue;
        }

        let take = credit.balance.min(remaining);
        if take > 0 {
            allocations.push(CreditAllocation {
                usage_credit_id: credit.usage_credit_id.clone(),
                amount: take,
            });
            remaining -= take;
        }
    }

    allocations
}

/// Credit balances drawn down across several debts within one command
#[derive(Debug, Clone, Default)]
pub struct CreditPool {
    credits: Vec<UsageCreditBalance>,
}

impl CreditPool {
    pub fn new(credits: Vec<UsageCreditBalance>) -> Self {
        Self { credits }
    }

    /// Allocate against the pool and deduct what was taken
    pub fn draw(&mut self, outstanding: i64) -> Vec<CreditAllocation> {
        let allocations = allocate_credits(outstanding, &self.credits);
        for allocation in &allocations {
            if let Some(credit) = self
                .credits
                .iter_mut()
                .find(|c| c.usage_credit_id == allocation.usage_credit_id)
            {
                credit.balance -= allocation.amount;
            }
        }
        allocations
    }

    /// Total positive balance left in the pool
    pub fn available(&self) -> i64 {
        self.credits.iter().map(|c| c.balance.max(0)).sum()
    }

    pub fn credits(&self) -> &[UsageCreditBalance] {
        &self.credits
    }
}

/// The debt a set of allocations is applied towards
#[derive(Debug, Clone)]
pub struct UsageCostTarget<'a> {
    pub ledger_account_id: &'a str,
    pub usage_event_id: &'a str,
    pub usage_meter_id: Option<&'a str>,
}

/// Applications created for one usage cost, with their entries
#[derive(Debug, Clone, Default)]
pub struct CreditApplicationOutcome {
    pub applications: Vec<UsageCreditApplication>,
    pub entries: Vec<LedgerEntry>,
}

impl CreditApplicationOutcome {
    pub fn amount_applied(&self) -> i64 {
        self.applications.iter().map(|a| a.amount_applied).sum()
    }

    pub fn extend(&mut self, other: CreditApplicationOutcome) {
        self.applications.extend(other.applications);
        self.entries.extend(other.entries);
    }
}

/// Save one application per allocation and build its entry pair
///
/// Applications are saved immediately; the returned entries are left for the
/// caller to write with the rest of its batch.
pub async fn record_credit_applications<S: LedgerStorage>(
    storage: &mut S,
    context: &EntryContext,
    target: &UsageCostTarget<'_>,
    allocations: &[CreditAllocation],
) -> LedgerResult<CreditApplicationOutcome> {
    if allocations.is_empty() {
        return Ok(CreditApplicationOutcome::default());
    }

    let applications: Vec<UsageCreditApplication> = allocations
        .iter()
        .map(|allocation| {
            context.usage_credit_application(
                &allocation.usage_credit_id,
                target.usage_event_id,
                target.usage_meter_id.map(str::to_string),
                allocation.amount,
            )
        })
        .collect();
    storage.insert_usage_credit_applications(&applications).await?;

    let mut entries = Vec::with_capacity(applications.len() * 2);
    for application in &applications {
        debug!(
            usage_credit_id = %application.usage_credit_id,
            usage_event_id = %application.usage_event_id,
            amount = application.amount_applied,
            "Applied usage credit"
        );
        entries.extend(context.credit_application_pair(target.ledger_account_id, application)?);
    }

    Ok(CreditApplicationOutcome {
        applications,
        entries,
    })
}

/// Apply available credits against one usage cost
///
/// A zero cost or an empty/depleted credit list yields an empty outcome.
pub async fn apply_credits<S: LedgerStorage>(
    storage: &mut S,
    context: &EntryContext,
    target: &UsageCostTarget<'_>,
    outstanding: i64,
    credits: &[UsageCreditBalance],
) -> LedgerResult<CreditApplicationOutcome> {
    let allocations = allocate_credits(outstanding, credits);
    record_credit_applications(storage, context, target, &allocations).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn balance(id: &str, amount: i64) -> UsageCreditBalance {
        UsageCreditBalance {
            usage_credit_id: id.to_string(),
            ledger_account_id: "la_1".to_string(),
            usage_meter_id: Some("um_1".to_string()),
            balance: amount,
            issued_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            expires_at: None,
        }
    }

    #[test]
    fn test_greedy_allocation_across_two_credits() {
        let credits = vec![balance("uc_a", 80), balance("uc_b", 50)];
        let mut pool = CreditPool::new(credits);

        let allocations = pool.draw(100);
        assert_eq!(
            allocations,
            vec![
                CreditAllocation {
                    usage_credit_id: "uc_a".to_string(),
                    amount: 80
                },
                CreditAllocation {
                    usage_credit_id: "uc_b".to_string(),
                    amount: 20
                },
            ]
        );
        assert_eq!(pool.credits()[0].balance, 0);
        assert_eq!(pool.credits()[1].balance, 30);
        assert_eq!(pool.available(), 30);
    }

    #[test]
    fn test_nothing_to_allocate() {
        assert!(allocate_credits(0, &[balance("uc_a", 80)]).is_empty());
        assert!(allocate_credits(100, &[]).is_empty());
        assert!(allocate_credits(100, &[balance("uc_a", 0), balance("uc_b", -5)]).is_empty());
    }

    #[test]
    fn test_stops_once_debt_is_covered() {
        let allocations = allocate_credits(30, &[balance("uc_a", 80), balance("uc_b", 50)]);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].amount, 30);
    }

    #[test]
    fn test_skips_depleted_credits_in_order() {
        let allocations = allocate_credits(
            60,
            &[balance("uc_a", 0), balance("uc_b", 25), balance("uc_c", 100)],
        );
        let amounts: Vec<(&str, i64)> = allocations
            .iter()
            .map(|a| (a.usage_credit_id.as_str(), a.amount))
            .collect();
        assert_eq!(amounts, vec![("uc_b", 25), ("uc_c", 35)]);
    }
}
