//! Balance aggregation over the entry log
//!
//! Every balance here is recomputed from ledger entries on each call; no stored
//! running balance is trusted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{LedgerError, LedgerResult, NotFoundKind};
use crate::traits::*;
use crate::types::*;

/// Sum the signed amounts of the entries visible in `view`
pub fn sum_balance<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>, view: BalanceView) -> i64 {
    entries
        .into_iter()
        .filter(|entry| view.includes(entry))
        .map(LedgerEntry::signed_amount)
        .sum()
}

/// Balance of a single ledger account
pub async fn ledger_account_balance<S: LedgerStorage>(
    storage: &S,
    ledger_account_id: &str,
    view: BalanceView,
) -> LedgerResult<i64> {
    let entries = storage
        .select_ledger_entries(&LedgerEntryFilter::for_accounts(&[ledger_account_id.to_string()]))
        .await?;
    Ok(sum_balance(&entries, view))
}

/// Balances of several ledger accounts; accounts without entries report zero
pub async fn ledger_account_balances<S: LedgerStorage>(
    storage: &S,
    ledger_account_ids: &[String],
    view: BalanceView,
) -> LedgerResult<HashMap<String, i64>> {
    let mut balances: HashMap<String, i64> = ledger_account_ids
        .iter()
        .map(|id| (id.clone(), 0))
        .collect();

    let entries = storage
        .select_ledger_entries(&LedgerEntryFilter::for_accounts(ledger_account_ids))
        .await?;
    for entry in entries.iter().filter(|entry| view.includes(entry)) {
        *balances.entry(entry.ledger_account_id.clone()).or_insert(0) += entry.signed_amount();
    }

    Ok(balances)
}

/// Remaining spendable balance of one usage credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCreditBalance {
    pub usage_credit_id: String,
    pub ledger_account_id: String,
    pub usage_meter_id: Option<String>,
    pub balance: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Soonest-expiring first; credits that never expire go last
pub fn compare_by_expiration(a: &UsageCreditBalance, b: &UsageCreditBalance) -> Ordering {
    let by_expiry = match (a.expires_at, b.expires_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_expiry
        .then_with(|| a.issued_at.cmp(&b.issued_at))
        .then_with(|| a.usage_credit_id.cmp(&b.usage_credit_id))
}

/// Index the applications referenced by credit-application entries
async fn applications_for_entries<S: LedgerStorage>(
    storage: &S,
    entries: &[LedgerEntry],
) -> LedgerResult<HashMap<String, UsageCreditApplication>> {
    let mut ids: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry.source_credit_application_id().map(str::to_string))
        .collect();
    ids.sort();
    ids.dedup();

    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let applications = storage
        .select_usage_credit_applications(&UsageCreditApplicationFilter::ids(&ids))
        .await?;
    let index: HashMap<String, UsageCreditApplication> = applications
        .into_iter()
        .map(|application| (application.id.clone(), application))
        .collect();

    if let Some(missing) = ids.iter().find(|id| !index.contains_key(*id)) {
        return Err(LedgerError::not_found(
            NotFoundKind::UsageCreditApplication,
            missing.clone(),
        ));
    }

    Ok(index)
}

fn lookup_application<'a>(
    applications: &'a HashMap<String, UsageCreditApplication>,
    entry: &LedgerEntry,
) -> LedgerResult<&'a UsageCreditApplication> {
    entry
        .source_credit_application_id()
        .and_then(|id| applications.get(id))
        .ok_or_else(|| {
            LedgerError::invariant(format!(
                "Entry {} has no matching usage credit application",
                entry.id
            ))
        })
}

/// Per-credit balances on the given accounts, ordered soonest-expiring first
///
/// Grants add to a credit; expirations, admin adjustments and applications
/// spent from it subtract. Credits whose balance is zero or less are included
/// so callers can see fully spent grants.
pub async fn usage_credit_balances<S: LedgerStorage>(
    storage: &S,
    ledger_account_ids: &[String],
    view: BalanceView,
) -> LedgerResult<Vec<UsageCreditBalance>> {
    if ledger_account_ids.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<LedgerEntry> = storage
        .select_ledger_entries(&LedgerEntryFilter::for_accounts(ledger_account_ids).entry_types(&[
            LedgerEntryType::CreditGrantRecognized,
            LedgerEntryType::CreditGrantExpired,
            LedgerEntryType::CreditBalanceAdjusted,
            LedgerEntryType::UsageCreditApplicationDebitFromCreditBalance,
        ]))
        .await?
        .into_iter()
        .filter(|entry| view.includes(entry))
        .collect();
    let applications = applications_for_entries(storage, &entries).await?;

    // credit id -> (account id, balance), in first-seen order
    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, (String, i64)> = HashMap::new();

    for entry in &entries {
        let usage_credit_id = match &entry.source {
            EntrySource::UsageCredit { usage_credit_id } => usage_credit_id.clone(),
            EntrySource::CreditBalanceAdjustment {
                usage_credit_id, ..
            } => usage_credit_id.clone(),
            EntrySource::CreditApplication { .. } => {
                lookup_application(&applications, entry)?.usage_credit_id.clone()
            }
            EntrySource::UsageEvent { .. } => continue,
        };

        let slot = totals.entry(usage_credit_id.clone()).or_insert_with(|| {
            order.push(usage_credit_id.clone());
            (entry.ledger_account_id.clone(), 0)
        });
        slot.1 += entry.signed_amount();
    }

    if order.is_empty() {
        return Ok(Vec::new());
    }

    let credits: HashMap<String, UsageCredit> = storage
        .select_usage_credits(&UsageCreditFilter::ids(&order))
        .await?
        .into_iter()
        .map(|credit| (credit.id.clone(), credit))
        .collect();

    let mut balances = Vec::with_capacity(order.len());
    for usage_credit_id in order {
        let credit = credits
            .get(&usage_credit_id)
            .ok_or_else(|| LedgerError::not_found(NotFoundKind::UsageCredit, &usage_credit_id))?;
        let (ledger_account_id, balance) = totals.remove(&usage_credit_id).unwrap_or_default();

        balances.push(UsageCreditBalance {
            usage_credit_id,
            ledger_account_id,
            usage_meter_id: credit.usage_meter_id.clone(),
            balance,
            issued_at: credit.issued_at,
            expires_at: credit.expires_at,
        });
    }

    balances.sort_by(compare_by_expiration);
    Ok(balances)
}

/// Unsettled part of one usage event's cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingUsageCost {
    pub usage_event_id: String,
    pub ledger_account_id: String,
    /// The usage cost entry recorded for the event
    pub usage_cost_entry: LedgerEntry,
    pub outstanding: i64,
}

/// Usage costs on the given accounts that credit applications have not yet covered
///
/// Returned in the order the usage costs were recorded; fully settled costs are
/// omitted.
pub async fn outstanding_usage_costs<S: LedgerStorage>(
    storage: &S,
    ledger_account_ids: &[String],
    view: BalanceView,
) -> LedgerResult<Vec<OutstandingUsageCost>> {
    if ledger_account_ids.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<LedgerEntry> = storage
        .select_ledger_entries(&LedgerEntryFilter::for_accounts(ledger_account_ids).entry_types(&[
            LedgerEntryType::UsageCost,
            LedgerEntryType::UsageCreditApplicationCreditTowardsUsageCost,
        ]))
        .await?
        .into_iter()
        .filter(|entry| view.includes(entry))
        .collect();
    let applications = applications_for_entries(storage, &entries).await?;

    let mut costs: Vec<OutstandingUsageCost> = Vec::new();
    let mut settled: HashMap<String, i64> = HashMap::new();

    for entry in entries {
        match entry.entry_type {
            LedgerEntryType::UsageCost => {
                let usage_event_id = entry
                    .source_usage_event_id()
                    .map(str::to_string)
                    .unwrap_or_default();
                match costs.iter_mut().find(|c| c.usage_event_id == usage_event_id) {
                    Some(cost) => cost.outstanding += entry.amount,
                    None => costs.push(OutstandingUsageCost {
                        usage_event_id,
                        ledger_account_id: entry.ledger_account_id.clone(),
                        outstanding: entry.amount,
                        usage_cost_entry: entry,
                    }),
                }
            }
            _ => {
                let application = lookup_application(&applications, &entry)?;
                *settled.entry(application.usage_event_id.clone()).or_insert(0) += entry.amount;
            }
        }
    }

    for cost in &mut costs {
        cost.outstanding -= settled.get(&cost.usage_event_id).copied().unwrap_or(0);
    }
    costs.retain(|cost| cost.outstanding > 0);

    Ok(costs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credit_balance(id: &str, expires_at: Option<DateTime<Utc>>) -> UsageCreditBalance {
        UsageCreditBalance {
            usage_credit_id: id.to_string(),
            ledger_account_id: "la_1".to_string(),
            usage_meter_id: Some("um_1".to_string()),
            balance: 10,
            issued_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            expires_at,
        }
    }

    fn usage_cost(status: EntryStatus, amount: i64) -> LedgerEntry {
        LedgerEntry {
            id: generate_id("le"),
            ledger_transaction_id: "lt_1".to_string(),
            ledger_account_id: "la_1".to_string(),
            organization_id: "org_1".to_string(),
            subscription_id: "sub_1".to_string(),
            livemode: false,
            status,
            direction: EntryDirection::Debit,
            entry_type: LedgerEntryType::UsageCost,
            amount,
            entry_timestamp: Utc::now(),
            discarded_at: None,
            source: EntrySource::UsageEvent {
                usage_event_id: "ue_1".to_string(),
            },
            claimed_by_billing_run_id: None,
            description: None,
        }
    }

    #[test]
    fn test_expiring_credits_sort_first() {
        let mut balances = vec![
            credit_balance("uc_forever", None),
            credit_balance(
                "uc_late",
                Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            ),
            credit_balance(
                "uc_soon",
                Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            ),
        ];
        balances.sort_by(compare_by_expiration);

        let ids: Vec<&str> = balances.iter().map(|b| b.usage_credit_id.as_str()).collect();
        assert_eq!(ids, vec!["uc_soon", "uc_late", "uc_forever"]);
    }

    #[test]
    fn test_pending_debit_only_moves_available_balance() {
        let posted = usage_cost(EntryStatus::Posted, 40);
        let mut pending = usage_cost(EntryStatus::Pending, 100);

        let entries = vec![posted.clone(), pending.clone()];
        assert_eq!(sum_balance(&entries, BalanceView::Posted), -40);
        assert_eq!(sum_balance(&entries, BalanceView::Available), -140);

        pending.discarded_at = Some(Utc::now());
        let entries = vec![posted, pending];
        assert_eq!(sum_balance(&entries, BalanceView::Posted), -40);
        assert_eq!(sum_balance(&entries, BalanceView::Available), -40);
    }
}
