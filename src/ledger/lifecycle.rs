//! Pending entry lifecycle and usage cost claiming
//!
//! Pending entries move to posted or get discarded, never both. Posting a
//! transaction also posts the usage credits and applications its entries
//! recognize.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::commands::CommandScope;
use crate::error::{LedgerError, LedgerResult, NotFoundKind};
use crate::ledger::account::ledger_accounts_for_subscription;
use crate::ledger::balance::outstanding_usage_costs;
use crate::records::BillingRun;
use crate::traits::*;
use crate::types::*;

async fn transaction_entries<S: LedgerStorage>(
    storage: &S,
    ledger_transaction_id: &str,
) -> LedgerResult<Vec<LedgerEntry>> {
    if storage
        .get_ledger_transaction(ledger_transaction_id)
        .await?
        .is_none()
    {
        return Err(LedgerError::not_found(
            NotFoundKind::LedgerTransaction,
            ledger_transaction_id,
        ));
    }

    storage
        .select_ledger_entries(&LedgerEntryFilter::for_transaction(ledger_transaction_id))
        .await
}

fn unique_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for id in ids {
        if !unique.iter().any(|existing| existing == id) {
            unique.push(id.to_string());
        }
    }
    unique
}

/// Post every pending entry of a ledger transaction
///
/// Fails with an invariant error if any of them was already discarded.
/// Returns the entries that were posted.
#[instrument(skip(storage))]
pub async fn post_pending_entries<S: LedgerStorage>(
    storage: &mut S,
    ledger_transaction_id: &str,
) -> LedgerResult<Vec<LedgerEntry>> {
    let pending: Vec<LedgerEntry> = transaction_entries(storage, ledger_transaction_id)
        .await?
        .into_iter()
        .filter(|entry| entry.status == EntryStatus::Pending)
        .collect();

    if let Some(discarded) = pending.iter().find(|entry| entry.is_discarded()) {
        return Err(LedgerError::invariant(format!(
            "Ledger transaction {} has discarded entry {} and cannot be posted",
            ledger_transaction_id, discarded.id
        )));
    }
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let entry_ids: Vec<String> = pending.iter().map(|e| e.id.clone()).collect();
    storage.post_ledger_entries(&entry_ids).await?;

    let credit_ids = unique_ids(
        pending
            .iter()
            .filter(|e| e.entry_type == LedgerEntryType::CreditGrantRecognized)
            .filter_map(LedgerEntry::source_usage_credit_id),
    );
    if !credit_ids.is_empty() {
        storage
            .set_usage_credit_status(&credit_ids, UsageCreditStatus::Posted)
            .await?;
    }

    let application_ids =
        unique_ids(pending.iter().filter_map(LedgerEntry::source_credit_application_id));
    if !application_ids.is_empty() {
        storage
            .set_usage_credit_application_status(
                &application_ids,
                UsageCreditApplicationStatus::Posted,
            )
            .await?;
    }

    debug!(
        entries = entry_ids.len(),
        usage_credits = credit_ids.len(),
        applications = application_ids.len(),
        "Posted pending entries"
    );

    Ok(pending
        .into_iter()
        .map(|mut entry| {
            entry.status = EntryStatus::Posted;
            entry
        })
        .collect())
}

/// Discard every pending, not yet discarded entry of a ledger transaction
///
/// Posted entries of the same transaction are left untouched. Returns the
/// entries that were discarded.
#[instrument(skip(storage))]
pub async fn discard_pending_entries<S: LedgerStorage>(
    storage: &mut S,
    ledger_transaction_id: &str,
    discarded_at: DateTime<Utc>,
) -> LedgerResult<Vec<LedgerEntry>> {
    let pending: Vec<LedgerEntry> = transaction_entries(storage, ledger_transaction_id)
        .await?
        .into_iter()
        .filter(|entry| entry.status == EntryStatus::Pending && !entry.is_discarded())
        .collect();
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let entry_ids: Vec<String> = pending.iter().map(|e| e.id.clone()).collect();
    storage
        .discard_ledger_entries(&entry_ids, discarded_at)
        .await?;
    debug!(entries = entry_ids.len(), "Discarded pending entries");

    Ok(pending
        .into_iter()
        .map(|mut entry| {
            entry.discarded_at = Some(discarded_at);
            entry
        })
        .collect())
}

/// Claim every unclaimed, outstanding usage cost on the run's subscription
///
/// Invoice settlement later applies credit only to costs its billing run
/// claimed. Returns the claimed usage cost entries.
#[instrument(skip(storage, billing_run), fields(billing_run_id = %billing_run.id))]
pub async fn claim_outstanding_usage_costs<S: LedgerStorage>(
    storage: &mut S,
    billing_run: &BillingRun,
) -> LedgerResult<Vec<LedgerEntry>> {
    let scope = CommandScope {
        organization_id: billing_run.organization_id.clone(),
        subscription_id: billing_run.subscription_id.clone(),
        livemode: billing_run.livemode,
    };
    let account_ids: Vec<String> = ledger_accounts_for_subscription(storage, &scope)
        .await?
        .into_iter()
        .map(|account| account.id)
        .collect();

    let unclaimed: Vec<LedgerEntry> =
        outstanding_usage_costs(storage, &account_ids, BalanceView::Available)
            .await?
            .into_iter()
            .map(|cost| cost.usage_cost_entry)
            .filter(|entry| entry.claimed_by_billing_run_id.is_none())
            .collect();
    if unclaimed.is_empty() {
        return Ok(Vec::new());
    }

    let entry_ids: Vec<String> = unclaimed.iter().map(|e| e.id.clone()).collect();
    storage
        .claim_ledger_entries(&entry_ids, &billing_run.id)
        .await?;
    debug!(entries = entry_ids.len(), "Claimed usage costs");

    Ok(unclaimed
        .into_iter()
        .map(|mut entry| {
            entry.claimed_by_billing_run_id = Some(billing_run.id.clone());
            entry
        })
        .collect())
}
