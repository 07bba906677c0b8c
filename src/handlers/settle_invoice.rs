//! SettleInvoiceUsageCosts: turn a paid invoice's usage line items into posted
//! credits and spend them on the usage costs its billing run claimed

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::commands::{
    CommandScope, LedgerCommand, LedgerCommandResult, SettleInvoiceUsageCostsPayload,
};
use crate::error::{LedgerError, LedgerResult, NotFoundKind};
use crate::ledger::account::ledger_accounts_by_id;
use crate::ledger::balance::{outstanding_usage_costs, UsageCreditBalance};
use crate::ledger::credit_application::{record_credit_applications, CreditPool, UsageCostTarget};
use crate::ledger::lifecycle::discard_pending_entries;
use crate::ledger::transaction::{
    record_ledger_transaction, EntryBatch, EntryContext, UsageCreditParams,
};
use crate::records::{BillingRun, Invoice, InvoiceLineItem};
use crate::traits::*;
use crate::types::*;

#[instrument(skip(storage, command, payload), fields(invoice_id = %payload.invoice.id))]
pub async fn process_settle_invoice_usage_costs<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &SettleInvoiceUsageCostsPayload,
) -> LedgerResult<LedgerCommandResult> {
    let invoice = &payload.invoice;
    let usage_items: Vec<&InvoiceLineItem> = payload
        .invoice_line_items
        .iter()
        .filter(|item| item.is_usage())
        .collect();

    if usage_items.is_empty() {
        let transaction = record_ledger_transaction(storage, command).await?;
        debug!("Invoice has no usage line items");
        return Ok(LedgerCommandResult::recorded(transaction, Vec::new()));
    }

    let scope = command.scope();
    let accounts = resolve_line_item_accounts(storage, &scope, &usage_items).await?;
    let billing_run = originating_billing_run(storage, &scope, invoice, &usage_items).await?;

    let account_ids: Vec<String> = accounts.keys().cloned().collect();
    let settled_at = Utc::now();
    let superseded =
        supersede_pending_coverage(storage, &account_ids, &billing_run.id, settled_at).await?;

    let transaction = record_ledger_transaction(storage, command).await?;
    let context = EntryContext::new(&transaction, EntryStatus::Posted, settled_at);
    let mut batch = EntryBatch::new();

    // One posted payment credit per usage line item, pooled by account
    let mut pools: HashMap<String, Vec<UsageCreditBalance>> = HashMap::new();
    let mut credits = Vec::with_capacity(usage_items.len());
    for item in &usage_items {
        let amount = line_item_credit(item)?;
        if amount == 0 {
            continue;
        }
        let account = line_item_account(&accounts, item)?;
        let usage_meter_id = account.usage_meter_id.clone().ok_or_else(|| {
            LedgerError::invariant(format!(
                "Ledger account {} on line item {} has no usage meter",
                account.id, item.id
            ))
        })?;

        let credit = context.usage_credit(UsageCreditParams {
            usage_meter_id,
            credit_type: UsageCreditType::Payment,
            status: UsageCreditStatus::Posted,
            issued_amount: amount,
            issued_at: context.entry_timestamp,
            expires_at: None,
            source_reference_type: UsageCreditSourceReferenceType::InvoiceSettlement,
            source_reference_id: invoice.id.clone(),
            billing_period_id: invoice.billing_period_id.clone(),
            payment_id: None,
        });
        pools
            .entry(account.id.clone())
            .or_default()
            .push(UsageCreditBalance {
                usage_credit_id: credit.id.clone(),
                ledger_account_id: account.id.clone(),
                usage_meter_id: credit.usage_meter_id.clone(),
                balance: credit.issued_amount,
                issued_at: credit.issued_at,
                expires_at: credit.expires_at,
            });
        batch.push(context.credit_grant_recognized(&account.id, &credit)?);
        credits.push(credit);
    }
    storage.insert_usage_credits(&credits).await?;

    let mut pools: HashMap<String, CreditPool> = pools
        .into_iter()
        .map(|(account_id, credits)| (account_id, CreditPool::new(credits)))
        .collect();

    let claimed = outstanding_usage_costs(storage, &account_ids, BalanceView::Available)
        .await?
        .into_iter()
        .filter(|cost| {
            cost.usage_cost_entry.claimed_by_billing_run_id.as_deref()
                == Some(billing_run.id.as_str())
        });

    let mut settled = 0;
    for cost in claimed {
        let Some(pool) = pools.get_mut(&cost.ledger_account_id) else {
            continue;
        };
        let allocations = pool.draw(cost.outstanding);
        let target = UsageCostTarget {
            ledger_account_id: &cost.ledger_account_id,
            usage_event_id: &cost.usage_event_id,
            usage_meter_id: accounts
                .get(&cost.ledger_account_id)
                .and_then(|a| a.usage_meter_id.as_deref()),
        };
        let outcome = record_credit_applications(storage, &context, &target, &allocations).await?;
        settled += outcome.amount_applied();
        batch.extend(outcome.entries);
    }

    debug!(
        billing_run_id = %billing_run.id,
        credits = credits.len(),
        settled,
        superseded = superseded.len(),
        "Settled invoice usage costs"
    );

    let ledger_entries = batch.write(storage).await?;
    Ok(LedgerCommandResult::recorded(transaction, ledger_entries))
}

fn line_item_credit(item: &InvoiceLineItem) -> LedgerResult<i64> {
    item.ledger_account_credit.ok_or_else(|| {
        LedgerError::validation(format!(
            "Usage line item {} has no ledger account credit",
            item.id
        ))
    })
}

fn line_item_account<'a>(
    accounts: &'a HashMap<String, LedgerAccount>,
    item: &InvoiceLineItem,
) -> LedgerResult<&'a LedgerAccount> {
    let ledger_account_id = item.ledger_account_id.as_deref().ok_or_else(|| {
        LedgerError::validation(format!("Usage line item {} has no ledger account", item.id))
    })?;
    accounts
        .get(ledger_account_id)
        .ok_or_else(|| LedgerError::not_found(NotFoundKind::LedgerAccount, ledger_account_id))
}

/// Resolve the distinct accounts the usage line items reference
///
/// Any account that does not resolve within the command's scope (missing, or
/// belonging to another organization or subscription) is a scope mismatch.
async fn resolve_line_item_accounts<S: LedgerStorage>(
    storage: &S,
    scope: &CommandScope,
    usage_items: &[&InvoiceLineItem],
) -> LedgerResult<HashMap<String, LedgerAccount>> {
    let mut requested: Vec<String> = Vec::new();
    for item in usage_items {
        let ledger_account_id = item.ledger_account_id.as_deref().ok_or_else(|| {
            LedgerError::validation(format!("Usage line item {} has no ledger account", item.id))
        })?;
        if !requested.iter().any(|id| id == ledger_account_id) {
            requested.push(ledger_account_id.to_string());
        }
    }

    let resolved = ledger_accounts_by_id(storage, scope, &requested).await?;
    if resolved.len() != requested.len() {
        return Err(LedgerError::ScopeMismatch {
            kind: NotFoundKind::LedgerAccount,
            expected: requested.len(),
            resolved: resolved.len(),
        });
    }

    Ok(resolved
        .into_iter()
        .map(|account| (account.id.clone(), account))
        .collect())
}

/// The billing run whose claimed usage costs this invoice pays for
async fn originating_billing_run<S: LedgerStorage>(
    storage: &S,
    scope: &CommandScope,
    invoice: &Invoice,
    usage_items: &[&InvoiceLineItem],
) -> LedgerResult<BillingRun> {
    let billing_run_id = invoice
        .billing_run_id
        .as_deref()
        .or_else(|| usage_items.iter().find_map(|item| item.billing_run_id.as_deref()))
        .ok_or_else(|| LedgerError::not_found(NotFoundKind::BillingRun, &invoice.id))?;

    let billing_run = storage
        .get_billing_run(billing_run_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(NotFoundKind::BillingRun, billing_run_id))?;

    if billing_run.organization_id != scope.organization_id
        || billing_run.subscription_id != scope.subscription_id
        || billing_run.livemode != scope.livemode
    {
        return Err(LedgerError::ScopeMismatch {
            kind: NotFoundKind::BillingRun,
            expected: 1,
            resolved: 0,
        });
    }

    Ok(billing_run)
}

/// Discard pending overage coverage of the costs `billing_run_id` claimed
///
/// A billing period transition may already have covered a claimed cost with a
/// pending overage credit. The invoice payment replaces that coverage, so every
/// pending entry of such a transition is discarded before the payment is applied.
/// Other costs that transition covered become outstanding again. Returns the
/// discarded entries.
async fn supersede_pending_coverage<S: LedgerStorage>(
    storage: &mut S,
    account_ids: &[String],
    billing_run_id: &str,
    discarded_at: DateTime<Utc>,
) -> LedgerResult<Vec<LedgerEntry>> {
    let claimed_events: Vec<String> = storage
        .select_ledger_entries(
            &LedgerEntryFilter::for_accounts(account_ids).entry_types(&[LedgerEntryType::UsageCost]),
        )
        .await?
        .into_iter()
        .filter(|entry| {
            !entry.is_discarded()
                && entry.claimed_by_billing_run_id.as_deref() == Some(billing_run_id)
        })
        .filter_map(|entry| entry.source_usage_event_id().map(str::to_string))
        .collect();
    if claimed_events.is_empty() {
        return Ok(Vec::new());
    }

    let pending_coverage: Vec<LedgerEntry> = storage
        .select_ledger_entries(
            &LedgerEntryFilter::for_accounts(account_ids)
                .entry_types(&[LedgerEntryType::UsageCreditApplicationCreditTowardsUsageCost])
                .status(EntryStatus::Pending),
        )
        .await?
        .into_iter()
        .filter(|entry| !entry.is_discarded())
        .collect();
    if pending_coverage.is_empty() {
        return Ok(Vec::new());
    }

    let application_ids: Vec<String> = pending_coverage
        .iter()
        .filter_map(|entry| entry.source_credit_application_id().map(str::to_string))
        .collect();
    let applications = storage
        .select_usage_credit_applications(&UsageCreditApplicationFilter::ids(&application_ids))
        .await?;

    let mut transaction_ids: Vec<String> = Vec::new();
    for entry in &pending_coverage {
        let covers_claimed_cost = entry
            .source_credit_application_id()
            .and_then(|id| applications.iter().find(|application| application.id == id))
            .is_some_and(|application| claimed_events.contains(&application.usage_event_id));
        if covers_claimed_cost && !transaction_ids.contains(&entry.ledger_transaction_id) {
            transaction_ids.push(entry.ledger_transaction_id.clone());
        }
    }

    let mut discarded = Vec::new();
    for ledger_transaction_id in &transaction_ids {
        debug!(%ledger_transaction_id, "Superseding pending overage coverage");
        discarded.extend(discard_pending_entries(storage, ledger_transaction_id, discarded_at).await?);
    }
    Ok(discarded)
}
