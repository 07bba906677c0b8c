//! UsageEventProcessed: debit the usage cost and spend available credit on it

use tracing::{debug, instrument};

use crate::commands::{LedgerCommand, LedgerCommandResult, UsageEventProcessedPayload};
use crate::error::LedgerResult;
use crate::ledger::account::{find_or_create_ledger_accounts, require_usage_meter_id};
use crate::ledger::balance::usage_credit_balances;
use crate::ledger::credit_application::{apply_credits, UsageCostTarget};
use crate::ledger::transaction::{record_ledger_transaction, EntryBatch, EntryContext};
use crate::traits::*;
use crate::types::*;

/// Record a usage event's cost and cover as much of it as available credit allows
///
/// The usage cost entry and every application pair are posted immediately and
/// timestamped at the event's usage date.
#[instrument(skip(storage, command, payload), fields(usage_event_id = %payload.usage_event.id))]
pub async fn process_usage_event<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &UsageEventProcessedPayload,
) -> LedgerResult<LedgerCommandResult> {
    let event = &payload.usage_event;
    let usage_meter_id = require_usage_meter_id(event.usage_meter_id.as_deref(), &event.id)?;

    let accounts =
        find_or_create_ledger_accounts(storage, &command.scope(), &[usage_meter_id.to_string()])
            .await?;
    let account = accounts.require(usage_meter_id)?;

    let transaction = record_ledger_transaction(storage, command).await?;
    let context = EntryContext::new(&transaction, EntryStatus::Posted, event.usage_date);

    let mut batch = EntryBatch::new();
    batch.push(context.usage_cost(&account.id, &event.id, event.amount)?);

    let credits =
        usage_credit_balances(storage, &[account.id.clone()], BalanceView::Available).await?;
    let target = UsageCostTarget {
        ledger_account_id: &account.id,
        usage_event_id: &event.id,
        usage_meter_id: Some(usage_meter_id),
    };
    let outcome = apply_credits(storage, &context, &target, event.amount, &credits).await?;

    debug!(
        amount = event.amount,
        covered = outcome.amount_applied(),
        applications = outcome.applications.len(),
        "Processed usage event"
    );
    batch.extend(outcome.entries);

    let ledger_entries = batch.write(storage).await?;
    Ok(LedgerCommandResult::recorded(transaction, ledger_entries))
}
