//! AdminCreditAdjusted: reduce a usage credit's balance by an admin-entered amount

use chrono::Utc;
use tracing::{debug, instrument};

use crate::commands::{AdminCreditAdjustedPayload, LedgerCommand, LedgerCommandResult};
use crate::error::{LedgerError, LedgerResult, NotFoundKind};
use crate::ledger::account::{find_or_create_ledger_accounts, require_usage_meter_id};
use crate::ledger::balance::usage_credit_balances;
use crate::ledger::transaction::{record_ledger_transaction, EntryBatch, EntryContext};
use crate::traits::*;
use crate::types::*;

#[instrument(
    skip(storage, command, payload),
    fields(credit_balance_adjustment_id = %payload.credit_balance_adjustment.id)
)]
pub async fn process_admin_credit_adjusted<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &AdminCreditAdjustedPayload,
) -> LedgerResult<LedgerCommandResult> {
    let adjustment = &payload.credit_balance_adjustment;
    let usage_meter_id =
        require_usage_meter_id(adjustment.usage_meter_id.as_deref(), &adjustment.id)?;

    let scope = command.scope();
    let adjusted = storage
        .select_usage_credits(&UsageCreditFilter::ids(&[adjustment
            .adjusted_usage_credit_id
            .clone()]))
        .await?;
    let credit = adjusted.first().ok_or_else(|| {
        LedgerError::not_found(NotFoundKind::UsageCredit, &adjustment.adjusted_usage_credit_id)
    })?;

    // Only a credit of this command's subscription can be adjusted
    if credit.organization_id != scope.organization_id
        || credit.subscription_id != scope.subscription_id
        || credit.livemode != scope.livemode
    {
        return Err(LedgerError::ScopeMismatch {
            kind: NotFoundKind::UsageCredit,
            expected: 1,
            resolved: 0,
        });
    }
    if credit.usage_meter_id.as_deref() != Some(usage_meter_id) {
        return Err(LedgerError::validation(format!(
            "Adjustment {} targets meter {} but usage credit {} belongs to another meter",
            adjustment.id, usage_meter_id, credit.id
        )));
    }

    let accounts =
        find_or_create_ledger_accounts(storage, &scope, &[usage_meter_id.to_string()]).await?;
    let account = accounts.require(usage_meter_id)?;

    let remaining = usage_credit_balances(storage, &[account.id.clone()], BalanceView::Available)
        .await?
        .into_iter()
        .find(|balance| balance.usage_credit_id == credit.id)
        .map_or(0, |balance| balance.balance);
    if adjustment.amount_adjusted > remaining {
        return Err(LedgerError::validation(format!(
            "Adjustment {} of {} exceeds the remaining balance {} of usage credit {}",
            adjustment.id, adjustment.amount_adjusted, remaining, credit.id
        )));
    }

    let transaction = record_ledger_transaction(storage, command).await?;
    let context = EntryContext::new(&transaction, EntryStatus::Posted, Utc::now());

    let mut batch = EntryBatch::new();
    batch.push(context.credit_balance_adjusted(&account.id, adjustment)?);
    debug!(
        amount = adjustment.amount_adjusted,
        usage_credit_id = %adjustment.adjusted_usage_credit_id,
        "Adjusted usage credit balance"
    );

    let ledger_entries = batch.write(storage).await?;
    Ok(LedgerCommandResult::recorded(transaction, ledger_entries))
}
