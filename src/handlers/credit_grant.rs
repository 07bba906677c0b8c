//! CreditGrantRecognized: credit a usage credit's issued amount to its meter's account

use tracing::{debug, instrument};

use crate::commands::{CreditGrantRecognizedPayload, LedgerCommand, LedgerCommandResult};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::account::{find_or_create_ledger_accounts, require_usage_meter_id};
use crate::ledger::transaction::{record_ledger_transaction, EntryBatch, EntryContext};
use crate::traits::*;
use crate::types::*;

#[instrument(skip(storage, command, payload), fields(usage_credit_id = %payload.usage_credit.id))]
pub async fn process_credit_grant_recognized<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &CreditGrantRecognizedPayload,
) -> LedgerResult<LedgerCommandResult> {
    let credit = &payload.usage_credit;
    let usage_meter_id = require_usage_meter_id(credit.usage_meter_id.as_deref(), &credit.id)?;

    let accounts =
        find_or_create_ledger_accounts(storage, &command.scope(), &[usage_meter_id.to_string()])
            .await?;
    let account = accounts.require(usage_meter_id)?;

    // Save the credit row unless an earlier step already did
    let existing = storage
        .select_usage_credits(&UsageCreditFilter::ids(&[credit.id.clone()]))
        .await?;
    match existing.first() {
        Some(stored) => ensure_same_credit(stored, credit)?,
        None => storage.insert_usage_credits(std::slice::from_ref(credit)).await?,
    }

    let already_recognized = storage
        .select_ledger_entries(
            &LedgerEntryFilter::for_accounts(&[account.id.clone()])
                .entry_types(&[LedgerEntryType::CreditGrantRecognized]),
        )
        .await?
        .iter()
        .any(|entry| {
            !entry.is_discarded() && entry.source_usage_credit_id() == Some(credit.id.as_str())
        });
    if already_recognized {
        return Err(LedgerError::validation(format!(
            "Usage credit {} has already been recognized",
            credit.id
        )));
    }

    let status = match credit.status {
        UsageCreditStatus::Pending => EntryStatus::Pending,
        UsageCreditStatus::Posted => EntryStatus::Posted,
    };

    let transaction = record_ledger_transaction(storage, command).await?;
    let context = EntryContext::new(&transaction, status, credit.issued_at);

    let mut batch = EntryBatch::new();
    batch.push(context.credit_grant_recognized(&account.id, credit)?);
    debug!(
        amount = credit.issued_amount,
        ledger_account_id = %account.id,
        "Recognized usage credit grant"
    );

    let ledger_entries = batch.write(storage).await?;
    Ok(LedgerCommandResult::recorded(transaction, ledger_entries))
}

/// A stored credit must describe the same grant as the command's payload
fn ensure_same_credit(stored: &UsageCredit, credit: &UsageCredit) -> LedgerResult<()> {
    if stored.organization_id != credit.organization_id
        || stored.subscription_id != credit.subscription_id
        || stored.livemode != credit.livemode
        || stored.usage_meter_id != credit.usage_meter_id
        || stored.issued_amount != credit.issued_amount
    {
        return Err(LedgerError::validation(format!(
            "Usage credit {} does not match the stored credit",
            credit.id
        )));
    }
    Ok(())
}
