//! CreditGrantExpired: records the transaction only
//!
//! Expiration entries are written by the billing period transition. This command
//! marks the business event and produces no entries.

use tracing::{debug, instrument};

use crate::commands::{CreditGrantExpiredPayload, LedgerCommand, LedgerCommandResult};
use crate::error::LedgerResult;
use crate::ledger::transaction::record_ledger_transaction;
use crate::traits::*;

#[instrument(skip(storage, command, payload), fields(usage_credit_id = %payload.expired_credit.id))]
pub async fn process_credit_grant_expired<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &CreditGrantExpiredPayload,
) -> LedgerResult<LedgerCommandResult> {
    let transaction = record_ledger_transaction(storage, command).await?;
    debug!(ledger_transaction_id = %transaction.id, "Recorded credit expiration without entries");
    Ok(LedgerCommandResult::recorded(transaction, Vec::new()))
}
