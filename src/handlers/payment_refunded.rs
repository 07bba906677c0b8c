//! PaymentRefunded: records the transaction only; no entries are produced

use tracing::{debug, instrument};

use crate::commands::{LedgerCommand, LedgerCommandResult, PaymentRefundedPayload};
use crate::error::LedgerResult;
use crate::ledger::transaction::record_ledger_transaction;
use crate::traits::*;

#[instrument(skip(storage, command, payload), fields(refund_id = %payload.refund.id))]
pub async fn process_payment_refunded<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &PaymentRefundedPayload,
) -> LedgerResult<LedgerCommandResult> {
    let transaction = record_ledger_transaction(storage, command).await?;
    debug!(
        ledger_transaction_id = %transaction.id,
        amount = payload.refund.amount,
        "Recorded refund without entries"
    );
    Ok(LedgerCommandResult::recorded(transaction, Vec::new()))
}
