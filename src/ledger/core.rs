//! Main ledger orchestrator that validates, deduplicates and dispatches commands

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

use crate::commands::{LedgerCommand, LedgerCommandPayload, LedgerCommandResult};
use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use crate::handlers::*;
use crate::ledger::balance::{self, OutstandingUsageCost, UsageCreditBalance};
use crate::ledger::lifecycle;
use crate::records::BillingRun;
use crate::traits::*;
use crate::types::*;

/// Main ledger system that turns business events into ledger transactions
///
/// The ledger holds no state of its own. Every operation runs against the
/// storage handle it is given, which stands for the caller's ambient database
/// transaction; committing or rolling it back is the caller's job.
pub struct Ledger {
    config: LedgerConfig,
    validator: Box<dyn CommandValidator>,
}

impl Ledger {
    /// Create a new ledger with the default configuration
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    /// Create a new ledger validating commands against `config`
    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            validator: Box::new(DefaultCommandValidator::new(config.clone())),
            config,
        }
    }

    /// Create a new ledger with a custom validator
    pub fn with_validator(config: LedgerConfig, validator: Box<dyn CommandValidator>) -> Self {
        Self { config, validator }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Process one ledger command
    ///
    /// A command whose idempotency key already has a ledger transaction returns
    /// that transaction and its entries unchanged, without running a handler.
    #[instrument(
        skip(self, storage, command),
        fields(
            transaction_type = %command.transaction_type(),
            organization_id = %command.organization_id,
            subscription_id = %command.subscription_id
        )
    )]
    pub async fn process_command<S: LedgerStorage>(
        &self,
        storage: &mut S,
        command: &LedgerCommand,
    ) -> LedgerResult<LedgerCommandResult> {
        // Validate before anything is written
        if let Err(err) = self.validator.validate_command(command) {
            warn!(error = %err, "Rejected ledger command");
            return Err(err);
        }

        let key = command.idempotency_key();
        if let Some(existing) = storage.find_ledger_transaction(&key).await? {
            let ledger_entries = storage
                .select_ledger_entries(&LedgerEntryFilter::for_transaction(&existing.id))
                .await?;
            warn!(
                ledger_transaction_id = %existing.id,
                idempotency_key = %key,
                "Replaying recorded ledger transaction"
            );
            return Ok(LedgerCommandResult::replayed(existing, ledger_entries));
        }

        let result = match &command.payload {
            LedgerCommandPayload::UsageEventProcessed(payload) => {
                process_usage_event(storage, command, payload).await
            }
            LedgerCommandPayload::CreditGrantRecognized(payload) => {
                process_credit_grant_recognized(storage, command, payload).await
            }
            LedgerCommandPayload::BillingPeriodTransition(payload) => {
                process_billing_period_transition(storage, command, payload).await
            }
            LedgerCommandPayload::AdminCreditAdjusted(payload) => {
                process_admin_credit_adjusted(storage, command, payload).await
            }
            LedgerCommandPayload::CreditGrantExpired(payload) => {
                process_credit_grant_expired(storage, command, payload).await
            }
            LedgerCommandPayload::PaymentRefunded(payload) => {
                process_payment_refunded(storage, command, payload).await
            }
            LedgerCommandPayload::SettleInvoiceUsageCosts(payload) => {
                process_settle_invoice_usage_costs(storage, command, payload).await
            }
        }?;

        info!(
            ledger_transaction_id = %result.ledger_transaction.id,
            entries = result.ledger_entries.len(),
            "Recorded ledger transaction"
        );
        Ok(result)
    }

    // Balance operations
    /// Get a ledger account's balance under `view`
    pub async fn get_account_balance<S: LedgerStorage>(
        &self,
        storage: &S,
        ledger_account_id: &str,
        view: BalanceView,
    ) -> LedgerResult<i64> {
        balance::ledger_account_balance(storage, ledger_account_id, view).await
    }

    /// Get balances for several ledger accounts
    pub async fn get_account_balances<S: LedgerStorage>(
        &self,
        storage: &S,
        ledger_account_ids: &[String],
        view: BalanceView,
    ) -> LedgerResult<HashMap<String, i64>> {
        balance::ledger_account_balances(storage, ledger_account_ids, view).await
    }

    /// Remaining balance of every usage credit on the given accounts
    pub async fn credit_balances<S: LedgerStorage>(
        &self,
        storage: &S,
        ledger_account_ids: &[String],
        view: BalanceView,
    ) -> LedgerResult<Vec<UsageCreditBalance>> {
        balance::usage_credit_balances(storage, ledger_account_ids, view).await
    }

    /// Usage costs on the given accounts not yet covered by credit
    pub async fn outstanding_usage_costs<S: LedgerStorage>(
        &self,
        storage: &S,
        ledger_account_ids: &[String],
        view: BalanceView,
    ) -> LedgerResult<Vec<OutstandingUsageCost>> {
        balance::outstanding_usage_costs(storage, ledger_account_ids, view).await
    }

    // Lifecycle operations
    /// Claim outstanding usage costs for a billing run
    pub async fn claim_outstanding_usage_costs<S: LedgerStorage>(
        &self,
        storage: &mut S,
        billing_run: &BillingRun,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        lifecycle::claim_outstanding_usage_costs(storage, billing_run).await
    }

    /// Post a transaction's pending entries
    pub async fn post_pending_entries<S: LedgerStorage>(
        &self,
        storage: &mut S,
        ledger_transaction_id: &str,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        lifecycle::post_pending_entries(storage, ledger_transaction_id).await
    }

    /// Discard a transaction's pending entries
    pub async fn discard_pending_entries<S: LedgerStorage>(
        &self,
        storage: &mut S,
        ledger_transaction_id: &str,
        discarded_at: DateTime<Utc>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        lifecycle::discard_pending_entries(storage, ledger_transaction_id, discarded_at).await
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::*;
    use crate::error::LedgerError;
    use crate::records::*;
    use crate::utils::memory_storage::MemoryStorage;
    use chrono::TimeZone;

    fn usage_command(event_id: &str, amount: i64) -> LedgerCommand {
        LedgerCommand::new(
            "org_1",
            "sub_1",
            false,
            LedgerCommandPayload::UsageEventProcessed(UsageEventProcessedPayload {
                usage_event: UsageEvent {
                    id: event_id.to_string(),
                    organization_id: "org_1".to_string(),
                    subscription_id: "sub_1".to_string(),
                    usage_meter_id: Some("um_1".to_string()),
                    livemode: false,
                    amount,
                    usage_date: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
                    billing_period_id: None,
                    price_id: None,
                },
            }),
        )
    }

    struct RejectAll;

    impl CommandValidator for RejectAll {
        fn validate_command(&self, _command: &LedgerCommand) -> LedgerResult<()> {
            Err(LedgerError::validation("rejected"))
        }
    }

    #[tokio::test]
    async fn test_ledger_basic_operations() {
        let storage = MemoryStorage::new();
        let ledger = Ledger::new();
        let mut tx = storage.begin().unwrap();

        let result = ledger
            .process_command(&mut tx, &usage_command("ue_1", 250))
            .await
            .unwrap();
        assert!(!result.replayed);
        assert_eq!(result.ledger_entries.len(), 1);

        let account_id = result.ledger_entries[0].ledger_account_id.clone();
        let balance = ledger
            .get_account_balance(&tx, &account_id, BalanceView::Posted)
            .await
            .unwrap();
        assert_eq!(balance, -250);

        tx.commit().unwrap();
        assert_eq!(storage.ledger_transactions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_does_not_write() {
        let storage = MemoryStorage::new();
        let ledger = Ledger::default();
        let mut tx = storage.begin().unwrap();

        let first = ledger
            .process_command(&mut tx, &usage_command("ue_1", 40))
            .await
            .unwrap();
        let writes = tx.pending_writes();

        let second = ledger
            .process_command(&mut tx, &usage_command("ue_1", 40))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.ledger_transaction.id, first.ledger_transaction.id);
        assert_eq!(tx.pending_writes(), writes);
    }

    #[tokio::test]
    async fn test_custom_validator_runs_first() {
        let storage = MemoryStorage::new();
        let ledger = Ledger::with_validator(LedgerConfig::default(), Box::new(RejectAll));
        let mut tx = storage.begin().unwrap();

        let err = ledger
            .process_command(&mut tx, &usage_command("ue_1", 40))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(tx.pending_writes(), 0);
    }
}
