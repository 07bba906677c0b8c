//! Ledger transaction and entry construction

use chrono::{DateTime, Utc};

use crate::commands::LedgerCommand;
use crate::error::LedgerResult;
use crate::records::CreditBalanceAdjustment;
use crate::traits::*;
use crate::types::*;

/// Create and save the parent ledger transaction for a command
pub async fn record_ledger_transaction<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
) -> LedgerResult<LedgerTransaction> {
    let key = command.idempotency_key();
    let transaction = LedgerTransaction {
        id: generate_id("lt"),
        organization_id: command.organization_id.clone(),
        livemode: command.livemode,
        transaction_type: key.transaction_type,
        description: command.transaction_description.clone(),
        metadata: command.transaction_metadata.clone(),
        initiating_source_type: key.initiating_source_type,
        initiating_source_id: key.initiating_source_id,
        subscription_id: command.subscription_id.clone(),
        created_at: Utc::now(),
    };

    storage.insert_ledger_transaction(&transaction).await?;
    Ok(transaction)
}

/// Fields shared by every entry a command writes in one step
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub ledger_transaction_id: String,
    pub organization_id: String,
    pub subscription_id: String,
    pub livemode: bool,
    pub status: EntryStatus,
    pub entry_timestamp: DateTime<Utc>,
}

impl EntryContext {
    pub fn new(
        transaction: &LedgerTransaction,
        status: EntryStatus,
        entry_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            ledger_transaction_id: transaction.id.clone(),
            organization_id: transaction.organization_id.clone(),
            subscription_id: transaction.subscription_id.clone(),
            livemode: transaction.livemode,
            status,
            entry_timestamp,
        }
    }

    /// Same context with a different status
    pub fn with_status(&self, status: EntryStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Build a validated entry; the direction follows from the entry type
    pub fn entry(
        &self,
        ledger_account_id: &str,
        entry_type: LedgerEntryType,
        amount: i64,
        source: EntrySource,
        description: Option<String>,
    ) -> LedgerResult<LedgerEntry> {
        let entry = LedgerEntry {
            id: generate_id("le"),
            ledger_transaction_id: self.ledger_transaction_id.clone(),
            ledger_account_id: ledger_account_id.to_string(),
            organization_id: self.organization_id.clone(),
            subscription_id: self.subscription_id.clone(),
            livemode: self.livemode,
            status: self.status,
            direction: entry_type.direction(),
            entry_type,
            amount,
            entry_timestamp: self.entry_timestamp,
            discarded_at: None,
            source,
            claimed_by_billing_run_id: None,
            description,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Debit the full cost of a usage event
    pub fn usage_cost(
        &self,
        ledger_account_id: &str,
        usage_event_id: &str,
        amount: i64,
    ) -> LedgerResult<LedgerEntry> {
        self.entry(
            ledger_account_id,
            LedgerEntryType::UsageCost,
            amount,
            EntrySource::UsageEvent {
                usage_event_id: usage_event_id.to_string(),
            },
            None,
        )
    }

    /// Credit the issued amount of a usage credit
    pub fn credit_grant_recognized(
        &self,
        ledger_account_id: &str,
        credit: &UsageCredit,
    ) -> LedgerResult<LedgerEntry> {
        self.entry(
            ledger_account_id,
            LedgerEntryType::CreditGrantRecognized,
            credit.issued_amount,
            EntrySource::UsageCredit {
                usage_credit_id: credit.id.clone(),
            },
            None,
        )
    }

    /// Debit the unused remainder of an expiring credit
    pub fn credit_grant_expired(
        &self,
        ledger_account_id: &str,
        usage_credit_id: &str,
        remaining: i64,
    ) -> LedgerResult<LedgerEntry> {
        self.entry(
            ledger_account_id,
            LedgerEntryType::CreditGrantExpired,
            remaining,
            EntrySource::UsageCredit {
                usage_credit_id: usage_credit_id.to_string(),
            },
            None,
        )
    }

    pub fn credit_balance_adjusted(
        &self,
        ledger_account_id: &str,
        adjustment: &CreditBalanceAdjustment,
    ) -> LedgerResult<LedgerEntry> {
        self.entry(
            ledger_account_id,
            LedgerEntryType::CreditBalanceAdjusted,
            adjustment.amount_adjusted,
            EntrySource::CreditBalanceAdjustment {
                credit_balance_adjustment_id: adjustment.id.clone(),
                usage_credit_id: adjustment.adjusted_usage_credit_id.clone(),
            },
            Some(adjustment.reason.clone()),
        )
    }

    /// The matched debit/credit pair for one credit application
    ///
    /// The debit spends the credit balance and the credit covers the usage cost;
    /// both carry the applied amount so the pair nets to zero on the account.
    pub fn credit_application_pair(
        &self,
        ledger_account_id: &str,
        application: &UsageCreditApplication,
    ) -> LedgerResult<[LedgerEntry; 2]> {
        let source = EntrySource::CreditApplication {
            usage_credit_application_id: application.id.clone(),
        };
        let context = EntryContext {
            entry_timestamp: application.applied_at,
            ..self.clone()
        };

        Ok([
            context.entry(
                ledger_account_id,
                LedgerEntryType::UsageCreditApplicationDebitFromCreditBalance,
                application.amount_applied,
                source.clone(),
                None,
            )?,
            context.entry(
                ledger_account_id,
                LedgerEntryType::UsageCreditApplicationCreditTowardsUsageCost,
                application.amount_applied,
                source,
                None,
            )?,
        ])
    }
}

/// Parameters for issuing a usage credit from inside a command
#[derive(Debug, Clone)]
pub struct UsageCreditParams {
    pub usage_meter_id: String,
    pub credit_type: UsageCreditType,
    pub status: UsageCreditStatus,
    pub issued_amount: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source_reference_type: UsageCreditSourceReferenceType,
    pub source_reference_id: String,
    pub billing_period_id: Option<String>,
    pub payment_id: Option<String>,
}

impl EntryContext {
    /// A new usage credit in this context's organization and subscription
    pub fn usage_credit(&self, params: UsageCreditParams) -> UsageCredit {
        UsageCredit {
            id: generate_id("uc"),
            organization_id: self.organization_id.clone(),
            subscription_id: self.subscription_id.clone(),
            usage_meter_id: Some(params.usage_meter_id),
            livemode: self.livemode,
            credit_type: params.credit_type,
            status: params.status,
            issued_amount: params.issued_amount,
            issued_at: params.issued_at,
            expires_at: params.expires_at,
            source_reference_type: params.source_reference_type,
            source_reference_id: params.source_reference_id,
            billing_period_id: params.billing_period_id,
            payment_id: params.payment_id,
        }
    }

    /// A new application of `amount` from a credit to a usage event's cost
    pub fn usage_credit_application(
        &self,
        usage_credit_id: &str,
        usage_event_id: &str,
        target_usage_meter_id: Option<String>,
        amount: i64,
    ) -> UsageCreditApplication {
        UsageCreditApplication {
            id: generate_id("uca"),
            organization_id: self.organization_id.clone(),
            livemode: self.livemode,
            usage_credit_id: usage_credit_id.to_string(),
            usage_event_id: usage_event_id.to_string(),
            amount_applied: amount,
            target_usage_meter_id,
            status: self.status.into(),
            applied_at: self.entry_timestamp,
        }
    }
}

/// Entries accumulated by a handler, written in one batch
#[derive(Debug, Default)]
pub struct EntryBatch {
    entries: Vec<LedgerEntry>,
}

impl EntryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = LedgerEntry>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total debits and credits in the batch
    pub fn totals(&self) -> (i64, i64) {
        self.entries
            .iter()
            .fold((0, 0), |(debits, credits), entry| match entry.direction {
                EntryDirection::Debit => (debits + entry.amount, credits),
                EntryDirection::Credit => (debits, credits + entry.amount),
            })
    }

    /// Save the batch and hand the entries back
    pub async fn write<S: LedgerStorage>(self, storage: &mut S) -> LedgerResult<Vec<LedgerEntry>> {
        storage.insert_ledger_entries(&self.entries).await?;
        Ok(self.entries)
    }
}
