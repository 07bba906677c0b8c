//! Traits for storage abstraction and command validation

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::commands::{CommandScope, LedgerCommand};
use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use crate::records::BillingRun;
use crate::types::*;

/// Storage abstraction for the ledger system
///
/// One implementation value represents one ambient database transaction: every
/// read and write a command performs goes through the same handle, and nothing
/// is durable until the caller commits it. Implementations must enforce
/// uniqueness of [`IdempotencyKey`] and of the ledger account key
/// (organization, subscription, usage meter, livemode), surfacing violations as
/// [`crate::LedgerError::Conflict`].
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Save a new ledger transaction
    async fn insert_ledger_transaction(&mut self, transaction: &LedgerTransaction)
        -> LedgerResult<()>;

    /// Find the ledger transaction recorded under an idempotency key
    async fn find_ledger_transaction(
        &self,
        key: &IdempotencyKey,
    ) -> LedgerResult<Option<LedgerTransaction>>;

    /// Get a ledger transaction by ID
    async fn get_ledger_transaction(&self, id: &str) -> LedgerResult<Option<LedgerTransaction>>;

    /// Append ledger entries
    async fn insert_ledger_entries(&mut self, entries: &[LedgerEntry]) -> LedgerResult<()>;

    /// Select ledger entries, in insertion order
    async fn select_ledger_entries(
        &self,
        filter: &LedgerEntryFilter,
    ) -> LedgerResult<Vec<LedgerEntry>>;

    /// Transition pending entries to posted
    async fn post_ledger_entries(&mut self, entry_ids: &[String]) -> LedgerResult<()>;

    /// Stamp pending entries as discarded
    async fn discard_ledger_entries(
        &mut self,
        entry_ids: &[String],
        discarded_at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Mark usage-cost entries as claimed by a billing run
    async fn claim_ledger_entries(
        &mut self,
        entry_ids: &[String],
        billing_run_id: &str,
    ) -> LedgerResult<()>;

    /// Return the account for each usage meter in `scope`, creating missing ones
    async fn find_or_create_ledger_accounts(
        &mut self,
        scope: &CommandScope,
        usage_meter_ids: &[String],
    ) -> LedgerResult<Vec<LedgerAccount>>;

    async fn select_ledger_accounts(
        &self,
        filter: &LedgerAccountFilter,
    ) -> LedgerResult<Vec<LedgerAccount>>;

    async fn insert_usage_credits(&mut self, credits: &[UsageCredit]) -> LedgerResult<()>;

    async fn select_usage_credits(
        &self,
        filter: &UsageCreditFilter,
    ) -> LedgerResult<Vec<UsageCredit>>;

    async fn set_usage_credit_status(
        &mut self,
        usage_credit_ids: &[String],
        status: UsageCreditStatus,
    ) -> LedgerResult<()>;

    async fn insert_usage_credit_applications(
        &mut self,
        applications: &[UsageCreditApplication],
    ) -> LedgerResult<()>;

    async fn select_usage_credit_applications(
        &self,
        filter: &UsageCreditApplicationFilter,
    ) -> LedgerResult<Vec<UsageCreditApplication>>;

    async fn set_usage_credit_application_status(
        &mut self,
        application_ids: &[String],
        status: UsageCreditApplicationStatus,
    ) -> LedgerResult<()>;

    /// Read-only lookup of an upstream billing run
    async fn get_billing_run(&self, billing_run_id: &str) -> LedgerResult<Option<BillingRun>>;
}

fn contains<T: PartialEq>(allowed: &Option<Vec<T>>, value: &T) -> bool {
    allowed.as_ref().is_none_or(|values| values.contains(value))
}

/// Query over ledger entries; `None` fields do not filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerEntryFilter {
    pub ledger_transaction_id: Option<String>,
    pub ledger_account_ids: Option<Vec<String>>,
    pub entry_types: Option<Vec<LedgerEntryType>>,
    pub status: Option<EntryStatus>,
    pub claimed_by_billing_run_id: Option<String>,
    /// Discarded entries are excluded unless this is set
    pub include_discarded: bool,
}

impl LedgerEntryFilter {
    pub fn for_transaction(ledger_transaction_id: &str) -> Self {
        Self {
            ledger_transaction_id: Some(ledger_transaction_id.to_string()),
            include_discarded: true,
            ..Default::default()
        }
    }

    pub fn for_accounts(ledger_account_ids: &[String]) -> Self {
        Self {
            ledger_account_ids: Some(ledger_account_ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn entry_types(mut self, entry_types: &[LedgerEntryType]) -> Self {
        self.entry_types = Some(entry_types.to_vec());
        self
    }

    pub fn status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if !self.include_discarded && entry.is_discarded() {
            return false;
        }
        if let Some(ref id) = self.ledger_transaction_id {
            if &entry.ledger_transaction_id != id {
                return false;
            }
        }
        if let Some(ref run_id) = self.claimed_by_billing_run_id {
            if entry.claimed_by_billing_run_id.as_ref() != Some(run_id) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        contains(&self.ledger_account_ids, &entry.ledger_account_id)
            && contains(&self.entry_types, &entry.entry_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerAccountFilter {
    pub ids: Option<Vec<String>>,
    pub organization_id: Option<String>,
    pub subscription_id: Option<String>,
    pub livemode: Option<bool>,
}

impl LedgerAccountFilter {
    /// All accounts of the scope's subscription
    pub fn for_scope(scope: &CommandScope) -> Self {
        Self {
            ids: None,
            organization_id: Some(scope.organization_id.clone()),
            subscription_id: Some(scope.subscription_id.clone()),
            livemode: Some(scope.livemode),
        }
    }

    pub fn ids(mut self, ids: &[String]) -> Self {
        self.ids = Some(ids.to_vec());
        self
    }

    pub fn matches(&self, account: &LedgerAccount) -> bool {
        contains(&self.ids, &account.id)
            && self
                .organization_id
                .as_ref()
                .is_none_or(|id| id == &account.organization_id)
            && self
                .subscription_id
                .as_ref()
                .is_none_or(|id| id == &account.subscription_id)
            && self.livemode.is_none_or(|mode| mode == account.livemode)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageCreditFilter {
    pub ids: Option<Vec<String>>,
    pub subscription_id: Option<String>,
    pub usage_meter_id: Option<String>,
}

impl UsageCreditFilter {
    pub fn ids(ids: &[String]) -> Self {
        Self {
            ids: Some(ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn matches(&self, credit: &UsageCredit) -> bool {
        contains(&self.ids, &credit.id)
            && self
                .subscription_id
                .as_ref()
                .is_none_or(|id| id == &credit.subscription_id)
            && self
                .usage_meter_id
                .as_ref()
                .is_none_or(|id| credit.usage_meter_id.as_ref() == Some(id))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageCreditApplicationFilter {
    pub ids: Option<Vec<String>>,
    pub usage_credit_ids: Option<Vec<String>>,
    pub usage_event_ids: Option<Vec<String>>,
}

impl UsageCreditApplicationFilter {
    pub fn ids(ids: &[String]) -> Self {
        Self {
            ids: Some(ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn matches(&self, application: &UsageCreditApplication) -> bool {
        contains(&self.ids, &application.id)
            && contains(&self.usage_credit_ids, &application.usage_credit_id)
            && contains(&self.usage_event_ids, &application.usage_event_id)
    }
}

/// Trait for implementing custom command validation rules
///
/// Runs before the idempotency check; a rejected command writes nothing.
pub trait CommandValidator: Send + Sync {
    fn validate_command(&self, command: &LedgerCommand) -> LedgerResult<()>;
}

/// Default command validator: shape, scope and amount checks
pub struct DefaultCommandValidator {
    config: LedgerConfig,
}

impl DefaultCommandValidator {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }
}

impl Default for DefaultCommandValidator {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl CommandValidator for DefaultCommandValidator {
    fn validate_command(&self, command: &LedgerCommand) -> LedgerResult<()> {
        crate::utils::validation::validate_ledger_command(command, &self.config)
    }
}
