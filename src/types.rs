//! Core types and data structures for the usage ledger
//!
//! Amounts are integer minor units of a single currency. Balances are signed:
//! credit entries add to an account, debit entries subtract from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{LedgerError, LedgerResult};

/// Generate a prefixed row identifier
pub(crate) fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Lifecycle status of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Provisional; counts towards the available balance unless discarded
    Pending,
    /// Final and immutable
    Posted,
}

/// Side of a double-entry movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryDirection {
    /// Reduces the account balance
    Debit,
    /// Increases the account balance
    Credit,
}

impl EntryDirection {
    /// Signed contribution of `amount` to an account balance
    pub fn signed(&self, amount: i64) -> i64 {
        match self {
            EntryDirection::Debit => -amount,
            EntryDirection::Credit => amount,
        }
    }
}

/// Which foreign key an entry's source points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntrySourceKind {
    UsageEvent,
    UsageCredit,
    CreditApplication,
    CreditBalanceAdjustment,
}

/// Typed movements recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEntryType {
    UsageCost,
    CreditGrantRecognized,
    CreditGrantExpired,
    CreditBalanceAdjusted,
    UsageCreditApplicationDebitFromCreditBalance,
    UsageCreditApplicationCreditTowardsUsageCost,
}

impl LedgerEntryType {
    /// Every entry type moves money in exactly one direction
    pub fn direction(&self) -> EntryDirection {
        match self {
            LedgerEntryType::UsageCost
            | LedgerEntryType::CreditGrantExpired
            | LedgerEntryType::CreditBalanceAdjusted
            | LedgerEntryType::UsageCreditApplicationDebitFromCreditBalance => EntryDirection::Debit,
            LedgerEntryType::CreditGrantRecognized
            | LedgerEntryType::UsageCreditApplicationCreditTowardsUsageCost => {
                EntryDirection::Credit
            }
        }
    }

    /// The only source kind an entry of this type may reference
    pub fn source_kind(&self) -> EntrySourceKind {
        match self {
            LedgerEntryType::UsageCost => EntrySourceKind::UsageEvent,
            LedgerEntryType::CreditGrantRecognized | LedgerEntryType::CreditGrantExpired => {
                EntrySourceKind::UsageCredit
            }
            LedgerEntryType::CreditBalanceAdjusted => EntrySourceKind::CreditBalanceAdjustment,
            LedgerEntryType::UsageCreditApplicationDebitFromCreditBalance
            | LedgerEntryType::UsageCreditApplicationCreditTowardsUsageCost => {
                EntrySourceKind::CreditApplication
            }
        }
    }
}

/// The single record an entry was produced from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntrySource {
    UsageEvent {
        usage_event_id: String,
    },
    UsageCredit {
        usage_credit_id: String,
    },
    CreditApplication {
        usage_credit_application_id: String,
    },
    /// An admin adjustment always targets one usage credit
    CreditBalanceAdjustment {
        credit_balance_adjustment_id: String,
        usage_credit_id: String,
    },
}

impl EntrySource {
    pub fn kind(&self) -> EntrySourceKind {
        match self {
            EntrySource::UsageEvent { .. } => EntrySourceKind::UsageEvent,
            EntrySource::UsageCredit { .. } => EntrySourceKind::UsageCredit,
            EntrySource::CreditApplication { .. } => EntrySourceKind::CreditApplication,
            EntrySource::CreditBalanceAdjustment { .. } => EntrySourceKind::CreditBalanceAdjustment,
        }
    }
}

/// Business event types; one ledger transaction is recorded per event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerTransactionType {
    UsageEventProcessed,
    CreditGrantRecognized,
    BillingPeriodTransition,
    AdminCreditAdjusted,
    CreditGrantExpired,
    PaymentRefunded,
    SettleInvoiceUsageCosts,
}

impl fmt::Display for LedgerTransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of record that initiated a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitiatingSourceType {
    UsageEvent,
    UsageCredit,
    BillingPeriod,
    CreditBalanceAdjustment,
    Refund,
    Invoice,
}

/// Guarantees at most one ledger transaction per business event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub transaction_type: LedgerTransactionType,
    pub initiating_source_type: InitiatingSourceType,
    pub initiating_source_id: String,
    pub organization_id: String,
    pub livemode: bool,
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:?}:{}:{}:{}",
            self.transaction_type,
            self.initiating_source_type,
            self.initiating_source_id,
            self.organization_id,
            if self.livemode { "live" } else { "test" }
        )
    }
}

/// Audit-trail parent record for one business event
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub organization_id: String,
    pub livemode: bool,
    pub transaction_type: LedgerTransactionType,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
    pub initiating_source_type: InitiatingSourceType,
    pub initiating_source_id: String,
    pub subscription_id: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            transaction_type: self.transaction_type,
            initiating_source_type: self.initiating_source_type,
            initiating_source_id: self.initiating_source_id.clone(),
            organization_id: self.organization_id.clone(),
            livemode: self.livemode,
        }
    }
}

/// One atomic financial movement against a ledger account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub ledger_transaction_id: String,
    pub ledger_account_id: String,
    pub organization_id: String,
    pub subscription_id: String,
    pub livemode: bool,
    pub status: EntryStatus,
    pub direction: EntryDirection,
    pub entry_type: LedgerEntryType,
    /// Non-negative, minor units
    pub amount: i64,
    pub entry_timestamp: DateTime<Utc>,
    /// Only ever set while the entry is pending
    pub discarded_at: Option<DateTime<Utc>>,
    pub source: EntrySource,
    /// Billing run that claimed this usage cost for invoicing
    pub claimed_by_billing_run_id: Option<String>,
    pub description: Option<String>,
}

impl LedgerEntry {
    /// Signed contribution to the owning account's balance
    pub fn signed_amount(&self) -> i64 {
        self.direction.signed(self.amount)
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded_at.is_some()
    }

    pub fn source_usage_event_id(&self) -> Option<&str> {
        match &self.source {
            EntrySource::UsageEvent { usage_event_id } => Some(usage_event_id),
            _ => None,
        }
    }

    pub fn source_usage_credit_id(&self) -> Option<&str> {
        match &self.source {
            EntrySource::UsageCredit { usage_credit_id } => Some(usage_credit_id),
            _ => None,
        }
    }

    pub fn source_credit_application_id(&self) -> Option<&str> {
        match &self.source {
            EntrySource::CreditApplication {
                usage_credit_application_id,
            } => Some(usage_credit_application_id),
            _ => None,
        }
    }

    pub fn source_credit_balance_adjustment_id(&self) -> Option<&str> {
        match &self.source {
            EntrySource::CreditBalanceAdjustment {
                credit_balance_adjustment_id,
                ..
            } => Some(credit_balance_adjustment_id),
            _ => None,
        }
    }

    /// Check the structural invariants of a single entry
    pub fn validate(&self) -> LedgerResult<()> {
        if self.amount < 0 {
            return Err(LedgerError::invariant(format!(
                "Entry {} has negative amount {}",
                self.id, self.amount
            )));
        }

        if self.direction != self.entry_type.direction() {
            return Err(LedgerError::invariant(format!(
                "Entry {} of type {:?} must be a {:?}",
                self.id,
                self.entry_type,
                self.entry_type.direction()
            )));
        }

        if self.source.kind() != self.entry_type.source_kind() {
            return Err(LedgerError::invariant(format!(
                "Entry {} of type {:?} cannot reference a {:?} source",
                self.id,
                self.entry_type,
                self.source.kind()
            )));
        }

        if self.status == EntryStatus::Posted && self.discarded_at.is_some() {
            return Err(LedgerError::invariant(format!(
                "Posted entry {} cannot be discarded",
                self.id
            )));
        }

        Ok(())
    }
}

/// Balance-bearing unit scoped to a subscription and optionally a usage meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: String,
    pub organization_id: String,
    pub subscription_id: String,
    /// `None` for the subscription-wide account
    pub usage_meter_id: Option<String>,
    pub livemode: bool,
    pub created_at: DateTime<Utc>,
}

impl LedgerAccount {
    pub fn new(
        organization_id: String,
        subscription_id: String,
        usage_meter_id: Option<String>,
        livemode: bool,
    ) -> Self {
        Self {
            id: generate_id("la"),
            organization_id,
            subscription_id,
            usage_meter_id,
            livemode,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageCreditType {
    Grant,
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageCreditStatus {
    Pending,
    Posted,
}

/// What produced a usage credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageCreditSourceReferenceType {
    BillingPeriodTransition,
    InvoiceSettlement,
    ManualAdjustment,
}

/// A grant of spendable balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCredit {
    pub id: String,
    pub organization_id: String,
    pub subscription_id: String,
    pub usage_meter_id: Option<String>,
    pub livemode: bool,
    pub credit_type: UsageCreditType,
    pub status: UsageCreditStatus,
    pub issued_amount: i64,
    pub issued_at: DateTime<Utc>,
    /// `None` means the credit never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub source_reference_type: UsageCreditSourceReferenceType,
    pub source_reference_id: String,
    pub billing_period_id: Option<String>,
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageCreditApplicationStatus {
    Pending,
    Posted,
}

impl From<EntryStatus> for UsageCreditStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Pending => UsageCreditStatus::Pending,
            EntryStatus::Posted => UsageCreditStatus::Posted,
        }
    }
}

impl From<EntryStatus> for UsageCreditApplicationStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Pending => UsageCreditApplicationStatus::Pending,
            EntryStatus::Posted => UsageCreditApplicationStatus::Posted,
        }
    }
}

/// Records that part of a usage credit was spent against a usage event's cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCreditApplication {
    pub id: String,
    pub organization_id: String,
    pub livemode: bool,
    pub usage_credit_id: String,
    pub usage_event_id: String,
    /// Always positive
    pub amount_applied: i64,
    pub target_usage_meter_id: Option<String>,
    pub status: UsageCreditApplicationStatus,
    pub applied_at: DateTime<Utc>,
}

/// Which entries a balance includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceView {
    /// Posted entries only
    Posted,
    /// Posted plus non-discarded pending entries (a.k.a. effective balance)
    Available,
}

impl BalanceView {
    /// Whether `entry` counts towards a balance in this view
    pub fn includes(&self, entry: &LedgerEntry) -> bool {
        if entry.is_discarded() {
            return false;
        }
        match self {
            BalanceView::Posted => entry.status == EntryStatus::Posted,
            BalanceView::Available => true,
        }
    }
}
