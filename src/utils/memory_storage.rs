//! In-memory storage implementation for testing
//!
//! [`MemoryStorage`] holds committed state. [`MemoryStorage::begin`] opens a
//! [`MemoryTransaction`] working on a snapshot; its writes are journaled and only
//! replayed onto the shared state by [`MemoryTransaction::commit`]. Dropping a
//! transaction without committing rolls all of its writes back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::commands::CommandScope;
use crate::error::{LedgerError, LedgerResult};
use crate::records::BillingRun;
use crate::traits::*;
use crate::types::*;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    transactions: Vec<LedgerTransaction>,
    entries: Vec<LedgerEntry>,
    accounts: Vec<LedgerAccount>,
    credits: Vec<UsageCredit>,
    applications: Vec<UsageCreditApplication>,
    billing_runs: HashMap<String, BillingRun>,
}

#[derive(Debug, Clone)]
enum WriteOp {
    InsertTransaction(LedgerTransaction),
    InsertEntries(Vec<LedgerEntry>),
    PostEntries(Vec<String>),
    DiscardEntries(Vec<String>, DateTime<Utc>),
    ClaimEntries(Vec<String>, String),
    InsertAccounts(Vec<LedgerAccount>),
    InsertCredits(Vec<UsageCredit>),
    SetCreditStatus(Vec<String>, UsageCreditStatus),
    InsertApplications(Vec<UsageCreditApplication>),
    SetApplicationStatus(Vec<String>, UsageCreditApplicationStatus),
}

impl MemoryState {
    fn entry_mut(&mut self, id: &str) -> LedgerResult<&mut LedgerEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| LedgerError::Storage(format!("Ledger entry {} does not exist", id)))
    }

    fn apply(&mut self, op: &WriteOp) -> LedgerResult<()> {
        match op {
            WriteOp::InsertTransaction(transaction) => {
                let key = transaction.idempotency_key();
                if self
                    .transactions
                    .iter()
                    .any(|existing| existing.idempotency_key() == key)
                {
                    return Err(LedgerError::Conflict(format!(
                        "Ledger transaction already recorded for {}",
                        key
                    )));
                }
                if self.transactions.iter().any(|t| t.id == transaction.id) {
                    return Err(LedgerError::Conflict(format!(
                        "Duplicate ledger transaction id {}",
                        transaction.id
                    )));
                }
                self.transactions.push(transaction.clone());
            }
            WriteOp::InsertEntries(entries) => {
                for entry in entries {
                    entry.validate()?;
                    if !self
                        .transactions
                        .iter()
                        .any(|t| t.id == entry.ledger_transaction_id)
                    {
                        return Err(LedgerError::invariant(format!(
                            "Entry {} references unknown ledger transaction {}",
                            entry.id, entry.ledger_transaction_id
                        )));
                    }
                    if self.entries.iter().any(|e| e.id == entry.id) {
                        return Err(LedgerError::Conflict(format!(
                            "Duplicate ledger entry id {}",
                            entry.id
                        )));
                    }
                    self.entries.push(entry.clone());
                }
            }
            WriteOp::PostEntries(ids) => {
                for id in ids {
                    let entry = self.entry_mut(id)?;
                    if entry.is_discarded() {
                        return Err(LedgerError::invariant(format!(
                            "Discarded entry {} cannot be posted",
                            id
                        )));
                    }
                    entry.status = EntryStatus::Posted;
                }
            }
            WriteOp::DiscardEntries(ids, discarded_at) => {
                for id in ids {
                    let entry = self.entry_mut(id)?;
                    if entry.status == EntryStatus::Posted {
                        return Err(LedgerError::invariant(format!(
                            "Posted entry {} cannot be discarded",
                            id
                        )));
                    }
                    entry.discarded_at = Some(*discarded_at);
                }
            }
            WriteOp::ClaimEntries(ids, billing_run_id) => {
                for id in ids {
                    let entry = self.entry_mut(id)?;
                    if entry.entry_type != LedgerEntryType::UsageCost {
                        return Err(LedgerError::invariant(format!(
                            "Only usage cost entries can be claimed, {} is {:?}",
                            id, entry.entry_type
                        )));
                    }
                    entry.claimed_by_billing_run_id = Some(billing_run_id.clone());
                }
            }
            WriteOp::InsertAccounts(accounts) => {
                for account in accounts {
                    let duplicate = self.accounts.iter().any(|existing| {
                        existing.organization_id == account.organization_id
                            && existing.subscription_id == account.subscription_id
                            && existing.usage_meter_id == account.usage_meter_id
                            && existing.livemode == account.livemode
                    });
                    if duplicate {
                        return Err(LedgerError::Conflict(format!(
                            "Ledger account already exists for subscription {} and meter {:?}",
                            account.subscription_id, account.usage_meter_id
                        )));
                    }
                    self.accounts.push(account.clone());
                }
            }
            WriteOp::InsertCredits(credits) => {
                for credit in credits {
                    if self.credits.iter().any(|c| c.id == credit.id) {
                        return Err(LedgerError::Conflict(format!(
                            "Duplicate usage credit id {}",
                            credit.id
                        )));
                    }
                    self.credits.push(credit.clone());
                }
            }
            WriteOp::SetCreditStatus(ids, status) => {
                for id in ids {
                    let credit = self
                        .credits
                        .iter_mut()
                        .find(|c| &c.id == id)
                        .ok_or_else(|| {
                            LedgerError::Storage(format!("Usage credit {} does not exist", id))
                        })?;
                    credit.status = *status;
                }
            }
            WriteOp::InsertApplications(applications) => {
                for application in applications {
                    if application.amount_applied <= 0 {
                        return Err(LedgerError::invariant(format!(
                            "Usage credit application {} must apply a positive amount",
                            application.id
                        )));
                    }
                    if self.applications.iter().any(|a| a.id == application.id) {
                        return Err(LedgerError::Conflict(format!(
                            "Duplicate usage credit application id {}",
                            application.id
                        )));
                    }
                    self.applications.push(application.clone());
                }
            }
            WriteOp::SetApplicationStatus(ids, status) => {
                for id in ids {
                    let application = self
                        .applications
                        .iter_mut()
                        .find(|a| &a.id == id)
                        .ok_or_else(|| {
                            LedgerError::Storage(format!(
                                "Usage credit application {} does not exist",
                                id
                            ))
                        })?;
                    application.status = *status;
                }
            }
        }
        Ok(())
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Storage("memory storage lock poisoned".to_string())
}

/// In-memory storage implementation for testing and development
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> LedgerResult<RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> LedgerResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| poisoned())
    }

    /// Open a transaction over a snapshot of the committed state
    pub fn begin(&self) -> LedgerResult<MemoryTransaction> {
        let working = self.read()?.clone();
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.state),
            working,
            journal: Vec::new(),
        })
    }

    /// Register an upstream billing run for read-only lookups
    pub fn insert_billing_run(&self, billing_run: BillingRun) -> LedgerResult<()> {
        self.write()?
            .billing_runs
            .insert(billing_run.id.clone(), billing_run);
        Ok(())
    }

    /// Committed ledger transactions
    pub fn ledger_transactions(&self) -> LedgerResult<Vec<LedgerTransaction>> {
        Ok(self.read()?.transactions.clone())
    }

    /// Committed ledger entries, including discarded ones
    pub fn ledger_entries(&self) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self.read()?.entries.clone())
    }

    pub fn ledger_accounts(&self) -> LedgerResult<Vec<LedgerAccount>> {
        Ok(self.read()?.accounts.clone())
    }

    pub fn usage_credits(&self) -> LedgerResult<Vec<UsageCredit>> {
        Ok(self.read()?.credits.clone())
    }

    pub fn usage_credit_applications(&self) -> LedgerResult<Vec<UsageCreditApplication>> {
        Ok(self.read()?.applications.clone())
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) -> LedgerResult<()> {
        *self.write()? = MemoryState::default();
        Ok(())
    }
}

/// One open transaction against a [`MemoryStorage`]
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<RwLock<MemoryState>>,
    working: MemoryState,
    journal: Vec<WriteOp>,
}

impl MemoryTransaction {
    fn record(&mut self, op: WriteOp) -> LedgerResult<()> {
        self.working.apply(&op)?;
        self.journal.push(op);
        Ok(())
    }

    /// Replay this transaction's writes onto the shared state
    ///
    /// Either every write lands or none does. Uniqueness is re-checked against
    /// whatever committed since [`MemoryStorage::begin`], so two first-time
    /// commits of the same business event fail with `Conflict` on the second.
    pub fn commit(self) -> LedgerResult<()> {
        let mut shared = self.shared.write().map_err(|_| poisoned())?;
        let mut next = shared.clone();
        for op in &self.journal {
            next.apply(op)?;
        }
        *shared = next;
        Ok(())
    }

    /// Abandon every write made in this transaction
    pub fn rollback(self) {}

    /// Number of writes waiting for commit
    pub fn pending_writes(&self) -> usize {
        self.journal.len()
    }
}

#[async_trait]
impl LedgerStorage for MemoryTransaction {
    async fn insert_ledger_transaction(
        &mut self,
        transaction: &LedgerTransaction,
    ) -> LedgerResult<()> {
        self.record(WriteOp::InsertTransaction(transaction.clone()))
    }

    async fn find_ledger_transaction(
        &self,
        key: &IdempotencyKey,
    ) -> LedgerResult<Option<LedgerTransaction>> {
        Ok(self
            .working
            .transactions
            .iter()
            .find(|transaction| &transaction.idempotency_key() == key)
            .cloned())
    }

    async fn get_ledger_transaction(&self, id: &str) -> LedgerResult<Option<LedgerTransaction>> {
        Ok(self
            .working
            .transactions
            .iter()
            .find(|transaction| transaction.id == id)
            .cloned())
    }

    async fn insert_ledger_entries(&mut self, entries: &[LedgerEntry]) -> LedgerResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.record(WriteOp::InsertEntries(entries.to_vec()))
    }

    async fn select_ledger_entries(
        &self,
        filter: &LedgerEntryFilter,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .working
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }

    async fn post_ledger_entries(&mut self, entry_ids: &[String]) -> LedgerResult<()> {
        self.record(WriteOp::PostEntries(entry_ids.to_vec()))
    }

    async fn discard_ledger_entries(
        &mut self,
        entry_ids: &[String],
        discarded_at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.record(WriteOp::DiscardEntries(entry_ids.to_vec(), discarded_at))
    }

    async fn claim_ledger_entries(
        &mut self,
        entry_ids: &[String],
        billing_run_id: &str,
    ) -> LedgerResult<()> {
        self.record(WriteOp::ClaimEntries(
            entry_ids.to_vec(),
            billing_run_id.to_string(),
        ))
    }

    async fn find_or_create_ledger_accounts(
        &mut self,
        scope: &CommandScope,
        usage_meter_ids: &[String],
    ) -> LedgerResult<Vec<LedgerAccount>> {
        let mut resolved = Vec::with_capacity(usage_meter_ids.len());
        let mut created = Vec::new();

        for usage_meter_id in usage_meter_ids {
            let existing = self
                .working
                .accounts
                .iter()
                .chain(created.iter())
                .find(|account| {
                    account.organization_id == scope.organization_id
                        && account.subscription_id == scope.subscription_id
                        && account.livemode == scope.livemode
                        && account.usage_meter_id.as_ref() == Some(usage_meter_id)
                })
                .cloned();

            match existing {
                Some(account) => resolved.push(account),
                None => {
                    let account = LedgerAccount::new(
                        scope.organization_id.clone(),
                        scope.subscription_id.clone(),
                        Some(usage_meter_id.clone()),
                        scope.livemode,
                    );
                    created.push(account.clone());
                    resolved.push(account);
                }
            }
        }

        if !created.is_empty() {
            self.record(WriteOp::InsertAccounts(created))?;
        }

        Ok(resolved)
    }

    async fn select_ledger_accounts(
        &self,
        filter: &LedgerAccountFilter,
    ) -> LedgerResult<Vec<LedgerAccount>> {
        Ok(self
            .working
            .accounts
            .iter()
            .filter(|account| filter.matches(account))
            .cloned()
            .collect())
    }

    async fn insert_usage_credits(&mut self, credits: &[UsageCredit]) -> LedgerResult<()> {
        if credits.is_empty() {
            return Ok(());
        }
        self.record(WriteOp::InsertCredits(credits.to_vec()))
    }

    async fn select_usage_credits(
        &self,
        filter: &UsageCreditFilter,
    ) -> LedgerResult<Vec<UsageCredit>> {
        Ok(self
            .working
            .credits
            .iter()
            .filter(|credit| filter.matches(credit))
            .cloned()
            .collect())
    }

    async fn set_usage_credit_status(
        &mut self,
        usage_credit_ids: &[String],
        status: UsageCreditStatus,
    ) -> LedgerResult<()> {
        self.record(WriteOp::SetCreditStatus(usage_credit_ids.to_vec(), status))
    }

    async fn insert_usage_credit_applications(
        &mut self,
        applications: &[UsageCreditApplication],
    ) -> LedgerResult<()> {
        if applications.is_empty() {
            return Ok(());
        }
        self.record(WriteOp::InsertApplications(applications.to_vec()))
    }

    async fn select_usage_credit_applications(
        &self,
        filter: &UsageCreditApplicationFilter,
    ) -> LedgerResult<Vec<UsageCreditApplication>> {
        Ok(self
            .working
            .applications
            .iter()
            .filter(|application| filter.matches(application))
            .cloned()
            .collect())
    }

    async fn set_usage_credit_application_status(
        &mut self,
        application_ids: &[String],
        status: UsageCreditApplicationStatus,
    ) -> LedgerResult<()> {
        self.record(WriteOp::SetApplicationStatus(
            application_ids.to_vec(),
            status,
        ))
    }

    async fn get_billing_run(&self, billing_run_id: &str) -> LedgerResult<Option<BillingRun>> {
        Ok(self.working.billing_runs.get(billing_run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> CommandScope {
        CommandScope {
            organization_id: "org_1".to_string(),
            subscription_id: "sub_1".to_string(),
            livemode: false,
        }
    }

    fn transaction(id: &str, source_id: &str) -> LedgerTransaction {
        LedgerTransaction {
            id: id.to_string(),
            organization_id: "org_1".to_string(),
            livemode: false,
            transaction_type: LedgerTransactionType::UsageEventProcessed,
            description: None,
            metadata: HashMap::new(),
            initiating_source_type: InitiatingSourceType::UsageEvent,
            initiating_source_id: source_id.to_string(),
            subscription_id: "sub_1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_rolled_back() {
        let storage = MemoryStorage::new();

        let mut tx = storage.begin().unwrap();
        tx.insert_ledger_transaction(&transaction("lt_1", "ue_1"))
            .await
            .unwrap();
        tx.find_or_create_ledger_accounts(&scope(), &["um_1".to_string()])
            .await
            .unwrap();
        assert_eq!(tx.pending_writes(), 2);
        tx.rollback();

        assert!(storage.ledger_transactions().unwrap().is_empty());
        assert!(storage.ledger_accounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_or_create_reuses_accounts() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().unwrap();

        let meters = vec!["um_1".to_string(), "um_2".to_string(), "um_1".to_string()];
        let first = tx.find_or_create_ledger_accounts(&scope(), &meters).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].id, first[2].id);

        let second = tx
            .find_or_create_ledger_accounts(&scope(), &["um_2".to_string()])
            .await
            .unwrap();
        assert_eq!(second[0].id, first[1].id);
        tx.commit().unwrap();

        assert_eq!(storage.ledger_accounts().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_commits_conflict() {
        let storage = MemoryStorage::new();

        let mut first = storage.begin().unwrap();
        let mut second = storage.begin().unwrap();
        first
            .insert_ledger_transaction(&transaction("lt_1", "ue_1"))
            .await
            .unwrap();
        second
            .insert_ledger_transaction(&transaction("lt_2", "ue_1"))
            .await
            .unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert_eq!(storage.ledger_transactions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_posted_entries_cannot_be_discarded() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().unwrap();
        tx.insert_ledger_transaction(&transaction("lt_1", "ue_1"))
            .await
            .unwrap();

        let entry = LedgerEntry {
            id: "le_1".to_string(),
            ledger_transaction_id: "lt_1".to_string(),
            ledger_account_id: "la_1".to_string(),
            organization_id: "org_1".to_string(),
            subscription_id: "sub_1".to_string(),
            livemode: false,
            status: EntryStatus::Posted,
            direction: EntryDirection::Debit,
            entry_type: LedgerEntryType::UsageCost,
            amount: 10,
            entry_timestamp: Utc::now(),
            discarded_at: None,
            source: EntrySource::UsageEvent {
                usage_event_id: "ue_1".to_string(),
            },
            claimed_by_billing_run_id: None,
            description: None,
        };
        tx.insert_ledger_entries(&[entry]).await.unwrap();

        let err = tx
            .discard_ledger_entries(&["le_1".to_string()], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Invariant(_)));
    }
}
