//! Ledger account resolution
//!
//! Accounts are created lazily, one per (organization, subscription, usage meter,
//! livemode). Lookup maps built here live for a single command.

use std::collections::HashMap;

use crate::commands::CommandScope;
use crate::error::{LedgerError, LedgerResult, NotFoundKind};
use crate::traits::*;
use crate::types::*;

/// The ledger accounts one command posts against, keyed by usage meter id
#[derive(Debug, Clone, Default)]
pub struct LedgerAccountsByMeter {
    accounts: HashMap<String, LedgerAccount>,
}

impl LedgerAccountsByMeter {
    /// Index meter-scoped accounts; subscription-wide accounts are skipped
    pub fn from_accounts(accounts: impl IntoIterator<Item = LedgerAccount>) -> Self {
        let accounts = accounts
            .into_iter()
            .filter_map(|account| {
                account
                    .usage_meter_id
                    .clone()
                    .map(|usage_meter_id| (usage_meter_id, account))
            })
            .collect();
        Self { accounts }
    }

    pub fn get(&self, usage_meter_id: &str) -> Option<&LedgerAccount> {
        self.accounts.get(usage_meter_id)
    }

    /// Account for a meter this command already resolved
    ///
    /// A miss means an application or entry references a meter the command never
    /// resolved, which is a data-integrity bug rather than a runtime condition.
    pub fn require(&self, usage_meter_id: &str) -> LedgerResult<&LedgerAccount> {
        self.accounts.get(usage_meter_id).ok_or_else(|| {
            LedgerError::invariant(format!(
                "No ledger account resolved for usage meter {}",
                usage_meter_id
            ))
        })
    }

    pub fn accounts(&self) -> impl Iterator<Item = &LedgerAccount> {
        self.accounts.values()
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.values().map(|a| a.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Reject records that would post to an account without a usage meter
pub fn require_usage_meter_id<'a>(
    usage_meter_id: Option<&'a str>,
    owner_id: &str,
) -> LedgerResult<&'a str> {
    match usage_meter_id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(LedgerError::not_found(NotFoundKind::UsageMeter, owner_id)),
    }
}

fn in_scope(account: &LedgerAccount, scope: &CommandScope) -> bool {
    account.organization_id == scope.organization_id
        && account.subscription_id == scope.subscription_id
        && account.livemode == scope.livemode
}

/// Find or lazily create the account for each usage meter
pub async fn find_or_create_ledger_accounts<S: LedgerStorage>(
    storage: &mut S,
    scope: &CommandScope,
    usage_meter_ids: &[String],
) -> LedgerResult<LedgerAccountsByMeter> {
    let mut unique_meter_ids: Vec<String> = Vec::with_capacity(usage_meter_ids.len());
    for id in usage_meter_ids {
        if !unique_meter_ids.contains(id) {
            unique_meter_ids.push(id.clone());
        }
    }

    if unique_meter_ids.is_empty() {
        return Ok(LedgerAccountsByMeter::default());
    }

    let accounts = storage
        .find_or_create_ledger_accounts(scope, &unique_meter_ids)
        .await?;

    // The store must hand back exactly the requested accounts, all in scope
    let resolved: Vec<LedgerAccount> = accounts
        .into_iter()
        .filter(|account| in_scope(account, scope))
        .collect();
    let by_meter = LedgerAccountsByMeter::from_accounts(resolved);
    let all_present = unique_meter_ids.iter().all(|id| by_meter.get(id).is_some());

    if by_meter.len() != unique_meter_ids.len() || !all_present {
        return Err(LedgerError::ScopeMismatch {
            kind: NotFoundKind::LedgerAccount,
            expected: unique_meter_ids.len(),
            resolved: by_meter.len(),
        });
    }

    Ok(by_meter)
}

/// All existing ledger accounts on the command's subscription
pub async fn ledger_accounts_for_subscription<S: LedgerStorage>(
    storage: &S,
    scope: &CommandScope,
) -> LedgerResult<Vec<LedgerAccount>> {
    storage
        .select_ledger_accounts(&LedgerAccountFilter::for_scope(scope))
        .await
}

/// Resolve accounts by id, restricted to the command's scope
///
/// Accounts outside the scope are simply not returned; callers compare counts
/// to detect cross-tenant references.
pub async fn ledger_accounts_by_id<S: LedgerStorage>(
    storage: &S,
    scope: &CommandScope,
    ledger_account_ids: &[String],
) -> LedgerResult<Vec<LedgerAccount>> {
    storage
        .select_ledger_accounts(&LedgerAccountFilter::for_scope(scope).ids(ledger_account_ids))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_storage::MemoryStorage;

    fn scope(subscription_id: &str) -> CommandScope {
        CommandScope {
            organization_id: "org_1".to_string(),
            subscription_id: subscription_id.to_string(),
            livemode: false,
        }
    }

    #[tokio::test]
    async fn test_find_or_create_builds_meter_map() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().unwrap();

        let accounts = find_or_create_ledger_accounts(
            &mut tx,
            &scope("sub_1"),
            &["um_1".to_string(), "um_2".to_string(), "um_1".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(accounts.len(), 2);
        assert!(accounts.require("um_1").is_ok());
        assert!(matches!(
            accounts.require("um_3"),
            Err(LedgerError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_accounts_by_id_respect_scope() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().unwrap();

        let mine = find_or_create_ledger_accounts(&mut tx, &scope("sub_1"), &["um_1".to_string()])
            .await
            .unwrap();
        let theirs =
            find_or_create_ledger_accounts(&mut tx, &scope("sub_2"), &["um_1".to_string()])
                .await
                .unwrap();

        let ids = vec![
            mine.require("um_1").unwrap().id.clone(),
            theirs.require("um_1").unwrap().id.clone(),
        ];
        let resolved = ledger_accounts_by_id(&tx, &scope("sub_1"), &ids).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].subscription_id, "sub_1");
    }

    #[test]
    fn test_missing_usage_meter_is_not_found() {
        let err = require_usage_meter_id(None, "ue_1").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotFound {
                kind: NotFoundKind::UsageMeter,
                ..
            }
        ));
        assert_eq!(require_usage_meter_id(Some("um_1"), "ue_1").unwrap(), "um_1");
    }
}
