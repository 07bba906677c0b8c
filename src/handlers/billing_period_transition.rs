//! BillingPeriodTransition: settle overage, expire credits, grant entitlements
//!
//! All three steps write into one ledger transaction and are timestamped at the
//! new billing period's start. Overage settlement stays pending until the
//! transition is confirmed (see [`crate::ledger::lifecycle`]); expirations and
//! entitlement grants are posted immediately.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::commands::{BillingPeriodTransitionPayload, LedgerCommand, LedgerCommandResult};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::account::{find_or_create_ledger_accounts, ledger_accounts_for_subscription};
use crate::ledger::balance::{outstanding_usage_costs, usage_credit_balances, OutstandingUsageCost};
use crate::ledger::credit_application::{
    record_credit_applications, CreditAllocation, UsageCostTarget,
};
use crate::ledger::transaction::{
    record_ledger_transaction, EntryBatch, EntryContext, UsageCreditParams,
};
use crate::records::{BillingPeriod, FeatureRenewalFrequency, SubscriptionFeatureItem};
use crate::traits::*;
use crate::types::*;

#[instrument(
    skip(storage, command, payload),
    fields(billing_period_id = %payload.new_billing_period.id)
)]
pub async fn process_billing_period_transition<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    payload: &BillingPeriodTransitionPayload,
) -> LedgerResult<LedgerCommandResult> {
    let new_period = &payload.new_billing_period;
    let accounts = ledger_accounts_for_subscription(storage, &command.scope()).await?;

    let transaction = record_ledger_transaction(storage, command).await?;
    let context = EntryContext::new(&transaction, EntryStatus::Posted, new_period.start_date);

    let mut ledger_entries = settle_overage(storage, &context, &accounts, new_period).await?;
    ledger_entries.extend(expire_credits(storage, &context, &accounts, new_period).await?);
    ledger_entries.extend(grant_entitlements(storage, command, &context, payload).await?);

    Ok(LedgerCommandResult::recorded(transaction, ledger_entries))
}

/// Outstanding usage costs grouped by ledger account, in first-seen order
fn group_by_account(costs: Vec<OutstandingUsageCost>) -> Vec<(String, Vec<OutstandingUsageCost>)> {
    let mut groups: Vec<(String, Vec<OutstandingUsageCost>)> = Vec::new();
    for cost in costs {
        match groups
            .iter_mut()
            .find(|(account_id, _)| *account_id == cost.ledger_account_id)
        {
            Some((_, group)) => group.push(cost),
            None => groups.push((cost.ledger_account_id.clone(), vec![cost])),
        }
    }
    groups
}

/// Cover every account's outstanding usage with one pending credit per account
///
/// The credit is sized to the account's total outstanding amount and applied to
/// each underlying usage event, so the account nets to zero in the available
/// view while nothing changes in the posted view.
async fn settle_overage<S: LedgerStorage>(
    storage: &mut S,
    context: &EntryContext,
    accounts: &[LedgerAccount],
    new_period: &BillingPeriod,
) -> LedgerResult<Vec<LedgerEntry>> {
    let account_ids: Vec<String> = accounts.iter().map(|a| a.id.clone()).collect();
    let costs = outstanding_usage_costs(storage, &account_ids, BalanceView::Available).await?;
    if costs.is_empty() {
        return Ok(Vec::new());
    }

    let meters: HashMap<&str, Option<&str>> = accounts
        .iter()
        .map(|a| (a.id.as_str(), a.usage_meter_id.as_deref()))
        .collect();
    let pending = context.with_status(EntryStatus::Pending);
    let mut batch = EntryBatch::new();

    for (ledger_account_id, costs) in group_by_account(costs) {
        let usage_meter_id = meters
            .get(ledger_account_id.as_str())
            .copied()
            .flatten()
            .ok_or_else(|| {
                LedgerError::invariant(format!(
                    "Usage cost on ledger account {} has no usage meter",
                    ledger_account_id
                ))
            })?;
        let total: i64 = costs.iter().map(|c| c.outstanding).sum();

        let credit = pending.usage_credit(UsageCreditParams {
            usage_meter_id: usage_meter_id.to_string(),
            credit_type: UsageCreditType::Payment,
            status: UsageCreditStatus::Pending,
            issued_amount: total,
            issued_at: pending.entry_timestamp,
            expires_at: None,
            source_reference_type: UsageCreditSourceReferenceType::BillingPeriodTransition,
            source_reference_id: new_period.id.clone(),
            billing_period_id: Some(new_period.id.clone()),
            payment_id: None,
        });
        storage.insert_usage_credits(std::slice::from_ref(&credit)).await?;
        batch.push(pending.credit_grant_recognized(&ledger_account_id, &credit)?);

        for cost in &costs {
            let target = UsageCostTarget {
                ledger_account_id: &ledger_account_id,
                usage_event_id: &cost.usage_event_id,
                usage_meter_id: Some(usage_meter_id),
            };
            let allocation = CreditAllocation {
                usage_credit_id: credit.id.clone(),
                amount: cost.outstanding,
            };
            let outcome =
                record_credit_applications(storage, &pending, &target, &[allocation]).await?;
            batch.extend(outcome.entries);
        }

        debug!(
            %ledger_account_id,
            amount = total,
            usage_events = costs.len(),
            "Settled overage with pending credit"
        );
    }

    batch.write(storage).await
}

fn has_expired(expires_at: Option<DateTime<Utc>>, period_start: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| at <= period_start)
}

/// Zero out the remaining balance of every credit that expired by the period start
async fn expire_credits<S: LedgerStorage>(
    storage: &mut S,
    context: &EntryContext,
    accounts: &[LedgerAccount],
    new_period: &BillingPeriod,
) -> LedgerResult<Vec<LedgerEntry>> {
    let account_ids: Vec<String> = accounts.iter().map(|a| a.id.clone()).collect();
    let balances = usage_credit_balances(storage, &account_ids, BalanceView::Available).await?;

    let mut batch = EntryBatch::new();
    for credit in balances
        .iter()
        .filter(|b| b.balance > 0 && has_expired(b.expires_at, new_period.start_date))
    {
        debug!(
            usage_credit_id = %credit.usage_credit_id,
            remaining = credit.balance,
            "Expiring usage credit"
        );
        batch.push(context.credit_grant_expired(
            &credit.ledger_account_id,
            &credit.usage_credit_id,
            credit.balance,
        )?);
    }

    batch.write(storage).await
}

/// Feature items that grant credit on this transition
fn granted_items<'a>(
    payload: &'a BillingPeriodTransitionPayload,
) -> impl Iterator<Item = &'a SubscriptionFeatureItem> {
    let first_period = payload.previous_billing_period.is_none();
    payload
        .subscription_feature_items
        .iter()
        .filter(move |item| item.amount > 0)
        .filter(move |item| match item.renewal_frequency {
            FeatureRenewalFrequency::EveryBillingPeriod => true,
            FeatureRenewalFrequency::Once => first_period,
        })
}

/// Issue a posted grant for every usage-credit entitlement of the new period
async fn grant_entitlements<S: LedgerStorage>(
    storage: &mut S,
    command: &LedgerCommand,
    context: &EntryContext,
    payload: &BillingPeriodTransitionPayload,
) -> LedgerResult<Vec<LedgerEntry>> {
    let new_period = &payload.new_billing_period;
    let items: Vec<&SubscriptionFeatureItem> = granted_items(payload).collect();
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let usage_meter_ids: Vec<String> = items.iter().map(|i| i.usage_meter_id.clone()).collect();
    let accounts = find_or_create_ledger_accounts(storage, &command.scope(), &usage_meter_ids).await?;

    let credits: Vec<UsageCredit> = items
        .iter()
        .map(|item| {
            let expires_at = match item.renewal_frequency {
                FeatureRenewalFrequency::EveryBillingPeriod => Some(new_period.end_date),
                FeatureRenewalFrequency::Once => None,
            };
            context.usage_credit(UsageCreditParams {
                usage_meter_id: item.usage_meter_id.clone(),
                credit_type: UsageCreditType::Grant,
                status: UsageCreditStatus::Posted,
                issued_amount: item.amount,
                issued_at: context.entry_timestamp,
                expires_at,
                source_reference_type: UsageCreditSourceReferenceType::BillingPeriodTransition,
                source_reference_id: new_period.id.clone(),
                billing_period_id: Some(new_period.id.clone()),
                payment_id: None,
            })
        })
        .collect();
    storage.insert_usage_credits(&credits).await?;

    let mut batch = EntryBatch::new();
    for (item, credit) in items.iter().zip(&credits) {
        let account = accounts.require(&item.usage_meter_id)?;
        batch.push(context.credit_grant_recognized(&account.id, credit)?);
        debug!(
            subscription_feature_item_id = %item.id,
            amount = credit.issued_amount,
            "Granted usage credit entitlement"
        );
    }

    batch.write(storage).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn period(id: &str) -> BillingPeriod {
        BillingPeriod {
            id: id.to_string(),
            subscription_id: "sub_1".to_string(),
            start_date: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    fn item(id: &str, amount: i64, renewal_frequency: FeatureRenewalFrequency) -> SubscriptionFeatureItem {
        SubscriptionFeatureItem {
            id: id.to_string(),
            subscription_id: "sub_1".to_string(),
            usage_meter_id: "um_1".to_string(),
            amount,
            renewal_frequency,
        }
    }

    #[test]
    fn test_one_time_items_only_on_first_period() {
        let items = vec![
            item("sfi_monthly", 100, FeatureRenewalFrequency::EveryBillingPeriod),
            item("sfi_once", 500, FeatureRenewalFrequency::Once),
            item("sfi_empty", 0, FeatureRenewalFrequency::EveryBillingPeriod),
        ];

        let first = BillingPeriodTransitionPayload {
            previous_billing_period: None,
            new_billing_period: period("bp_1"),
            subscription_feature_items: items.clone(),
        };
        let ids: Vec<&str> = granted_items(&first).map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["sfi_monthly", "sfi_once"]);

        let renewal = BillingPeriodTransitionPayload {
            previous_billing_period: Some(period("bp_0")),
            new_billing_period: period("bp_1"),
            subscription_feature_items: items,
        };
        let ids: Vec<&str> = granted_items(&renewal).map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["sfi_monthly"]);
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(has_expired(Some(start), start));
        assert!(has_expired(Some(start - chrono::Duration::days(1)), start));
        assert!(!has_expired(Some(start + chrono::Duration::seconds(1)), start));
        assert!(!has_expired(None, start));
    }
}
