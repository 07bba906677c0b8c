//! Common fixtures for usage-ledger integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Once;
use usage_ledger::{
    BalanceView, BillingPeriod, BillingPeriodTransitionPayload, BillingRun, BillingRunStatus,
    CreditGrantRecognizedPayload, FeatureRenewalFrequency, Invoice, InvoiceLineItem,
    InvoiceLineItemType, InvoiceStatus, Ledger, LedgerCommand, LedgerCommandPayload,
    LedgerCommandResult, LedgerEntry, LedgerResult, MemoryStorage, OutstandingUsageCost,
    SettleInvoiceUsageCostsPayload, SubscriptionFeatureItem, UsageCredit, UsageCreditBalance,
    UsageCreditSourceReferenceType, UsageCreditStatus, UsageCreditType, UsageEvent,
    UsageEventProcessedPayload,
};

pub const ORG: &str = "org_acme";
pub const SUB: &str = "sub_pro";
pub const METER: &str = "um_api_calls";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("warn,usage_ledger=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// A ledger over an in-memory store; every command runs in its own transaction.
pub struct TestLedger {
    pub storage: MemoryStorage,
    pub ledger: Ledger,
}

impl TestLedger {
    pub fn new() -> Self {
        init_tracing();
        Self {
            storage: MemoryStorage::new(),
            ledger: Ledger::new(),
        }
    }

    /// Process one command and commit it, or roll it back on error.
    pub async fn run(&self, command: &LedgerCommand) -> LedgerResult<LedgerCommandResult> {
        let mut tx = self.storage.begin()?;
        let result = self.ledger.process_command(&mut tx, command).await?;
        tx.commit()?;
        Ok(result)
    }

    pub fn account_id(&self, subscription_id: &str, usage_meter_id: &str) -> String {
        self.storage
            .ledger_accounts()
            .unwrap()
            .into_iter()
            .find(|a| {
                a.subscription_id == subscription_id
                    && a.usage_meter_id.as_deref() == Some(usage_meter_id)
            })
            .map(|a| a.id)
            .expect("ledger account exists")
    }

    pub async fn balance(&self, ledger_account_id: &str, view: BalanceView) -> i64 {
        let tx = self.storage.begin().unwrap();
        self.ledger
            .get_account_balance(&tx, ledger_account_id, view)
            .await
            .unwrap()
    }

    pub async fn credit_balances(&self, ledger_account_id: &str) -> Vec<UsageCreditBalance> {
        let tx = self.storage.begin().unwrap();
        self.ledger
            .credit_balances(&tx, &[ledger_account_id.to_string()], BalanceView::Available)
            .await
            .unwrap()
    }

    pub async fn outstanding(&self, ledger_account_id: &str) -> Vec<OutstandingUsageCost> {
        let tx = self.storage.begin().unwrap();
        self.ledger
            .outstanding_usage_costs(&tx, &[ledger_account_id.to_string()], BalanceView::Available)
            .await
            .unwrap()
    }

    pub async fn claim(&self, billing_run: &BillingRun) -> LedgerResult<Vec<LedgerEntry>> {
        let mut tx = self.storage.begin()?;
        let claimed = self
            .ledger
            .claim_outstanding_usage_costs(&mut tx, billing_run)
            .await?;
        tx.commit()?;
        Ok(claimed)
    }

    pub async fn post_pending(&self, ledger_transaction_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let mut tx = self.storage.begin()?;
        let posted = self
            .ledger
            .post_pending_entries(&mut tx, ledger_transaction_id)
            .await?;
        tx.commit()?;
        Ok(posted)
    }

    pub async fn discard_pending(
        &self,
        ledger_transaction_id: &str,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let mut tx = self.storage.begin()?;
        let discarded = self
            .ledger
            .discard_pending_entries(&mut tx, ledger_transaction_id, Utc::now())
            .await?;
        tx.commit()?;
        Ok(discarded)
    }
}

/// Net signed amount of a set of entries
pub fn net(entries: &[LedgerEntry]) -> i64 {
    entries.iter().map(LedgerEntry::signed_amount).sum()
}

pub fn usage_event(id: &str, usage_meter_id: Option<&str>, amount: i64) -> UsageEvent {
    UsageEvent {
        id: id.to_string(),
        organization_id: ORG.to_string(),
        subscription_id: SUB.to_string(),
        usage_meter_id: usage_meter_id.map(str::to_string),
        livemode: false,
        amount,
        usage_date: date(2024, 1, 15),
        billing_period_id: Some("bp_jan".to_string()),
        price_id: None,
    }
}

pub fn usage_command(event: UsageEvent) -> LedgerCommand {
    LedgerCommand::new(
        event.organization_id.clone(),
        event.subscription_id.clone(),
        event.livemode,
        LedgerCommandPayload::UsageEventProcessed(UsageEventProcessedPayload { usage_event: event }),
    )
}

pub fn usage_credit(
    id: &str,
    usage_meter_id: &str,
    amount: i64,
    expires_at: Option<DateTime<Utc>>,
) -> UsageCredit {
    UsageCredit {
        id: id.to_string(),
        organization_id: ORG.to_string(),
        subscription_id: SUB.to_string(),
        usage_meter_id: Some(usage_meter_id.to_string()),
        livemode: false,
        credit_type: UsageCreditType::Grant,
        status: UsageCreditStatus::Posted,
        issued_amount: amount,
        issued_at: date(2024, 1, 1),
        expires_at,
        source_reference_type: UsageCreditSourceReferenceType::ManualAdjustment,
        source_reference_id: id.to_string(),
        billing_period_id: None,
        payment_id: None,
    }
}

pub fn credit_grant_command(credit: UsageCredit) -> LedgerCommand {
    LedgerCommand::new(
        ORG,
        SUB,
        false,
        LedgerCommandPayload::CreditGrantRecognized(CreditGrantRecognizedPayload {
            usage_credit: credit,
        }),
    )
}

pub fn billing_period(id: &str, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> BillingPeriod {
    BillingPeriod {
        id: id.to_string(),
        subscription_id: SUB.to_string(),
        start_date,
        end_date,
    }
}

pub fn january() -> BillingPeriod {
    billing_period("bp_jan", date(2024, 1, 1), date(2024, 2, 1))
}

pub fn february() -> BillingPeriod {
    billing_period("bp_feb", date(2024, 2, 1), date(2024, 3, 1))
}

pub fn feature_item(
    id: &str,
    usage_meter_id: &str,
    amount: i64,
    renewal_frequency: FeatureRenewalFrequency,
) -> SubscriptionFeatureItem {
    SubscriptionFeatureItem {
        id: id.to_string(),
        subscription_id: SUB.to_string(),
        usage_meter_id: usage_meter_id.to_string(),
        amount,
        renewal_frequency,
    }
}

pub fn transition_command(
    previous_billing_period: Option<BillingPeriod>,
    new_billing_period: BillingPeriod,
    subscription_feature_items: Vec<SubscriptionFeatureItem>,
) -> LedgerCommand {
    LedgerCommand::new(
        ORG,
        SUB,
        false,
        LedgerCommandPayload::BillingPeriodTransition(BillingPeriodTransitionPayload {
            previous_billing_period,
            new_billing_period,
            subscription_feature_items,
        }),
    )
}

pub fn billing_run(id: &str) -> BillingRun {
    BillingRun {
        id: id.to_string(),
        organization_id: ORG.to_string(),
        subscription_id: SUB.to_string(),
        billing_period_id: "bp_jan".to_string(),
        livemode: false,
        status: BillingRunStatus::Succeeded,
    }
}

pub fn paid_invoice(id: &str, billing_run_id: &str) -> Invoice {
    Invoice {
        id: id.to_string(),
        organization_id: ORG.to_string(),
        subscription_id: Some(SUB.to_string()),
        livemode: false,
        status: InvoiceStatus::Paid,
        billing_run_id: Some(billing_run_id.to_string()),
        billing_period_id: Some("bp_jan".to_string()),
    }
}

pub fn usage_line_item(
    id: &str,
    invoice_id: &str,
    ledger_account_id: &str,
    ledger_account_credit: i64,
) -> InvoiceLineItem {
    InvoiceLineItem {
        id: id.to_string(),
        invoice_id: invoice_id.to_string(),
        line_item_type: InvoiceLineItemType::Usage,
        description: Some("API calls".to_string()),
        price: ledger_account_credit,
        quantity: 1,
        ledger_account_id: Some(ledger_account_id.to_string()),
        ledger_account_credit: Some(ledger_account_credit),
        billing_run_id: None,
    }
}

pub fn static_line_item(id: &str, invoice_id: &str, price: i64) -> InvoiceLineItem {
    InvoiceLineItem {
        id: id.to_string(),
        invoice_id: invoice_id.to_string(),
        line_item_type: InvoiceLineItemType::Static,
        description: Some("Platform fee".to_string()),
        price,
        quantity: 1,
        ledger_account_id: None,
        ledger_account_credit: None,
        billing_run_id: None,
    }
}

pub fn settle_command(invoice: Invoice, invoice_line_items: Vec<InvoiceLineItem>) -> LedgerCommand {
    LedgerCommand::new(
        ORG,
        SUB,
        false,
        LedgerCommandPayload::SettleInvoiceUsageCosts(SettleInvoiceUsageCostsPayload {
            invoice,
            invoice_line_items,
        }),
    )
}
