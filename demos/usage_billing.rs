//! Usage billing walkthrough: entitlements, metered usage, claiming and settlement
//!
//! Run with `RUST_LOG=usage_ledger=debug` to see each step the ledger takes.

use chrono::{TimeZone, Utc};
use tracing_subscriber::EnvFilter;
use usage_ledger::{
    BalanceView, BillingPeriod, BillingPeriodTransitionPayload, BillingRun, BillingRunStatus,
    FeatureRenewalFrequency, Invoice, InvoiceLineItem, InvoiceLineItemType, InvoiceStatus, Ledger,
    LedgerCommand, LedgerCommandPayload, LedgerCommandResult, MemoryStorage,
    SettleInvoiceUsageCostsPayload, SubscriptionFeatureItem, UsageEvent,
    UsageEventProcessedPayload,
};

const ORG: &str = "org_acme";
const SUB: &str = "sub_pro";
const METER: &str = "um_api_calls";

async fn run(
    ledger: &Ledger,
    storage: &MemoryStorage,
    command: &LedgerCommand,
) -> Result<LedgerCommandResult, Box<dyn std::error::Error>> {
    let mut tx = storage.begin()?;
    let result = ledger.process_command(&mut tx, command).await?;
    tx.commit()?;
    println!(
        "  ✓ {} -> {} entries{}",
        result.ledger_transaction.transaction_type,
        result.ledger_entries.len(),
        if result.replayed { " (replayed)" } else { "" }
    );
    Ok(result)
}

fn usage(id: &str, amount: i64) -> LedgerCommand {
    LedgerCommand::new(
        ORG,
        SUB,
        false,
        LedgerCommandPayload::UsageEventProcessed(UsageEventProcessedPayload {
            usage_event: UsageEvent {
                id: id.to_string(),
                organization_id: ORG.to_string(),
                subscription_id: SUB.to_string(),
                usage_meter_id: Some(METER.to_string()),
                livemode: false,
                amount,
                usage_date: Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap(),
                billing_period_id: Some("bp_jan".to_string()),
                price_id: Some("price_per_call".to_string()),
            },
        }),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Usage Ledger - Billing Cycle Example\n");

    let storage = MemoryStorage::new();
    let ledger = Ledger::new();

    // 1. Open the first billing period with a monthly usage allowance
    println!("Opening January with 1,000 of included usage...");
    let january = BillingPeriod {
        id: "bp_jan".to_string(),
        subscription_id: SUB.to_string(),
        start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_date: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    };
    let allowance = SubscriptionFeatureItem {
        id: "sfi_included_calls".to_string(),
        subscription_id: SUB.to_string(),
        usage_meter_id: METER.to_string(),
        amount: 1000,
        renewal_frequency: FeatureRenewalFrequency::EveryBillingPeriod,
    };
    run(
        &ledger,
        &storage,
        &LedgerCommand::new(
            ORG,
            SUB,
            false,
            LedgerCommandPayload::BillingPeriodTransition(BillingPeriodTransitionPayload {
                previous_billing_period: None,
                new_billing_period: january,
                subscription_feature_items: vec![allowance],
            }),
        ),
    )
    .await?;

    // 2. Record metered usage; the allowance covers the first 1,000
    println!("\nRecording usage...");
    run(&ledger, &storage, &usage("ue_001", 600)).await?;
    run(&ledger, &storage, &usage("ue_002", 700)).await?;
    run(&ledger, &storage, &usage("ue_002", 700)).await?;

    let account_id = storage
        .ledger_accounts()?
        .into_iter()
        .find(|a| a.usage_meter_id.as_deref() == Some(METER))
        .map(|a| a.id)
        .ok_or("ledger account was not created")?;

    let tx = storage.begin()?;
    let outstanding = ledger
        .outstanding_usage_costs(&tx, &[account_id.clone()], BalanceView::Available)
        .await?;
    for cost in &outstanding {
        println!("  • {} still owes {}", cost.usage_event_id, cost.outstanding);
    }
    drop(tx);

    // 3. The billing run claims the overage and the customer pays the invoice
    println!("\nBilling the overage...");
    let billing_run = BillingRun {
        id: "br_jan".to_string(),
        organization_id: ORG.to_string(),
        subscription_id: SUB.to_string(),
        billing_period_id: "bp_jan".to_string(),
        livemode: false,
        status: BillingRunStatus::Succeeded,
    };
    storage.insert_billing_run(billing_run.clone())?;

    let mut tx = storage.begin()?;
    let claimed = ledger
        .claim_outstanding_usage_costs(&mut tx, &billing_run)
        .await?;
    tx.commit()?;
    let overage: i64 = outstanding.iter().map(|c| c.outstanding).sum();
    println!("  ✓ Claimed {} usage cost(s) totalling {}", claimed.len(), overage);

    let invoice = Invoice {
        id: "inv_jan".to_string(),
        organization_id: ORG.to_string(),
        subscription_id: Some(SUB.to_string()),
        livemode: false,
        status: InvoiceStatus::Paid,
        billing_run_id: Some(billing_run.id.clone()),
        billing_period_id: Some("bp_jan".to_string()),
    };
    let line_items = vec![
        InvoiceLineItem {
            id: "li_platform".to_string(),
            invoice_id: invoice.id.clone(),
            line_item_type: InvoiceLineItemType::Static,
            description: Some("Pro plan".to_string()),
            price: 4900,
            quantity: 1,
            ledger_account_id: None,
            ledger_account_credit: None,
            billing_run_id: None,
        },
        InvoiceLineItem {
            id: "li_api_calls".to_string(),
            invoice_id: invoice.id.clone(),
            line_item_type: InvoiceLineItemType::Usage,
            description: Some("API call overage".to_string()),
            price: overage,
            quantity: 1,
            ledger_account_id: Some(account_id.clone()),
            ledger_account_credit: Some(overage),
            billing_run_id: Some(billing_run.id.clone()),
        },
    ];
    run(
        &ledger,
        &storage,
        &LedgerCommand::new(
            ORG,
            SUB,
            false,
            LedgerCommandPayload::SettleInvoiceUsageCosts(SettleInvoiceUsageCostsPayload {
                invoice,
                invoice_line_items: line_items,
            }),
        ),
    )
    .await?;

    // 4. Balances
    println!("\nBalances:");
    let tx = storage.begin()?;
    let posted = ledger
        .get_account_balance(&tx, &account_id, BalanceView::Posted)
        .await?;
    let available = ledger
        .get_account_balance(&tx, &account_id, BalanceView::Available)
        .await?;
    println!("  Posted:    {}", posted);
    println!("  Available: {}", available);

    for credit in ledger
        .credit_balances(&tx, &[account_id], BalanceView::Available)
        .await?
    {
        println!(
            "  Credit {} has {} left (expires {:?})",
            credit.usage_credit_id, credit.balance, credit.expires_at
        );
    }

    Ok(())
}
