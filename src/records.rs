//! Upstream business records carried by ledger commands
//!
//! The ledger never fetches these itself; callers pass them in already loaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A metered usage event with its already-priced cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub organization_id: String,
    pub subscription_id: String,
    pub usage_meter_id: Option<String>,
    pub livemode: bool,
    /// Cost of the event in minor units
    pub amount: i64,
    pub usage_date: DateTime<Utc>,
    pub billing_period_id: Option<String>,
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: String,
    pub subscription_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingRunStatus {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRun {
    pub id: String,
    pub organization_id: String,
    pub subscription_id: String,
    pub billing_period_id: String,
    pub livemode: bool,
    pub status: BillingRunStatus,
}

/// How often a usage-credit feature is granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureRenewalFrequency {
    /// Granted on every billing period transition, expiring at the period end
    EveryBillingPeriod,
    /// Granted once, on the subscription's first billing period, never expiring
    Once,
}

/// A usage-credit entitlement active on a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFeatureItem {
    pub id: String,
    pub subscription_id: String,
    pub usage_meter_id: String,
    pub amount: i64,
    pub renewal_frequency: FeatureRenewalFrequency,
}

/// An admin-initiated reduction of a usage credit's balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditBalanceAdjustment {
    pub id: String,
    pub organization_id: String,
    pub adjusted_usage_credit_id: String,
    pub usage_meter_id: Option<String>,
    pub livemode: bool,
    pub amount_adjusted: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub organization_id: String,
    pub payment_id: String,
    pub subscription_id: Option<String>,
    pub livemode: bool,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub organization_id: String,
    pub subscription_id: Option<String>,
    pub livemode: bool,
    pub status: InvoiceStatus,
    /// Billing run that produced the invoice, if any
    pub billing_run_id: Option<String>,
    pub billing_period_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceLineItemType {
    /// Flat charges; never touch the ledger
    Static,
    /// Charges for metered usage on a ledger account
    Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: String,
    pub invoice_id: String,
    pub line_item_type: InvoiceLineItemType,
    pub description: Option<String>,
    pub price: i64,
    pub quantity: i64,
    /// Set on usage line items only
    pub ledger_account_id: Option<String>,
    /// Amount credited back to the ledger account once the invoice is paid
    pub ledger_account_credit: Option<i64>,
    pub billing_run_id: Option<String>,
}

impl InvoiceLineItem {
    pub fn is_usage(&self) -> bool {
        self.line_item_type == InvoiceLineItemType::Usage
    }
}
