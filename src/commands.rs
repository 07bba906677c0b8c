//! Ledger commands: the typed business events the ledger records

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::records::*;
use crate::types::*;

/// Organization, subscription and mode a command is confined to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandScope {
    pub organization_id: String,
    pub subscription_id: String,
    pub livemode: bool,
}

/// A business event to record, plus the common fields every command carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCommand {
    pub organization_id: String,
    pub livemode: bool,
    pub subscription_id: String,
    #[serde(default)]
    pub transaction_description: Option<String>,
    #[serde(default)]
    pub transaction_metadata: HashMap<String, String>,
    #[serde(flatten)]
    pub payload: LedgerCommandPayload,
}

impl LedgerCommand {
    /// Create a new command without description or metadata
    pub fn new(
        organization_id: impl Into<String>,
        subscription_id: impl Into<String>,
        livemode: bool,
        payload: LedgerCommandPayload,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            livemode,
            subscription_id: subscription_id.into(),
            transaction_description: None,
            transaction_metadata: HashMap::new(),
            payload,
        }
    }

    /// Set the description recorded on the ledger transaction
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.transaction_description = Some(description.into());
        self
    }

    /// Add metadata recorded on the ledger transaction
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.transaction_metadata.insert(key.into(), value.into());
        self
    }

    pub fn transaction_type(&self) -> LedgerTransactionType {
        self.payload.transaction_type()
    }

    pub fn scope(&self) -> CommandScope {
        CommandScope {
            organization_id: self.organization_id.clone(),
            subscription_id: self.subscription_id.clone(),
            livemode: self.livemode,
        }
    }

    /// Key under which at most one ledger transaction may exist for this command
    pub fn idempotency_key(&self) -> IdempotencyKey {
        let (initiating_source_type, initiating_source_id) = self.payload.initiating_source();
        IdempotencyKey {
            transaction_type: self.transaction_type(),
            initiating_source_type,
            initiating_source_id: initiating_source_id.to_string(),
            organization_id: self.organization_id.clone(),
            livemode: self.livemode,
        }
    }
}

/// Type-specific payload; the variant is the command type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum LedgerCommandPayload {
    UsageEventProcessed(UsageEventProcessedPayload),
    CreditGrantRecognized(CreditGrantRecognizedPayload),
    BillingPeriodTransition(BillingPeriodTransitionPayload),
    AdminCreditAdjusted(AdminCreditAdjustedPayload),
    CreditGrantExpired(CreditGrantExpiredPayload),
    PaymentRefunded(PaymentRefundedPayload),
    SettleInvoiceUsageCosts(SettleInvoiceUsageCostsPayload),
}

impl LedgerCommandPayload {
    pub fn transaction_type(&self) -> LedgerTransactionType {
        match self {
            LedgerCommandPayload::UsageEventProcessed(_) => {
                LedgerTransactionType::UsageEventProcessed
            }
            LedgerCommandPayload::CreditGrantRecognized(_) => {
                LedgerTransactionType::CreditGrantRecognized
            }
            LedgerCommandPayload::BillingPeriodTransition(_) => {
                LedgerTransactionType::BillingPeriodTransition
            }
            LedgerCommandPayload::AdminCreditAdjusted(_) => {
                LedgerTransactionType::AdminCreditAdjusted
            }
            LedgerCommandPayload::CreditGrantExpired(_) => LedgerTransactionType::CreditGrantExpired,
            LedgerCommandPayload::PaymentRefunded(_) => LedgerTransactionType::PaymentRefunded,
            LedgerCommandPayload::SettleInvoiceUsageCosts(_) => {
                LedgerTransactionType::SettleInvoiceUsageCosts
            }
        }
    }

    /// The record whose identity makes this business event unique
    pub fn initiating_source(&self) -> (InitiatingSourceType, &str) {
        match self {
            LedgerCommandPayload::UsageEventProcessed(p) => {
                (InitiatingSourceType::UsageEvent, &p.usage_event.id)
            }
            LedgerCommandPayload::CreditGrantRecognized(p) => {
                (InitiatingSourceType::UsageCredit, &p.usage_credit.id)
            }
            LedgerCommandPayload::BillingPeriodTransition(p) => {
                (InitiatingSourceType::BillingPeriod, &p.new_billing_period.id)
            }
            LedgerCommandPayload::AdminCreditAdjusted(p) => (
                InitiatingSourceType::CreditBalanceAdjustment,
                &p.credit_balance_adjustment.id,
            ),
            LedgerCommandPayload::CreditGrantExpired(p) => {
                (InitiatingSourceType::UsageCredit, &p.expired_credit.id)
            }
            LedgerCommandPayload::PaymentRefunded(p) => {
                (InitiatingSourceType::Refund, &p.refund.id)
            }
            LedgerCommandPayload::SettleInvoiceUsageCosts(p) => {
                (InitiatingSourceType::Invoice, &p.invoice.id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEventProcessedPayload {
    pub usage_event: UsageEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGrantRecognizedPayload {
    pub usage_credit: UsageCredit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriodTransitionPayload {
    /// `None` on the subscription's first billing period
    pub previous_billing_period: Option<BillingPeriod>,
    pub new_billing_period: BillingPeriod,
    #[serde(default)]
    pub subscription_feature_items: Vec<SubscriptionFeatureItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminCreditAdjustedPayload {
    pub credit_balance_adjustment: CreditBalanceAdjustment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGrantExpiredPayload {
    pub expired_credit: UsageCredit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefundedPayload {
    pub refund: Refund,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleInvoiceUsageCostsPayload {
    pub invoice: Invoice,
    pub invoice_line_items: Vec<InvoiceLineItem>,
}

/// Uniform outcome of a processed (or replayed) command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCommandResult {
    pub ledger_transaction: LedgerTransaction,
    pub ledger_entries: Vec<LedgerEntry>,
    /// True when an existing transaction was returned instead of writing a new one
    pub replayed: bool,
}

impl LedgerCommandResult {
    /// Result for a transaction written by this call
    pub fn recorded(ledger_transaction: LedgerTransaction, ledger_entries: Vec<LedgerEntry>) -> Self {
        Self {
            ledger_transaction,
            ledger_entries,
            replayed: false,
        }
    }

    /// Result for a transaction found under the command's idempotency key
    pub fn replayed(ledger_transaction: LedgerTransaction, ledger_entries: Vec<LedgerEntry>) -> Self {
        Self {
            ledger_transaction,
            ledger_entries,
            replayed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn usage_command() -> LedgerCommand {
        LedgerCommand::new(
            "org_1",
            "sub_1",
            false,
            LedgerCommandPayload::UsageEventProcessed(UsageEventProcessedPayload {
                usage_event: UsageEvent {
                    id: "ue_1".to_string(),
                    organization_id: "org_1".to_string(),
                    subscription_id: "sub_1".to_string(),
                    usage_meter_id: Some("um_1".to_string()),
                    livemode: false,
                    amount: 100,
                    usage_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                    billing_period_id: None,
                    price_id: None,
                },
            }),
        )
    }

    #[test]
    fn test_idempotency_key_comes_from_payload() {
        let command = usage_command().description("api call");
        let key = command.idempotency_key();

        assert_eq!(key.transaction_type, LedgerTransactionType::UsageEventProcessed);
        assert_eq!(key.initiating_source_type, InitiatingSourceType::UsageEvent);
        assert_eq!(key.initiating_source_id, "ue_1");
        assert_eq!(key.organization_id, "org_1");
        assert!(!key.livemode);
    }

    #[test]
    fn test_command_wire_format_is_tagged() {
        let command = usage_command();
        let json = serde_json::to_value(&command).unwrap();

        assert_eq!(json["type"], "UsageEventProcessed");
        assert_eq!(json["payload"]["usage_event"]["id"], "ue_1");

        let parsed: LedgerCommand = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, command);
    }
}
