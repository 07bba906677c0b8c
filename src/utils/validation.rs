//! Validation utilities

use crate::commands::*;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::records::InvoiceStatus;

/// Validate that an identifier is present
pub fn validate_identifier(field: &str, value: &str) -> LedgerResult<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that an amount is not negative
pub fn validate_non_negative_amount(field: &str, amount: i64) -> LedgerResult<()> {
    if amount < 0 {
        Err(LedgerError::validation(format!(
            "{} must not be negative, got {}",
            field, amount
        )))
    } else {
        Ok(())
    }
}

/// Validate the optional transaction description and metadata
pub fn validate_transaction_annotations(
    command: &LedgerCommand,
    config: &LedgerConfig,
) -> LedgerResult<()> {
    if let Some(ref description) = command.transaction_description {
        if description.len() > config.max_description_length {
            return Err(LedgerError::validation(format!(
                "Transaction description cannot exceed {} characters",
                config.max_description_length
            )));
        }
    }

    if command.transaction_metadata.len() > config.max_metadata_entries {
        return Err(LedgerError::validation(format!(
            "Transaction metadata cannot exceed {} entries",
            config.max_metadata_entries
        )));
    }

    Ok(())
}

/// Check that a payload record lives in the command's organization, subscription and mode
fn validate_scope(
    record: &str,
    scope: &CommandScope,
    organization_id: &str,
    subscription_id: Option<&str>,
    livemode: bool,
) -> LedgerResult<()> {
    if organization_id != scope.organization_id {
        return Err(LedgerError::validation(format!(
            "{} belongs to organization {}, command targets {}",
            record, organization_id, scope.organization_id
        )));
    }

    if let Some(subscription_id) = subscription_id {
        if subscription_id != scope.subscription_id {
            return Err(LedgerError::validation(format!(
                "{} belongs to subscription {}, command targets {}",
                record, subscription_id, scope.subscription_id
            )));
        }
    }

    if livemode != scope.livemode {
        return Err(LedgerError::validation(format!(
            "{} livemode does not match the command",
            record
        )));
    }

    Ok(())
}

/// Validate a ledger command before anything is written
pub fn validate_ledger_command(command: &LedgerCommand, config: &LedgerConfig) -> LedgerResult<()> {
    validate_identifier("organization_id", &command.organization_id)?;
    validate_identifier("subscription_id", &command.subscription_id)?;
    validate_transaction_annotations(command, config)?;

    let scope = command.scope();

    match &command.payload {
        LedgerCommandPayload::UsageEventProcessed(payload) => {
            let event = &payload.usage_event;
            validate_identifier("usage_event.id", &event.id)?;
            validate_non_negative_amount("usage_event.amount", event.amount)?;
            validate_scope(
                "Usage event",
                &scope,
                &event.organization_id,
                Some(&event.subscription_id),
                event.livemode,
            )
        }
        LedgerCommandPayload::CreditGrantRecognized(payload) => {
            let credit = &payload.usage_credit;
            validate_identifier("usage_credit.id", &credit.id)?;
            validate_non_negative_amount("usage_credit.issued_amount", credit.issued_amount)?;
            validate_scope(
                "Usage credit",
                &scope,
                &credit.organization_id,
                Some(&credit.subscription_id),
                credit.livemode,
            )
        }
        LedgerCommandPayload::BillingPeriodTransition(payload) => {
            validate_billing_period_transition(&scope, payload)
        }
        LedgerCommandPayload::AdminCreditAdjusted(payload) => {
            let adjustment = &payload.credit_balance_adjustment;
            validate_identifier("credit_balance_adjustment.id", &adjustment.id)?;
            validate_identifier(
                "credit_balance_adjustment.adjusted_usage_credit_id",
                &adjustment.adjusted_usage_credit_id,
            )?;
            validate_non_negative_amount(
                "credit_balance_adjustment.amount_adjusted",
                adjustment.amount_adjusted,
            )?;
            validate_scope(
                "Credit balance adjustment",
                &scope,
                &adjustment.organization_id,
                None,
                adjustment.livemode,
            )
        }
        LedgerCommandPayload::CreditGrantExpired(payload) => {
            let credit = &payload.expired_credit;
            validate_identifier("expired_credit.id", &credit.id)?;
            validate_scope(
                "Expired credit",
                &scope,
                &credit.organization_id,
                Some(&credit.subscription_id),
                credit.livemode,
            )
        }
        LedgerCommandPayload::PaymentRefunded(payload) => {
            let refund = &payload.refund;
            validate_identifier("refund.id", &refund.id)?;
            validate_identifier("refund.payment_id", &refund.payment_id)?;
            validate_non_negative_amount("refund.amount", refund.amount)?;
            validate_scope(
                "Refund",
                &scope,
                &refund.organization_id,
                refund.subscription_id.as_deref(),
                refund.livemode,
            )
        }
        LedgerCommandPayload::SettleInvoiceUsageCosts(payload) => {
            validate_invoice_settlement(&scope, payload)
        }
    }
}

fn validate_billing_period_transition(
    scope: &CommandScope,
    payload: &BillingPeriodTransitionPayload,
) -> LedgerResult<()> {
    let period = &payload.new_billing_period;
    validate_identifier("new_billing_period.id", &period.id)?;

    if period.subscription_id != scope.subscription_id {
        return Err(LedgerError::validation(format!(
            "Billing period {} belongs to subscription {}, command targets {}",
            period.id, period.subscription_id, scope.subscription_id
        )));
    }

    if period.end_date <= period.start_date {
        return Err(LedgerError::validation(format!(
            "Billing period {} must end after it starts",
            period.id
        )));
    }

    if let Some(ref previous) = payload.previous_billing_period {
        if previous.id == period.id {
            return Err(LedgerError::validation(
                "Previous and new billing period cannot be the same".to_string(),
            ));
        }
        if previous.subscription_id != scope.subscription_id {
            return Err(LedgerError::validation(format!(
                "Previous billing period {} belongs to another subscription",
                previous.id
            )));
        }
    }

    for item in &payload.subscription_feature_items {
        validate_identifier("subscription_feature_item.id", &item.id)?;
        validate_identifier("subscription_feature_item.usage_meter_id", &item.usage_meter_id)?;
        validate_non_negative_amount("subscription_feature_item.amount", item.amount)?;
        if item.subscription_id != scope.subscription_id {
            return Err(LedgerError::validation(format!(
                "Feature item {} belongs to subscription {}",
                item.id, item.subscription_id
            )));
        }
    }

    Ok(())
}

fn validate_invoice_settlement(
    scope: &CommandScope,
    payload: &SettleInvoiceUsageCostsPayload,
) -> LedgerResult<()> {
    let invoice = &payload.invoice;
    validate_identifier("invoice.id", &invoice.id)?;

    let subscription_id = invoice.subscription_id.as_deref().ok_or_else(|| {
        LedgerError::validation(format!("Invoice {} has no subscription", invoice.id))
    })?;
    validate_scope(
        "Invoice",
        scope,
        &invoice.organization_id,
        Some(subscription_id),
        invoice.livemode,
    )?;

    if invoice.status != InvoiceStatus::Paid {
        return Err(LedgerError::validation(format!(
            "Invoice {} must be paid before its usage costs are settled, status is {:?}",
            invoice.id, invoice.status
        )));
    }

    for line_item in &payload.invoice_line_items {
        if line_item.invoice_id != invoice.id {
            return Err(LedgerError::validation(format!(
                "Line item {} does not belong to invoice {}",
                line_item.id, invoice.id
            )));
        }

        if !line_item.is_usage() {
            continue;
        }

        let account_id = line_item.ledger_account_id.as_deref().unwrap_or_default();
        validate_identifier("invoice_line_item.ledger_account_id", account_id)?;

        match line_item.ledger_account_credit {
            Some(credit) => {
                validate_non_negative_amount("invoice_line_item.ledger_account_credit", credit)?
            }
            None => {
                return Err(LedgerError::validation(format!(
                    "Usage line item {} has no ledger account credit",
                    line_item.id
                )))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::*;
    use chrono::{TimeZone, Utc};

    fn invoice(status: InvoiceStatus) -> Invoice {
        Invoice {
            id: "inv_1".to_string(),
            organization_id: "org_1".to_string(),
            subscription_id: Some("sub_1".to_string()),
            livemode: false,
            status,
            billing_run_id: Some("br_1".to_string()),
            billing_period_id: None,
        }
    }

    fn settle(invoice: Invoice, line_items: Vec<InvoiceLineItem>) -> LedgerCommand {
        LedgerCommand::new(
            "org_1",
            "sub_1",
            false,
            LedgerCommandPayload::SettleInvoiceUsageCosts(SettleInvoiceUsageCostsPayload {
                invoice,
                invoice_line_items: line_items,
            }),
        )
    }

    fn usage_line_item(credit: Option<i64>) -> InvoiceLineItem {
        InvoiceLineItem {
            id: "li_1".to_string(),
            invoice_id: "inv_1".to_string(),
            line_item_type: InvoiceLineItemType::Usage,
            description: None,
            price: 10,
            quantity: 10,
            ledger_account_id: Some("la_1".to_string()),
            ledger_account_credit: credit,
            billing_run_id: Some("br_1".to_string()),
        }
    }

    #[test]
    fn test_basic_validations() {
        assert!(validate_identifier("id", "abc").is_ok());
        assert!(validate_identifier("id", "  ").is_err());
        assert!(validate_non_negative_amount("amount", 0).is_ok());
        assert!(validate_non_negative_amount("amount", -1).is_err());
    }

    #[test]
    fn test_unpaid_invoice_is_rejected() {
        let config = LedgerConfig::default();
        let command = settle(invoice(InvoiceStatus::Open), vec![]);
        assert!(matches!(
            validate_ledger_command(&command, &config),
            Err(LedgerError::Validation(_))
        ));

        let command = settle(invoice(InvoiceStatus::Paid), vec![usage_line_item(Some(100))]);
        assert!(validate_ledger_command(&command, &config).is_ok());
    }

    #[test]
    fn test_usage_line_item_requires_credit_amount() {
        let config = LedgerConfig::default();
        let command = settle(invoice(InvoiceStatus::Paid), vec![usage_line_item(None)]);
        assert!(validate_ledger_command(&command, &config).is_err());
    }

    #[test]
    fn test_usage_event_from_other_subscription_is_rejected() {
        let config = LedgerConfig::default();
        let command = LedgerCommand::new(
            "org_1",
            "sub_1",
            false,
            LedgerCommandPayload::UsageEventProcessed(UsageEventProcessedPayload {
                usage_event: UsageEvent {
                    id: "ue_1".to_string(),
                    organization_id: "org_1".to_string(),
                    subscription_id: "sub_2".to_string(),
                    usage_meter_id: Some("um_1".to_string()),
                    livemode: false,
                    amount: 10,
                    usage_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                    billing_period_id: None,
                    price_id: None,
                },
            }),
        );

        let err = validate_ledger_command(&command, &config).unwrap_err();
        assert!(err.to_string().contains("sub_2"));
    }

    #[test]
    fn test_description_limit_comes_from_config() {
        let config = LedgerConfig {
            max_description_length: 5,
            ..Default::default()
        };
        let command = settle(invoice(InvoiceStatus::Paid), vec![]).description("too long");
        assert!(validate_ledger_command(&command, &config).is_err());
    }
}
