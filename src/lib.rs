//! # Usage Ledger
//!
//! The accounting core of a usage-based billing platform: turns business events
//! into immutable, double-entry ledger records that always reconcile to a correct
//! account balance.
//!
//! ## Features
//!
//! - **Command dispatch**: one ledger transaction per business event, enforced by an idempotency key
//! - **Credit application**: greedy, soonest-expiring-first allocation of credit against usage cost
//! - **Billing period transitions**: overage settlement, credit expiration and entitlement grants
//! - **Invoice settlement**: posted payment credits applied to the usage a billing run claimed
//! - **Balances**: posted and available views recomputed from the entry log
//! - **Storage abstraction**: database-agnostic design with trait-based storage
//!
//! ## Quick Start
//!
//! ```rust
//! use usage_ledger::{Ledger, LedgerCommand, LedgerCommandPayload, MemoryStorage};
//! use usage_ledger::{UsageEvent, UsageEventProcessedPayload};
//! use chrono::Utc;
//!
//! # tokio_test_block(async {
//! let storage = MemoryStorage::new();
//! let ledger = Ledger::new();
//! let mut tx = storage.begin().unwrap();
//!
//! let command = LedgerCommand::new(
//!     "org_1",
//!     "sub_1",
//!     false,
//!     LedgerCommandPayload::UsageEventProcessed(UsageEventProcessedPayload {
//!         usage_event: UsageEvent {
//!             id: "ue_1".to_string(),
//!             organization_id: "org_1".to_string(),
//!             subscription_id: "sub_1".to_string(),
//!             usage_meter_id: Some("um_api_calls".to_string()),
//!             livemode: false,
//!             amount: 1200,
//!             usage_date: Utc::now(),
//!             billing_period_id: None,
//!             price_id: None,
//!         },
//!     }),
//! );
//!
//! let result = ledger.process_command(&mut tx, &command).await.unwrap();
//! tx.commit().unwrap();
//! assert_eq!(result.ledger_entries.len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod records;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use commands::*;
pub use config::*;
pub use error::*;
pub use ledger::*;
pub use records::*;
pub use traits::*;
pub use types::*;

// Re-export the in-memory store for tests and demos
pub use utils::memory_storage::{MemoryStorage, MemoryTransaction};
