//! Command handlers, one per ledger command type
//!
//! Each handler writes exactly one ledger transaction through the storage handle
//! it is given and returns it with the entries it produced.

pub mod admin_adjustment;
pub mod billing_period_transition;
pub mod credit_grant;
pub mod credit_grant_expired;
pub mod payment_refunded;
pub mod settle_invoice;
pub mod usage_event;

pub use admin_adjustment::*;
pub use billing_period_transition::*;
pub use credit_grant::*;
pub use credit_grant_expired::*;
pub use payment_refunded::*;
pub use settle_invoice::*;
pub use usage_event::*;
