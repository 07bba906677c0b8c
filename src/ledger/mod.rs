//! Ledger module containing account resolution, balances, credit application
//! and command processing

pub mod account;
pub mod balance;
pub mod core;
pub mod credit_application;
pub mod lifecycle;
pub mod transaction;

pub use self::core::*;
pub use account::*;
pub use balance::*;
pub use credit_application::*;
pub use lifecycle::*;
pub use transaction::*;
