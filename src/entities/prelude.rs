#![allow(unused_imports)]

pub use super::purchase_transaction::Entity as PurchaseTransaction;
pub use super::security_event::Entity as SecurityEvent;
