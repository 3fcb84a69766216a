pub mod audit;
pub mod billing;
pub mod lease_authorization;
pub mod notifications;
pub mod pdc_ledger;
pub mod policy;
pub mod reconciliation;
pub mod sealed;
