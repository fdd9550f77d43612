pub mod handlers;
pub mod ledger;

pub use ledger::CreditLedger;
