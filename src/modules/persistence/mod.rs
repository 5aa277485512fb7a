pub mod accounts;
pub mod db;
pub mod ledger;

pub use accounts::AccountStore;
pub use ledger::{ConsumptionRow, ModelQuotaRow, QuotaLedgerDb, SharedPoolRow};
