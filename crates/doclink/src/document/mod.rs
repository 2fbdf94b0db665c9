pub mod key;
pub mod transaction;

pub use key::DocumentKey;
pub use transaction::TransactionLedger;
