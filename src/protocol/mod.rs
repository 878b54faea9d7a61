//! Line oriented wire protocol used by both network endpoints.

pub mod frame;
pub mod txn;

pub use frame::Frame;
pub use txn::{TxnCounter, TXN};
