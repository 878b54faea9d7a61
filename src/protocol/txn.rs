//! Transaction identifiers.
//!
//! Every request to the signing service carries a `Txn` header and
//! the reply must echo it back.  Identifiers only need to be unique
//! per client, so a counter is enough.

use std::sync::atomic::{AtomicU64, Ordering};

pub const TXN: &str = "Txn";

/// Monotonic transaction counter.
#[derive(Debug)]
pub struct TxnCounter {
    counter: AtomicU64,
}

impl Default for TxnCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnCounter {
    /// The first call to [`next`](Self::next) returns `"T-1"`.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("T-{}", n)
    }
}
