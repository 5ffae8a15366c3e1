pub mod concurrency;

pub use concurrency::{
    AbortReason, IsolationLevel, LockManager, Transaction, TransactionError, TransactionManager,
    TransactionState,
};
